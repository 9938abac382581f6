//! TUI module for terminal user interfaces

mod run_monitor;

pub use run_monitor::RunMonitor;
