//! Proxy Vetter - concurrent proxy verification
//!
//! Scores stored proxies for fraud risk through either a token-authenticated
//! API or a public lookup page behind an anti-bot challenge, keeping only the
//! clean ones. Proxies are imported in batches, probed for the protocol they
//! speak and tracked by the address they exit from.

pub mod batch;
pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod refresh;
pub mod service;
pub mod store;
pub mod tui;
pub mod verify;

pub use config::Config;
pub use error::{CheckError, StartError};
pub use pool::{PoolHandle, PoolRegistry, WorkerPool};
pub use proxy::*;
pub use service::{RunId, VetterService};
pub use store::{ProxyStore, SqliteStore};
pub use verify::Strategy;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
