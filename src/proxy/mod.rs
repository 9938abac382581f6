//! Proxy module
//!
//! This module provides:
//! - Proxy, bypass proxy, token and verification record models
//! - Parsing proxy lists in the common text formats
//! - Detecting which protocol a proxy speaks
//! - Optional offline geolocation of egress addresses

pub mod geo;
pub mod models;
pub mod parser;
pub mod probe;

pub use geo::{GeoLocation, GeoLocator};
pub use models::{
    ApiToken, BlockedProxy, BypassProxy, Proxy, ProxyAuth, ProxyEndpoint, ProxyType,
    VerificationRecord,
};
pub use parser::ProxyParser;
pub use probe::{HttpLivenessCheck, LivenessCheck, Transport, TransportProbe};
