//! Verification pipeline
//!
//! This module provides:
//! - Run state shared by the workers of one verification run
//! - The API and scrape verification strategies
//! - The challenge bypass negotiator that primes the solver session
//! - A client for the challenge solver service

pub mod api;
pub mod negotiator;
pub mod progress;
pub mod scrape;
pub mod solver;
pub mod state;

pub use api::{IpqsApi, ScoreApi};
pub use negotiator::ChallengeBypassNegotiator;
pub use progress::ProgressTracker;
pub use solver::{FlareSolverrClient, SolverClient, SolverCommand, SolverResponse};
pub use state::{Run, RunSnapshot};

use crate::config::Config;
use crate::proxy::models::{Proxy, VerificationRecord};
use crate::proxy::{GeoLocator, TransportProbe};
use crate::store::ProxyStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How candidates are scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Token-authenticated JSON API
    Api,
    /// Public lookup page loaded through the challenge solver
    Scrape,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Api => f.write_str("api"),
            Strategy::Scrape => f.write_str("scrape"),
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api" => Ok(Strategy::Api),
            "scrape" => Ok(Strategy::Scrape),
            _ => Err(anyhow::anyhow!("Invalid strategy: {}. Use: api, scrape", s)),
        }
    }
}

/// Everything a verification worker needs
pub struct RunContext {
    pub run: Arc<Run>,
    pub store: Arc<dyn ProxyStore>,
    pub config: Arc<Config>,
    pub probe: TransportProbe,
    pub geo: Option<GeoLocator>,
}

impl RunContext {
    /// Persist a clean record, log anything else
    pub async fn record_outcome(&self, record: VerificationRecord, proxy: &Proxy) {
        if !record.is_clean() {
            self.run.mark_rejected();
            info!(
                proxy = %proxy,
                fraud_score = ?record.fraud_score,
                "proxy rejected"
            );
            return;
        }

        let mut record = record.tagged(proxy);
        if let (Some(geo), Some(egress)) = (&self.geo, proxy.real_address.as_deref()) {
            geo.enrich(&mut record, egress);
        }

        match self.store.add_record(&record).await {
            Ok(id) => {
                self.run.mark_accepted();
                info!(proxy = %proxy, record = id, "clean proxy recorded");
            }
            Err(e) => error!(proxy = %proxy, "failed to store result: {:#}", e),
        }
    }

    /// Sleep for `delay` unless the run is cancelled first. Returns false on cancellation.
    pub async fn pause(&self, delay: Duration) -> bool {
        let cancel = self.run.cancel_token();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
