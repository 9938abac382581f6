//! Gets the solver session past the target's anti-bot challenge before scraping starts

use crate::proxy::models::BypassProxy;
use crate::verify::solver::{SolverClient, SolverCommand};
use crate::verify::RunContext;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout widening per bypass proxy rotation
const CEILING_STEP: Duration = Duration::from_secs(1);

fn random_timeout(min: Duration, ceiling: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (ceiling.as_millis() as u64).max(min_ms);
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

pub struct ChallengeBypassNegotiator {
    ctx: Arc<RunContext>,
    solver: Arc<dyn SolverClient>,
    /// Bypass proxies still to try, separate from the run's reserve
    queue: Mutex<VecDeque<BypassProxy>>,
}

impl ChallengeBypassNegotiator {
    pub fn new(ctx: Arc<RunContext>, solver: Arc<dyn SolverClient>) -> Self {
        Self {
            ctx,
            solver,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Destroy the named browser session and create it anew
    pub async fn rebuild_session(&self) {
        let session = &self.ctx.config.session_name;
        if let Err(e) = self.solver.destroy_session(session).await {
            debug!(session = %session, "destroy before rebuild failed: {}", e);
        }
        match self.solver.create_session(session).await {
            Ok(response) if response.is_error() => {
                warn!(session = %session, message = ?response.message, "solver refused to create session");
            }
            Ok(_) => info!(session = %session, "solver session created"),
            Err(e) => warn!(session = %session, "failed to create solver session: {}", e),
        }
    }

    fn pop_candidate(&self) -> Option<BypassProxy> {
        let mut queue = self.queue.lock();
        while let Some(candidate) = queue.pop_front() {
            if !self.ctx.run.is_bypass_blocked(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Next bypass proxy to try, reloading the queue from the store when it runs dry
    async fn next_candidate(&self) -> Option<BypassProxy> {
        if let Some(candidate) = self.pop_candidate() {
            return Some(candidate);
        }
        match self.ctx.store.list_bypass_proxies().await {
            Ok(all) => self.queue.lock().extend(all),
            Err(e) => warn!("failed to reload bypass proxies: {:#}", e),
        }
        self.pop_candidate()
    }

    /// Keep loading the challenge page until it comes back clean.
    ///
    /// Returns true once the page loaded; the bypass proxy it loaded through
    /// (if any) becomes the run's current one. Returns false if the run was
    /// cancelled or its queue ran empty first.
    pub async fn negotiate(&self) -> bool {
        let config = &self.ctx.config;
        let run = &self.ctx.run;
        let cancel = run.cancel_token();
        let mut ceiling = config.ceiling_min;
        let mut pending: Option<BypassProxy> = None;

        while !run.is_cancelled() && run.remaining() > 0 {
            let mut descriptor = None;
            if let Some(candidate) = pending.clone() {
                if run.is_bypass_blocked(&candidate) {
                    pending = None;
                } else {
                    let endpoint = candidate.endpoint();
                    let detected = tokio::select! {
                        _ = cancel.cancelled() => break,
                        detected = self.ctx.probe.detect(&endpoint) => detected,
                    };
                    match detected {
                        Some(transport) => descriptor = Some(endpoint.descriptor(transport.kind)),
                        None => {
                            warn!(bypass = %candidate, "bypass proxy unreachable, marking dead");
                            run.mark_bypass_blocked(&candidate);
                            pending = None;
                        }
                    }
                }
            }

            let timeout = random_timeout(config.ceiling_min, ceiling);
            let command = SolverCommand::get(
                config.challenge_url.clone(),
                &config.session_name,
                timeout,
                descriptor.clone(),
            );

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.solver.send(&command) => outcome,
            };
            match outcome {
                Ok(response) if response.is_solved() => {
                    info!(bypass = ?descriptor, "challenge passed");
                    run.set_current_bypass(pending);
                    return true;
                }
                Ok(response) if response.solution.is_some() => {
                    debug!(
                        bypass = ?descriptor,
                        status = ?response.solution.as_ref().and_then(|s| s.status),
                        "challenge not passed, retrying with the same route"
                    );
                }
                outcome => {
                    if let Err(e) = outcome {
                        debug!(bypass = ?descriptor, "challenge request failed: {}", e);
                    }
                    pending = self.next_candidate().await;
                    ceiling = (ceiling + CEILING_STEP).min(config.ceiling_max);
                    debug!(next = ?pending.as_ref().map(|p| p.to_string()), ceiling = ?ceiling, "rotating bypass proxy");
                }
            }

            if !self.ctx.pause(config.retry_delay).await {
                break;
            }
        }

        if run.is_cancelled() {
            info!("challenge negotiation abandoned, run cancelled");
        }
        false
    }
}
