//! Shared state of one verification run
//!
//! Every worker of a run reads and writes the same [`Run`]. The queue and the
//! bypass bookkeeping sit behind one short-held lock; nothing awaits while it
//! is held.

use crate::proxy::models::{BypassProxy, Proxy};
use crate::verify::progress::ProgressTracker;
use crate::verify::Strategy;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Default)]
struct RunState {
    queue: VecDeque<Proxy>,
    total: usize,
    bypass_current: Option<BypassProxy>,
    bypass_reserve: VecDeque<BypassProxy>,
    /// Bypass proxies that failed the transport probe during this run
    bypass_blocked: HashSet<(String, u16)>,
    requeued: usize,
    accepted: usize,
    rejected: usize,
    dropped: usize,
}

impl RunState {
    fn is_blocked(&self, bypass: &BypassProxy) -> bool {
        self.bypass_blocked
            .contains(&(bypass.host.clone(), bypass.port))
    }

    fn pop_reserve(&mut self) -> Option<BypassProxy> {
        while let Some(candidate) = self.bypass_reserve.pop_front() {
            if !self.is_blocked(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Point-in-time view of a run, for display
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub id: Uuid,
    pub strategy: Strategy,
    pub limit: usize,
    pub total: usize,
    pub remaining: usize,
    pub requeued: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub bypass: Option<String>,
    pub percent: u8,
    pub finished: bool,
}

/// One verification run: queue, bypass state, cancellation and completion
pub struct Run {
    id: Uuid,
    strategy: Strategy,
    limit: usize,
    cancel: CancellationToken,
    state: Mutex<RunState>,
    finished: watch::Sender<bool>,
}

impl Run {
    pub fn new(strategy: Strategy, limit: usize, candidates: Vec<Proxy>, bypass: Vec<BypassProxy>) -> Self {
        let (finished, _) = watch::channel(false);
        let state = RunState {
            total: candidates.len(),
            queue: candidates.into(),
            bypass_reserve: bypass.into(),
            ..Default::default()
        };

        Self {
            id: Uuid::new_v4(),
            strategy,
            limit: limit.max(1),
            cancel: CancellationToken::new(),
            state: Mutex::new(state),
            finished,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the run and empty its queues
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock();
        state.queue.clear();
        state.bypass_reserve.clear();
    }

    pub fn dequeue(&self) -> Option<Proxy> {
        self.state.lock().queue.pop_front()
    }

    /// Put a candidate back at the end of the queue
    pub fn requeue(&self, proxy: Proxy) {
        let mut state = self.state.lock();
        state.queue.push_back(proxy);
        state.requeued += 1;
    }

    /// Give up on a candidate for the rest of the run
    pub fn drop_candidate(&self, _proxy: Proxy) {
        self.state.lock().dropped += 1;
    }

    pub fn mark_accepted(&self) {
        self.state.lock().accepted += 1;
    }

    pub fn mark_rejected(&self) {
        self.state.lock().rejected += 1;
    }

    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn requeue_count(&self) -> usize {
        self.state.lock().requeued
    }

    pub fn progress(&self) -> u8 {
        let state = self.state.lock();
        ProgressTracker::percent(state.total, state.queue.len())
    }

    pub fn current_bypass(&self) -> Option<BypassProxy> {
        self.state.lock().bypass_current.clone()
    }

    /// Route lookups through `bypass`, taking it out of the reserve
    pub fn set_current_bypass(&self, bypass: Option<BypassProxy>) {
        let mut state = self.state.lock();
        if let Some(chosen) = &bypass {
            state
                .bypass_reserve
                .retain(|b| (b.host.as_str(), b.port) != (chosen.host.as_str(), chosen.port));
        }
        state.bypass_current = bypass;
    }

    /// Requeue `proxy` and switch to the next reserve bypass proxy.
    ///
    /// Returns the new bypass proxy, or `None` when the reserve is used up; the
    /// candidate is requeued either way.
    pub fn rotate_bypass(&self, proxy: Proxy) -> Option<BypassProxy> {
        let mut state = self.state.lock();
        state.queue.push_back(proxy);
        state.requeued += 1;

        let next = state.pop_reserve()?;
        state.bypass_current = Some(next.clone());
        Some(next)
    }

    pub fn bypass_reserve_len(&self) -> usize {
        self.state.lock().bypass_reserve.len()
    }

    pub fn mark_bypass_blocked(&self, bypass: &BypassProxy) {
        self.state
            .lock()
            .bypass_blocked
            .insert((bypass.host.clone(), bypass.port));
    }

    pub fn is_bypass_blocked(&self, bypass: &BypassProxy) -> bool {
        self.state.lock().is_blocked(bypass)
    }

    /// Signal that no worker of this run is left
    pub fn finish(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once [`finish`](Self::finish) has been called
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.state.lock();
        RunSnapshot {
            id: self.id,
            strategy: self.strategy,
            limit: self.limit,
            total: state.total,
            remaining: state.queue.len(),
            requeued: state.requeued,
            accepted: state.accepted,
            rejected: state.rejected,
            dropped: state.dropped,
            bypass: state.bypass_current.as_ref().map(|b| b.to_string()),
            percent: ProgressTracker::percent(state.total, state.queue.len()),
            finished: self.is_finished(),
        }
    }
}
