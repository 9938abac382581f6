//! Periodic egress refresh
//!
//! Back-connect proxies rotate their exit address. Every interval the first
//! reachable stored proxy is asked for its egress; when that changed, every
//! stored proxy is probed again and its egress and protocol are updated.

use crate::config::Config;
use crate::pool::{Worker, WorkerPool};
use crate::proxy::models::Proxy;
use crate::proxy::TransportProbe;
use crate::store::ProxyStore;
use crate::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool name of the refresh job, so that only one runs at a time
const REFRESH_POOL: &str = "egress-refresh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    NothingStored,
    NoReachableProxy,
    Unchanged,
    Refreshed { updated: usize, total: usize },
}

struct RefreshJob {
    queue: Mutex<VecDeque<Proxy>>,
    store: Arc<dyn ProxyStore>,
    probe: TransportProbe,
    egress_url: String,
    updated: AtomicUsize,
}

async fn refresh_worker(worker: Worker<RefreshJob>) {
    let job = &worker.shared;
    while !worker.cancel.is_cancelled() {
        let next = job.queue.lock().pop_front();
        let Some(proxy) = next else {
            break;
        };

        let Some(transport) = job.probe.detect(&proxy.endpoint()).await else {
            debug!(proxy = %proxy, "unreachable during refresh");
            continue;
        };
        let egress = match transport.egress_address(&job.egress_url).await {
            Ok(egress) => egress,
            Err(e) => {
                debug!(proxy = %proxy, "egress lookup failed: {:#}", e);
                continue;
            }
        };

        match job.store.update_egress(proxy.id, &egress, transport.kind).await {
            Ok(()) => {
                job.updated.fetch_add(1, Ordering::Relaxed);
                debug!(proxy = %proxy, egress = %egress, "egress refreshed");
            }
            Err(e) => warn!(proxy = %proxy, "failed to store egress: {:#}", e),
        }
    }
}

pub struct EgressRefresher {
    store: Arc<dyn ProxyStore>,
    probe: TransportProbe,
    config: Arc<Config>,
}

impl EgressRefresher {
    pub fn new(store: Arc<dyn ProxyStore>, probe: TransportProbe, config: Arc<Config>) -> Self {
        Self { store, probe, config }
    }

    /// The first stored proxy that tunnels, with the egress it shows now
    async fn sample(&self, proxies: &[Proxy]) -> Option<(Proxy, String)> {
        for proxy in proxies {
            let Some(transport) = self.probe.detect(&proxy.endpoint()).await else {
                continue;
            };
            match transport.egress_address(&self.config.egress_url).await {
                Ok(egress) => return Some((proxy.clone(), egress)),
                Err(e) => debug!(proxy = %proxy, "egress lookup failed: {:#}", e),
            }
        }
        None
    }

    /// Re-probe every proxy in `proxies`. Returns how many were updated.
    pub async fn refresh_all(&self, proxies: Vec<Proxy>) -> usize {
        let job = Arc::new(RefreshJob {
            queue: Mutex::new(proxies.into()),
            store: Arc::clone(&self.store),
            probe: self.probe.clone(),
            egress_url: self.config.egress_url.clone(),
            updated: AtomicUsize::new(0),
        });

        WorkerPool::new(Arc::clone(&job), refresh_worker)
            .named(REFRESH_POOL)
            .limit(self.config.refresh_concurrency)
            .start()
            .wait()
            .await;

        job.updated.load(Ordering::Relaxed)
    }

    pub async fn check_once(&self) -> Result<RefreshOutcome> {
        let proxies = self.store.list_proxies().await?;
        if proxies.is_empty() {
            return Ok(RefreshOutcome::NothingStored);
        }

        let Some((sample, egress)) = self.sample(&proxies).await else {
            warn!("no stored proxy is reachable");
            return Ok(RefreshOutcome::NoReachableProxy);
        };
        if sample.real_address.as_deref() == Some(egress.as_str()) {
            debug!(proxy = %sample, "egress unchanged");
            return Ok(RefreshOutcome::Unchanged);
        }

        info!(proxy = %sample, egress = %egress, "egress changed, refreshing all proxies");
        let total = proxies.len();
        let updated = self.refresh_all(proxies).await;
        info!(updated, total, "egress refresh done");
        Ok(RefreshOutcome::Refreshed { updated, total })
    }

    /// Check every refresh interval until cancelled
    pub async fn watch(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("egress check failed: {:#}", e);
                    }
                }
            }
        }
        info!("egress watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::ProxyType;
    use crate::proxy::probe::tests::{serve_text, ScriptedCheck};
    use crate::store::SqliteStore;

    async fn refresher(working: Vec<ProxyType>) -> (EgressRefresher, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let mut config = Config::default();
        config.egress_url = serve_text("198.51.100.99").await;
        let probe = TransportProbe::with_check(Arc::new(ScriptedCheck::new(working)));
        (EgressRefresher::new(store.clone(), probe, Arc::new(config)), store)
    }

    async fn stored(store: &SqliteStore, host: &str, egress: &str) {
        let mut proxy = Proxy::new(host.to_string(), 8080, ProxyType::Http);
        proxy.real_address = Some(egress.to_string());
        store.add_proxy(&proxy).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_changed_egress_refreshes_everything() {
        let (refresher, store) = refresher(vec![ProxyType::Https]).await;
        stored(&store, "10.0.0.1", "198.51.100.1").await;
        stored(&store, "10.0.0.2", "198.51.100.2").await;

        let outcome = refresher.check_once().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed { updated: 2, total: 2 });

        for proxy in store.list_proxies().await.unwrap() {
            assert_eq!(proxy.real_address.as_deref(), Some("198.51.100.99"));
            assert_eq!(proxy.proxy_type, ProxyType::Https);
        }

        assert_eq!(refresher.check_once().await.unwrap(), RefreshOutcome::Unchanged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nothing_to_refresh() {
        let (refresher, store) = refresher(vec![]).await;
        assert_eq!(refresher.check_once().await.unwrap(), RefreshOutcome::NothingStored);

        stored(&store, "10.0.0.1", "198.51.100.1").await;
        assert_eq!(refresher.check_once().await.unwrap(), RefreshOutcome::NoReachableProxy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_stops_on_cancel() {
        let (refresher, _) = refresher(vec![]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), refresher.watch(cancel))
            .await
            .unwrap();
    }
}
