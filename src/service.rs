//! Trigger surface: start, stop and observe verification runs and batch imports

use crate::batch::{BatchImporter, JobStatus};
use crate::config::{is_valid_service_url, Config};
use crate::error::StartError;
use crate::pool::{PoolHandle, PoolRegistry, WorkerPool};
use crate::proxy::models::{BypassProxy, Proxy, VerificationRecord};
use crate::proxy::{GeoLocator, TransportProbe};
use crate::store::{ProxyStore, SOLVER_URL_KEY};
use crate::verify::api::{api_worker, IpqsApi, ScoreApi};
use crate::verify::negotiator::ChallengeBypassNegotiator;
use crate::verify::scrape::scrape_worker;
use crate::verify::solver::{FlareSolverrClient, SolverClient};
use crate::verify::{Run, RunContext, RunSnapshot, Strategy};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub type RunId = Uuid;

pub struct VetterService {
    store: Arc<dyn ProxyStore>,
    config: Arc<Config>,
    probe: TransportProbe,
    score_api: Arc<dyn ScoreApi>,
    solver: Option<Arc<dyn SolverClient>>,
    geo: Option<GeoLocator>,
    importer: BatchImporter,
    current: Mutex<Option<Arc<Run>>>,
}

impl VetterService {
    pub fn new(store: Arc<dyn ProxyStore>, config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let probe = TransportProbe::new(&config);
        let score_api = Arc::new(IpqsApi::new(config.api_url.clone(), config.api_timeout)?);

        let geo = match &config.mmdb_path {
            Some(path) => match GeoLocator::from_path(path) {
                Ok(geo) => Some(geo),
                Err(e) => {
                    warn!(path = %path, "geo database unavailable: {:#}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            importer: BatchImporter::new(Arc::clone(&store), probe.clone(), Arc::clone(&config)),
            store,
            config,
            probe,
            score_api,
            solver: None,
            geo,
            current: Mutex::new(None),
        })
    }

    pub fn with_score_api(mut self, api: Arc<dyn ScoreApi>) -> Self {
        self.score_api = api;
        self
    }

    /// Use this solver instead of one built from the configured URL
    pub fn with_solver(mut self, solver: Arc<dyn SolverClient>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn with_probe(mut self, probe: TransportProbe) -> Self {
        self.importer = BatchImporter::new(Arc::clone(&self.store), probe.clone(), Arc::clone(&self.config));
        self.probe = probe;
        self
    }

    pub fn store(&self) -> &Arc<dyn ProxyStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn probe(&self) -> &TransportProbe {
        &self.probe
    }

    /// Solver URL from the config, else from the stored setting
    pub async fn solver_url(&self) -> Result<Option<String>> {
        if let Some(url) = &self.config.solver_url {
            return Ok(Some(url.clone()));
        }
        self.store.get_setting(SOLVER_URL_KEY).await
    }

    async fn resolve_solver(&self) -> std::result::Result<Arc<dyn SolverClient>, StartError> {
        if let Some(solver) = &self.solver {
            return Ok(Arc::clone(solver));
        }
        match self.solver_url().await? {
            Some(url) if is_valid_service_url(&url) => Ok(Arc::new(FlareSolverrClient::new(url))),
            other => Err(StartError::SolverUnavailable(other)),
        }
    }

    /// Candidates with a known egress address that is not blocked
    async fn load_candidates(&self) -> Result<Vec<Proxy>> {
        let mut candidates = Vec::new();
        for proxy in self.store.list_proxies().await? {
            let Some(egress) = proxy.real_address.as_deref() else {
                warn!(proxy = %proxy, "no egress address yet, skipping");
                continue;
            };
            if self.store.is_blocked(egress).await? {
                info!(proxy = %proxy, "egress is blocked, skipping");
                continue;
            }
            candidates.push(proxy);
        }
        Ok(candidates)
    }

    fn supersede(&self, next: Option<Arc<Run>>) {
        let previous = std::mem::replace(&mut *self.current.lock(), next);
        if let Some(previous) = previous {
            info!(run = %previous.id(), "stopping previous run");
            previous.cancel();
            PoolRegistry::stop(&previous.id().to_string());
            previous.finish();
        }
    }

    /// Seed a new run and start it in the background.
    ///
    /// Any current run is cancelled first. For the scrape strategy the solver
    /// session is rebuilt and the challenge negotiated before workers start.
    pub async fn start_run(&self, strategy: Strategy, limit: usize) -> std::result::Result<RunId, StartError> {
        let solver = match strategy {
            Strategy::Api => {
                if self.store.list_tokens().await?.is_empty() {
                    return Err(StartError::NoTokens);
                }
                None
            }
            Strategy::Scrape => Some(self.resolve_solver().await?),
        };

        let candidates = self.load_candidates().await?;
        let bypass: Vec<BypassProxy> = self.store.list_bypass_proxies().await?;
        let run = Arc::new(Run::new(strategy, limit, candidates, bypass));
        let id = run.id();
        info!(run = %id, strategy = %strategy, limit = run.limit(), candidates = run.total(), "starting run");

        self.supersede(Some(Arc::clone(&run)));

        let ctx = Arc::new(RunContext {
            run: Arc::clone(&run),
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            probe: self.probe.clone(),
            geo: self.geo.clone(),
        });
        let api = Arc::clone(&self.score_api);
        tokio::spawn(launch(ctx, api, solver));

        Ok(id)
    }

    /// Cancel the current run. Returns false if there was none.
    pub async fn stop_run(&self) -> bool {
        let Some(run) = self.current.lock().take() else {
            return false;
        };
        info!(run = %run.id(), "stopping run");
        run.cancel();
        PoolRegistry::stop(&run.id().to_string());
        run.finish();

        if run.strategy() == Strategy::Scrape {
            if let Ok(solver) = self.resolve_solver().await {
                if let Err(e) = solver.destroy_session(&self.config.session_name).await {
                    warn!("failed to destroy solver session: {}", e);
                }
            }
        }
        true
    }

    pub fn current_run(&self) -> Option<Arc<Run>> {
        self.current.lock().clone()
    }

    pub fn snapshot(&self) -> Option<RunSnapshot> {
        self.current.lock().as_ref().map(|run| run.snapshot())
    }

    /// Completion of the current run, 100 when there is none
    pub fn progress(&self) -> u8 {
        self.current.lock().as_ref().map_or(100, |run| run.progress())
    }

    pub async fn results(&self) -> Result<Vec<VerificationRecord>> {
        self.store.list_records().await
    }

    /// Import `candidates` in the background and return the job id
    pub fn submit_batch(&self, candidates: Vec<Proxy>) -> Uuid {
        self.submit_batch_with_handle(candidates).0
    }

    pub fn submit_batch_with_handle(&self, candidates: Vec<Proxy>) -> (Uuid, PoolHandle) {
        self.importer.submit(candidates)
    }

    pub fn job_status(&self, id: Uuid) -> Option<JobStatus> {
        self.importer.status(id)
    }
}

/// Background part of a run start: clear old results, negotiate if scraping, start the workers
async fn launch(ctx: Arc<RunContext>, api: Arc<dyn ScoreApi>, solver: Option<Arc<dyn SolverClient>>) {
    let run = Arc::clone(&ctx.run);

    match ctx.store.clear_records().await {
        Ok(cleared) => info!(run = %run.id(), cleared, "previous results cleared"),
        Err(e) => error!(run = %run.id(), "failed to clear results: {:#}", e),
    }

    if let Some(solver) = &solver {
        let negotiator = ChallengeBypassNegotiator::new(Arc::clone(&ctx), Arc::clone(solver));
        negotiator.rebuild_session().await;
        if !negotiator.negotiate().await {
            info!(run = %run.id(), "run ended before the challenge was passed");
            run.finish();
            return;
        }
    }

    if run.is_cancelled() || run.remaining() == 0 {
        info!(run = %run.id(), "nothing to verify");
        run.finish();
        return;
    }

    let drained = Arc::clone(&run);
    let pool = match solver {
        Some(solver) => WorkerPool::new(ctx, move |worker| scrape_worker(worker, Arc::clone(&solver))),
        None => WorkerPool::new(ctx, move |worker| api_worker(worker, Arc::clone(&api))),
    };
    pool.named(run.id().to_string())
        .limit(run.limit())
        .with_cancel(run.cancel_token())
        .on_drained(move || {
            info!(run = %drained.id(), "run finished");
            drained.finish();
            Ok(())
        })
        .start();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckError;
    use crate::proxy::models::ProxyType;
    use crate::proxy::probe::tests::ScriptedCheck;
    use crate::store::SqliteStore;
    use crate::verify::solver::{Solution, SolverCommand, SolverResponse};
    use crate::verify::tests::candidate;
    use async_trait::async_trait;
    use std::time::Duration;

    struct CleanApi;

    #[async_trait]
    impl ScoreApi for CleanApi {
        async fn lookup(&self, _token: &str, address: &str) -> std::result::Result<VerificationRecord, CheckError> {
            Ok(VerificationRecord {
                fraud_score: Some(if address.ends_with(".1") { 0 } else { 50 }),
                ..Default::default()
            })
        }
    }

    /// Never finishes a lookup until cancelled
    struct StuckApi;

    #[async_trait]
    impl ScoreApi for StuckApi {
        async fn lookup(&self, _token: &str, _address: &str) -> std::result::Result<VerificationRecord, CheckError> {
            std::future::pending().await
        }
    }

    struct PassingSolver;

    #[async_trait]
    impl SolverClient for PassingSolver {
        async fn send(&self, command: &SolverCommand) -> std::result::Result<SolverResponse, CheckError> {
            let html = match command.url.as_deref() {
                Some(url) if url.contains("/lookup/") => {
                    r#"<table class="ip-lookup-report"><tr><td>Fraud Score</td><td>0</td></tr></table>"#
                }
                _ => "<html></html>",
            };
            Ok(SolverResponse {
                status: Some("ok".to_string()),
                solution: Some(Solution {
                    status: Some(200),
                    response: Some(html.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
        }
    }

    async fn service_with(proxies: usize) -> VetterService {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..proxies {
            store.add_proxy(&candidate(i)).await.unwrap();
        }
        let config = Config::default().with_retry_delay(Duration::from_millis(5));
        VetterService::new(Arc::new(store), config)
            .unwrap()
            .with_probe(TransportProbe::with_check(Arc::new(ScriptedCheck::new(vec![ProxyType::Http]))))
    }

    async fn wait_finished(service: &VetterService) {
        let run = service.current_run().unwrap();
        tokio::time::timeout(Duration::from_secs(5), run.finished())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_missing_prerequisites() {
        let service = service_with(1).await;
        assert!(matches!(
            service.start_run(Strategy::Api, 1).await,
            Err(StartError::NoTokens)
        ));

        assert!(matches!(
            service.start_run(Strategy::Scrape, 1).await,
            Err(StartError::SolverUnavailable(None))
        ));

        service.store().set_setting(SOLVER_URL_KEY, "not a url").await.unwrap();
        assert!(matches!(
            service.start_run(Strategy::Scrape, 1).await,
            Err(StartError::SolverUnavailable(Some(_)))
        ));
        assert!(service.current_run().is_none());
        assert_eq!(service.progress(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_api_run_keeps_only_clean_results() {
        let service = service_with(3).await.with_score_api(Arc::new(CleanApi));
        service.store().add_token("tok").await.unwrap();

        service.start_run(Strategy::Api, 2).await.unwrap();
        wait_finished(&service).await;

        let results = service.results().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(service.progress(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_candidates_are_filtered() {
        let service = service_with(2).await.with_score_api(Arc::new(CleanApi));
        service.store().add_token("tok").await.unwrap();
        service.store().add_blocked("203.0.113.1").await.unwrap();

        service.start_run(Strategy::Api, 1).await.unwrap();
        assert_eq!(service.current_run().unwrap().total(), 0);
        wait_finished(&service).await;
        assert!(service.results().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scrape_run_negotiates_then_verifies() {
        let service = service_with(2).await.with_solver(Arc::new(PassingSolver));

        service.start_run(Strategy::Scrape, 2).await.unwrap();
        wait_finished(&service).await;

        assert_eq!(service.results().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_run_supersedes_and_stop_clears() {
        let service = service_with(4).await.with_score_api(Arc::new(StuckApi));
        service.store().add_token("tok").await.unwrap();

        let first = service.start_run(Strategy::Api, 2).await.unwrap();
        let first_run = service.current_run().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(PoolRegistry::exists(&first.to_string()));

        let second = service.start_run(Strategy::Api, 2).await.unwrap();
        assert_ne!(first, second);
        assert!(first_run.is_cancelled());
        assert!(!PoolRegistry::exists(&first.to_string()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.progress() < 100);
        assert!(service.stop_run().await);
        assert!(!PoolRegistry::exists(&second.to_string()));
        assert_eq!(service.progress(), 100);
        assert!(!service.stop_run().await);
    }
}
