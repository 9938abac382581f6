//! Batch import of new proxies
//!
//! Every submitted candidate is checked for duplicates, probed for a working
//! protocol and resolved to its egress address before it is stored. Each job
//! keeps a short log that callers can poll while it runs and for a while after.

use crate::config::Config;
use crate::error::CheckError;
use crate::pool::{PoolHandle, Worker, WorkerPool};
use crate::proxy::models::Proxy;
use crate::proxy::TransportProbe;
use crate::store::ProxyStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of importing one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Added(i64),
    Duplicate,
    Unreachable,
    NoEgress,
    Failed,
}

/// What a caller sees of a batch job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub added: usize,
    pub lines: Vec<String>,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }
}

struct JobLog {
    total: usize,
    completed: usize,
    added: usize,
    lines: Vec<String>,
    expires_at: Instant,
}

impl JobLog {
    fn is_expired(&self, now: Instant) -> bool {
        self.completed >= self.total && now >= self.expires_at
    }
}

/// Logs of recent batch jobs, dropped once a finished job outlives its retention
#[derive(Clone)]
pub struct BatchJobs {
    jobs: Arc<Mutex<HashMap<Uuid, JobLog>>>,
    retention: Duration,
}

impl BatchJobs {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    fn purge(jobs: &mut HashMap<Uuid, JobLog>) {
        let now = Instant::now();
        jobs.retain(|_, job| !job.is_expired(now));
    }

    fn create(&self, id: Uuid, total: usize) {
        let mut jobs = self.jobs.lock();
        Self::purge(&mut jobs);
        jobs.insert(
            id,
            JobLog {
                total,
                completed: 0,
                added: 0,
                lines: Vec::new(),
                expires_at: Instant::now() + self.retention,
            },
        );
    }

    fn log(&self, id: Uuid, line: impl Into<String>) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.lines
                .push(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line.into()));
        }
    }

    /// Count one candidate as done and push the expiry out by the retention window
    fn complete(&self, id: Uuid, outcome: &ImportOutcome) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.completed += 1;
            if matches!(outcome, ImportOutcome::Added(_)) {
                job.added += 1;
            }
            job.expires_at = Instant::now() + self.retention;
        }
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        let mut jobs = self.jobs.lock();
        Self::purge(&mut jobs);
        jobs.get(&id).map(|job| JobStatus {
            id,
            total: job.total,
            completed: job.completed,
            added: job.added,
            lines: job.lines.clone(),
        })
    }
}

struct ImportJob {
    id: Uuid,
    queue: Mutex<VecDeque<Proxy>>,
    store: Arc<dyn ProxyStore>,
    probe: TransportProbe,
    egress_url: String,
    jobs: BatchJobs,
}

impl ImportJob {
    async fn import(&self, mut proxy: Proxy) -> ImportOutcome {
        let name = proxy.to_simple_string();

        match self
            .store
            .find_proxy(&proxy.host, proxy.port, proxy.auth.as_ref())
            .await
        {
            Ok(Some(existing)) => {
                self.jobs.log(self.id, format!("{} already exists as #{}", name, existing.id));
                return ImportOutcome::Duplicate;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(proxy = %name, "duplicate lookup failed: {:#}", e);
                self.jobs.log(self.id, format!("{} could not be checked: {}", name, e));
                return ImportOutcome::Failed;
            }
        }

        let Some(transport) = self.probe.detect(&proxy.endpoint()).await else {
            self.jobs.log(self.id, CheckError::ProtocolUndetected(name).to_string());
            return ImportOutcome::Unreachable;
        };
        self.jobs.log(self.id, format!("{} speaks {}", name, transport.kind));

        let egress = match transport.egress_address(&self.egress_url).await {
            Ok(egress) => egress,
            Err(e) => {
                debug!(proxy = %name, "egress lookup failed: {:#}", e);
                self.jobs.log(self.id, format!("{} egress address unavailable", name));
                return ImportOutcome::NoEgress;
            }
        };
        self.jobs.log(self.id, format!("{} exits as {}", name, egress));

        proxy.proxy_type = transport.kind;
        proxy.real_address = Some(egress);
        match self.store.add_proxy(&proxy).await {
            Ok(Some(id)) => {
                self.jobs.log(self.id, format!("{} added as #{}", name, id));
                ImportOutcome::Added(id)
            }
            Ok(None) => {
                self.jobs.log(self.id, format!("{} was added concurrently", name));
                ImportOutcome::Duplicate
            }
            Err(e) => {
                warn!(proxy = %name, "insert failed: {:#}", e);
                self.jobs.log(self.id, format!("{} could not be stored: {}", name, e));
                ImportOutcome::Failed
            }
        }
    }
}

async fn import_worker(worker: Worker<ImportJob>) {
    let job = &worker.shared;
    while !worker.cancel.is_cancelled() {
        let next = job.queue.lock().pop_front();
        let Some(proxy) = next else {
            break;
        };
        let outcome = job.import(proxy).await;
        job.jobs.complete(job.id, &outcome);
    }
}

/// Starts import jobs and keeps their logs
pub struct BatchImporter {
    store: Arc<dyn ProxyStore>,
    probe: TransportProbe,
    config: Arc<Config>,
    jobs: BatchJobs,
}

impl BatchImporter {
    pub fn new(store: Arc<dyn ProxyStore>, probe: TransportProbe, config: Arc<Config>) -> Self {
        let jobs = BatchJobs::new(config.job_retention);
        Self {
            store,
            probe,
            config,
            jobs,
        }
    }

    /// Start importing `candidates` in the background. The pool is named after the job id.
    pub fn submit(&self, candidates: Vec<Proxy>) -> (Uuid, PoolHandle) {
        let id = Uuid::new_v4();
        let total = candidates.len();
        self.jobs.create(id, total);
        info!(job = %id, candidates = total, "batch import submitted");

        let job = Arc::new(ImportJob {
            id,
            queue: Mutex::new(candidates.into()),
            store: Arc::clone(&self.store),
            probe: self.probe.clone(),
            egress_url: self.config.egress_url.clone(),
            jobs: self.jobs.clone(),
        });

        let handle = WorkerPool::new(job, import_worker)
            .named(id.to_string())
            .limit(self.config.batch_concurrency.min(total.max(1)))
            .on_drained(move || {
                info!(job = %id, "batch import finished");
                Ok(())
            })
            .start();

        (id, handle)
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.jobs.status(id)
    }
}
