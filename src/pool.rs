//! Bounded pool of async workers running one named batch job
//!
//! A pool spawns exactly `limit` workers, each running the task function once.
//! The task is expected to loop on its own until its work runs out or its
//! cancellation token fires. Running pools are kept in a process-wide registry
//! so that a job can be stopped by name from anywhere.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registry entry, `instance` distinguishes pools started under the same name
struct RegistryEntry {
    instance: Uuid,
    cancel: CancellationToken,
}

static REGISTRY: Lazy<Mutex<HashMap<String, RegistryEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Removes `name` only while it still points at `instance`
fn deregister(name: &str, instance: Uuid) -> bool {
    let mut registry = REGISTRY.lock();
    match registry.get(name) {
        Some(entry) if entry.instance == instance => {
            registry.remove(name);
            true
        }
        _ => false,
    }
}

/// Process-wide view of running pools
pub struct PoolRegistry;

impl PoolRegistry {
    /// Stop the pool registered under `name`. Returns false if there is none.
    pub fn stop(name: &str) -> bool {
        let entry = REGISTRY.lock().remove(name);
        match entry {
            Some(entry) => {
                info!(pool = name, "stopping worker pool");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn exists(name: &str) -> bool {
        REGISTRY.lock().contains_key(name)
    }
}

/// What every worker receives
pub struct Worker<S> {
    /// 0-based worker index
    pub index: usize,
    /// State shared by all workers of the pool
    pub shared: Arc<S>,
    pub cancel: CancellationToken,
}

type TaskFn<S> = Arc<dyn Fn(Worker<S>) -> BoxFuture<'static, ()> + Send + Sync>;
type Hook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A named batch of concurrent workers
pub struct WorkerPool<S> {
    name: String,
    limit: usize,
    shared: Arc<S>,
    task: TaskFn<S>,
    on_start: Option<Hook>,
    on_drained: Option<Hook>,
    cancel: CancellationToken,
}

impl<S: Send + Sync + 'static> WorkerPool<S> {
    /// Create a pool with a single worker and a random name
    pub fn new<F, Fut>(shared: Arc<S>, task: F) -> Self
    where
        F: Fn(Worker<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: Uuid::new_v4().to_string(),
            limit: 1,
            shared,
            task: Arc::new(move |worker| Box::pin(task(worker))),
            on_start: None,
            on_drained: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of workers, never less than one
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Use an existing token, so that cancelling it elsewhere stops the pool
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs before any worker is spawned
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Runs once after every worker has returned
    pub fn on_drained<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.on_drained = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_limit(&self) -> usize {
        self.limit
    }

    /// Register the pool and spawn its workers. Must be called inside a tokio runtime.
    pub fn start(self) -> PoolHandle {
        let WorkerPool {
            name,
            limit,
            shared,
            task,
            on_start,
            on_drained,
            cancel,
        } = self;

        info!(pool = %name, workers = limit, "starting worker pool");

        let instance = Uuid::new_v4();
        let previous = REGISTRY.lock().insert(
            name.clone(),
            RegistryEntry {
                instance,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            warn!(pool = %name, "a pool with this name was running, stopping it");
            previous.cancel.cancel();
        }

        run_hook(&name, "start", on_start);

        let mut workers = JoinSet::new();
        for index in 0..limit {
            let worker = Worker {
                index,
                shared: Arc::clone(&shared),
                cancel: cancel.clone(),
            };
            let job = task(worker);
            let token = cancel.clone();
            workers.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = job => {}
                }
            });
            debug!(pool = %name, worker = index, "worker spawned");
        }

        let (done_tx, done_rx) = watch::channel(false);
        let supervisor_name = name.clone();
        tokio::spawn(async move {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(pool = %supervisor_name, "worker panicked: {}", e);
                    }
                }
                debug!(pool = %supervisor_name, remaining = workers.len(), "worker finished");
            }

            deregister(&supervisor_name, instance);
            run_hook(&supervisor_name, "drained", on_drained);
            info!(pool = %supervisor_name, "worker pool drained");
            let _ = done_tx.send(true);
        });

        PoolHandle {
            name,
            instance,
            cancel,
            done: done_rx,
        }
    }
}

/// Hook failures are logged and never abort the pool
fn run_hook(pool: &str, stage: &str, hook: Option<Hook>) {
    let Some(hook) = hook else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(pool, stage, "pool hook failed: {:#}", e),
        Err(_) => error!(pool, stage, "pool hook panicked"),
    }
}

/// Handle to a started pool
#[derive(Clone)]
pub struct PoolHandle {
    name: String,
    instance: Uuid,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deregister and cancel the workers. Safe to call more than once.
    pub fn stop(&self) {
        if deregister(&self.name, self.instance) {
            info!(pool = %self.name, "stopping worker pool");
        }
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once every worker has returned and the drained hook has run
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}
