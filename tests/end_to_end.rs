use async_trait::async_trait;
use proxy_vetter::verify::ScoreApi;
use proxy_vetter::{
    CheckError, Config, PoolRegistry, Proxy, ProxyStore, ProxyType, SqliteStore, Strategy,
    VerificationRecord, VetterService,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Every lookup fails
struct DownApi {
    calls: AtomicUsize,
}

#[async_trait]
impl ScoreApi for DownApi {
    async fn lookup(&self, _token: &str, _address: &str) -> Result<VerificationRecord, CheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err(CheckError::network("service unavailable"))
    }
}

async fn seeded_store(candidates: usize) -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    for i in 0..candidates {
        let mut proxy = Proxy::new(format!("10.1.0.{}", i + 1), 3128, ProxyType::Http);
        proxy.real_address = Some(format!("198.51.100.{}", i + 1));
        store.add_proxy(&proxy).await.unwrap();
    }
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_api_run_drains_cleanly() {
    let store = seeded_store(5).await;
    store.add_token("only-token").await.unwrap();

    let api = Arc::new(DownApi {
        calls: AtomicUsize::new(0),
    });
    let service = VetterService::new(Arc::new(store), Config::default())
        .unwrap()
        .with_score_api(api.clone());

    let id = service.start_run(Strategy::Api, 2).await.unwrap();
    let run = service.current_run().unwrap();
    assert_eq!(run.id(), id);
    assert_eq!(run.total(), 5);

    tokio::time::timeout(Duration::from_secs(10), run.finished())
        .await
        .expect("run should drain");

    assert!(service.results().await.unwrap().is_empty());
    assert_eq!(service.progress(), 100);
    assert!(!PoolRegistry::exists(&id.to_string()));

    // one token per worker: every candidate is tried once and dropped
    assert_eq!(api.calls.load(Ordering::SeqCst), 5);
    let snapshot = run.snapshot();
    assert_eq!(snapshot.requeued, 0);
    assert_eq!(snapshot.dropped, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_without_run_is_harmless() {
    let service = VetterService::new(Arc::new(seeded_store(0).await), Config::default()).unwrap();
    assert!(!service.stop_run().await);
    assert_eq!(service.progress(), 100);
}
