//! Token-authenticated fraud score API strategy

use crate::error::CheckError;
use crate::pool::Worker;
use crate::proxy::models::VerificationRecord;
use crate::verify::RunContext;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Query string the lookup is always made with
const QUERY: &str =
    "strictness=1&allow_public_access_points=false&fast=false&lighter_penalties=true&mobile=true";

/// Scores one address with one token
#[async_trait]
pub trait ScoreApi: Send + Sync {
    async fn lookup(&self, token: &str, address: &str) -> Result<VerificationRecord, CheckError>;
}

/// IPQualityScore JSON API
pub struct IpqsApi {
    base_url: String,
    client: Client,
}

impl IpqsApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn lookup_url(&self, token: &str, address: &str) -> String {
        format!("{}{}/{}?{}", self.base_url, token, address, QUERY)
    }
}

/// Parse an API body. Anything without `"success": true` is a failure.
pub fn parse_api_response(body: &str) -> Result<VerificationRecord, CheckError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if value.get("success").and_then(|s| s.as_bool()) != Some(true) {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("no message");
        return Err(CheckError::malformed(format!("lookup unsuccessful: {}", message)));
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ScoreApi for IpqsApi {
    async fn lookup(&self, token: &str, address: &str) -> Result<VerificationRecord, CheckError> {
        let body = self
            .client
            .get(self.lookup_url(token, address))
            .send()
            .await?
            .text()
            .await?;
        parse_api_response(&body)
    }
}

/// Worker loop for the API strategy.
///
/// Each worker rotates through its own copy of the token list. A failed lookup
/// requeues the candidate and moves to the next token; once the tokens are
/// used up, failing candidates are dropped.
pub async fn api_worker(worker: Worker<RunContext>, api: Arc<dyn ScoreApi>) {
    let ctx = &worker.shared;

    let mut tokens: VecDeque<String> = match ctx.store.list_tokens().await {
        Ok(tokens) => tokens.into_iter().map(|t| t.token).collect(),
        Err(e) => {
            error!(worker = worker.index, "failed to load API tokens: {:#}", e);
            return;
        }
    };
    let Some(mut token) = tokens.pop_front() else {
        warn!(worker = worker.index, "{}", CheckError::AuthExhausted);
        return;
    };

    while !worker.cancel.is_cancelled() {
        let Some(proxy) = ctx.run.dequeue() else {
            break;
        };
        let Some(egress) = proxy.real_address.clone() else {
            debug!(proxy = %proxy, "no egress address, skipping");
            ctx.run.drop_candidate(proxy);
            continue;
        };

        match api.lookup(&token, &egress).await {
            Ok(record) => ctx.record_outcome(record, &proxy).await,
            Err(e) => match tokens.pop_front() {
                Some(next) => {
                    warn!(worker = worker.index, proxy = %proxy, "lookup failed, rotating token: {}", e);
                    ctx.run.requeue(proxy);
                    token = next;
                }
                None => {
                    warn!(worker = worker.index, proxy = %proxy, "lookup failed with no tokens left, dropping: {}", e);
                    ctx.run.drop_candidate(proxy);
                }
            },
        }
    }

    info!(worker = worker.index, "API worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use crate::verify::tests::{candidate, context};
    use crate::verify::{Run, Strategy};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Answers per token: true scores the address clean, false fails
    struct FakeApi {
        clean: HashMap<String, bool>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new(tokens: &[(&str, bool)]) -> Arc<Self> {
            Arc::new(Self {
                clean: tokens.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ScoreApi for FakeApi {
        async fn lookup(&self, token: &str, _address: &str) -> Result<VerificationRecord, CheckError> {
            self.calls.lock().push(token.to_string());
            match self.clean.get(token) {
                Some(true) => Ok(VerificationRecord {
                    fraud_score: Some(0),
                    ..Default::default()
                }),
                _ => Err(CheckError::network("connection reset")),
            }
        }
    }

    async fn run_api(ctx: Arc<RunContext>, api: Arc<dyn ScoreApi>, limit: usize) {
        WorkerPool::new(ctx, move |worker| api_worker(worker, api.clone()))
            .limit(limit)
            .start()
            .wait()
            .await;
    }

    #[test]
    fn test_lookup_url() {
        let api = IpqsApi::new("https://ipqualityscore.com/api/json/ip/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            api.lookup_url("TOKEN", "203.0.113.1"),
            "https://ipqualityscore.com/api/json/ip/TOKEN/203.0.113.1?strictness=1&allow_public_access_points=false&fast=false&lighter_penalties=true&mobile=true"
        );
    }

    #[test]
    fn test_parse_api_response() {
        let record = parse_api_response(r#"{"success": true, "fraud_score": 0, "city": "Oslo"}"#).unwrap();
        assert!(record.is_clean());
        assert_eq!(record.city.as_deref(), Some("Oslo"));

        let err = parse_api_response(r#"{"success": false, "message": "Invalid key"}"#).unwrap_err();
        assert!(err.to_string().contains("Invalid key"));
        assert!(parse_api_response("not json").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_tokens_requeue_then_drop() {
        const TOKENS: usize = 4;
        let ctx = context(Run::new(Strategy::Api, 1, vec![candidate(0)], vec![]), vec![]).await;
        for i in 0..TOKENS {
            ctx.store.add_token(&format!("bad-{}", i)).await.unwrap();
        }
        let api = FakeApi::new(&[]);

        run_api(ctx.clone(), api.clone(), 1).await;

        assert_eq!(ctx.run.requeue_count(), TOKENS - 1);
        assert_eq!(ctx.run.remaining(), 0);
        assert_eq!(ctx.run.snapshot().dropped, 1);
        assert_eq!(api.calls.lock().len(), TOKENS);
        assert!(ctx.store.list_records().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rotation_reaches_working_token() {
        let ctx = context(
            Run::new(Strategy::Api, 1, vec![candidate(0), candidate(1)], vec![]),
            vec![],
        )
        .await;
        ctx.store.add_token("expired").await.unwrap();
        ctx.store.add_token("good").await.unwrap();
        let api = FakeApi::new(&[("good", true)]);

        run_api(ctx.clone(), api.clone(), 1).await;

        assert_eq!(ctx.run.requeue_count(), 1);
        assert_eq!(ctx.store.list_records().await.unwrap().len(), 2);
        assert_eq!(*api.calls.lock(), vec!["expired", "good", "good"]);
    }

    #[tokio::test]
    async fn test_worker_without_tokens_exits() {
        let ctx = context(Run::new(Strategy::Api, 1, vec![candidate(0)], vec![]), vec![]).await;
        let api = FakeApi::new(&[]);

        run_api(ctx.clone(), api.clone(), 2).await;

        assert!(api.calls.lock().is_empty());
        assert_eq!(ctx.run.remaining(), 1);
    }
}
