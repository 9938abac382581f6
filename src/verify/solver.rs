//! Client for a FlareSolverr-compatible challenge solver

use crate::error::CheckError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Extra time the HTTP call gets on top of the solver's own `maxTimeout`
const REQUEST_GRACE: Duration = Duration::from_secs(15);

/// Timeout for session commands
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverProxy {
    pub url: String,
}

/// One command posted to the solver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverCommand {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<SolverProxy>,
}

impl SolverCommand {
    pub fn create_session(session: &str) -> Self {
        Self::session_command("sessions.create", session)
    }

    pub fn destroy_session(session: &str) -> Self {
        Self::session_command("sessions.destroy", session)
    }

    fn session_command(cmd: &str, session: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            session: Some(session.to_string()),
            url: None,
            max_timeout: None,
            proxy: None,
        }
    }

    /// Load `url` in the session's browser, optionally through `proxy`
    pub fn get(url: String, session: &str, max_timeout: Duration, proxy: Option<String>) -> Self {
        Self {
            cmd: "request.get".to_string(),
            session: Some(session.to_string()),
            url: Some(url),
            max_timeout: Some(max_timeout.as_millis() as u64),
            proxy: proxy.map(|url| SolverProxy { url }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.max_timeout
            .map(|ms| Duration::from_millis(ms) + REQUEST_GRACE)
            .unwrap_or(SESSION_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub url: Option<String>,
    pub status: Option<u16>,
    pub response: Option<String>,
    #[serde(default)]
    pub headers: Option<serde_json::Value>,
    #[serde(default)]
    pub cookies: Option<Vec<serde_json::Value>>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverResponse {
    pub status: Option<String>,
    pub message: Option<String>,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
    pub version: Option<String>,
    pub session: Option<String>,
    pub solution: Option<Solution>,
}

impl SolverResponse {
    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }

    /// The page got through: no error and the browser saw a 200
    pub fn is_solved(&self) -> bool {
        !self.is_error() && self.solution.as_ref().and_then(|s| s.status) == Some(200)
    }

    /// Body of a successfully loaded page
    pub fn page(&self) -> Result<&str, CheckError> {
        if self.is_error() {
            return Err(CheckError::network(format!(
                "solver error: {}",
                self.message.as_deref().unwrap_or("no message")
            )));
        }
        let solution = self
            .solution
            .as_ref()
            .ok_or_else(|| CheckError::malformed("solver returned no solution"))?;
        match solution.status {
            Some(200) => solution
                .response
                .as_deref()
                .ok_or_else(|| CheckError::malformed("solution has no page body")),
            status => Err(CheckError::network(format!("page status {:?}", status))),
        }
    }
}

/// Anything that accepts solver commands
#[async_trait]
pub trait SolverClient: Send + Sync {
    async fn send(&self, command: &SolverCommand) -> Result<SolverResponse, CheckError>;

    async fn create_session(&self, session: &str) -> Result<SolverResponse, CheckError> {
        self.send(&SolverCommand::create_session(session)).await
    }

    async fn destroy_session(&self, session: &str) -> Result<SolverResponse, CheckError> {
        self.send(&SolverCommand::destroy_session(session)).await
    }
}

/// Posts commands to a solver's `/v1` endpoint
pub struct FlareSolverrClient {
    url: String,
    client: Client,
}

impl FlareSolverrClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl SolverClient for FlareSolverrClient {
    async fn send(&self, command: &SolverCommand) -> Result<SolverResponse, CheckError> {
        debug!(cmd = %command.cmd, url = ?command.url, proxy = ?command.proxy, "solver command");
        let response = self
            .client
            .post(&self.url)
            .timeout(command.timeout())
            .json(command)
            .send()
            .await?;

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}
