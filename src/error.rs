//! Error types for verification runs

use thiserror::Error;

/// Why a single candidate check failed
///
/// Every variant is handled inside the worker loop; none of them ends a worker.
#[derive(Error, Debug)]
pub enum CheckError {
    /// Connection, timeout or remote-side failure. Requeue after a short pause.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// The lookup page reported that its quota is used up
    #[error("lookup quota exhausted")]
    RateLimited,

    /// No API tokens left for this worker
    #[error("no API tokens left")]
    AuthExhausted,

    /// The payload could not be understood. Handled like a network error.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// No protocol could tunnel through the proxy
    #[error("no working protocol for {0}")]
    ProtocolUndetected(String),
}

impl CheckError {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        CheckError::TransientNetwork(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        CheckError::MalformedResponse(msg.into())
    }

    /// Whether the candidate should go back on the queue after a pause
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CheckError::TransientNetwork(_) | CheckError::MalformedResponse(_)
        )
    }
}

impl From<reqwest::Error> for CheckError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CheckError::MalformedResponse(e.to_string())
        } else {
            CheckError::TransientNetwork(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CheckError {
    fn from(e: serde_json::Error) -> Self {
        CheckError::MalformedResponse(e.to_string())
    }
}

/// Why a run could not be started
#[derive(Error, Debug)]
pub enum StartError {
    #[error("no API tokens are configured")]
    NoTokens,

    #[error("solver service URL is not set or invalid: {0:?}")]
    SolverUnavailable(Option<String>),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CheckError::network("refused").is_transient());
        assert!(CheckError::malformed("no table").is_transient());
        assert!(!CheckError::RateLimited.is_transient());
        assert!(!CheckError::AuthExhausted.is_transient());
        assert!(!CheckError::ProtocolUndetected("1.2.3.4:80".into()).is_transient());
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err: CheckError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, CheckError::MalformedResponse(_)));
    }
}
