//! Runtime configuration

use std::time::Duration;

/// Default SQLite database file
const DEFAULT_DATABASE_URL: &str = "sqlite://proxy-vetter.db";

/// Verification API base, token and address are appended
const DEFAULT_API_URL: &str = "https://ipqualityscore.com/api/json/ip/";

/// Lookup page base, the address is appended
const DEFAULT_LOOKUP_URL: &str = "https://www.ipqualityscore.com/free-ip-lookup-proxy-vpn-test/lookup/";

/// Page primed by the negotiator before scraping starts
const DEFAULT_CHALLENGE_URL: &str = "https://www.ipqualityscore.com/";

/// Always-204 endpoint used to see whether a tunnel works
const DEFAULT_LIVENESS_URL: &str = "http://google.com/generate_204";

/// Returns the caller's IPv4 address as plain text
const DEFAULT_EGRESS_URL: &str = "https://ip4.seeip.org";

const DEFAULT_SESSION_NAME: &str = "proxychecker";

const DEFAULT_API_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRY_DELAY_SECS: u64 = 6;
const DEFAULT_CEILING_MIN_SECS: u64 = 5;
const DEFAULT_CEILING_MAX_SECS: u64 = 60;
const DEFAULT_BATCH_CONCURRENCY: usize = 10;
const DEFAULT_REFRESH_CONCURRENCY: usize = 10;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 600;
const DEFAULT_JOB_RETENTION_SECS: u64 = 120;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL
    pub database_url: String,
    /// Verification API base URL
    pub api_url: String,
    /// Lookup page base URL
    pub lookup_url: String,
    /// Page the negotiator has to get through
    pub challenge_url: String,
    /// Liveness endpoint for the transport probe
    pub liveness_url: String,
    /// Egress address endpoint
    pub egress_url: String,
    /// Solver service URL; falls back to the stored setting when unset
    pub solver_url: Option<String>,
    /// Solver browser session name
    pub session_name: String,
    pub api_timeout: Duration,
    pub probe_timeout: Duration,
    /// `maxTimeout` sent with scrape lookups
    pub scrape_timeout: Duration,
    /// Pause after a failed scrape or negotiation attempt
    pub retry_delay: Duration,
    /// Negotiator timeout ceiling bounds
    pub ceiling_min: Duration,
    pub ceiling_max: Duration,
    pub batch_concurrency: usize,
    pub refresh_concurrency: usize,
    pub refresh_interval: Duration,
    /// How long a batch job's log is kept after its last candidate finishes
    pub job_retention: Duration,
    /// Path to MMDB file for geolocation (optional)
    pub mmdb_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
            challenge_url: DEFAULT_CHALLENGE_URL.to_string(),
            liveness_url: DEFAULT_LIVENESS_URL.to_string(),
            egress_url: DEFAULT_EGRESS_URL.to_string(),
            solver_url: None,
            session_name: DEFAULT_SESSION_NAME.to_string(),
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            scrape_timeout: Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            ceiling_min: Duration::from_secs(DEFAULT_CEILING_MIN_SECS),
            ceiling_max: Duration::from_secs(DEFAULT_CEILING_MAX_SECS),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECS),
            mmdb_path: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: String) -> Self {
        self.database_url = url;
        self
    }

    pub fn with_solver_url(mut self, url: String) -> Self {
        self.solver_url = Some(url);
        self
    }

    pub fn with_session_name(mut self, name: String) -> Self {
        self.session_name = name;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn with_mmdb_path(mut self, path: String) -> Self {
        self.mmdb_path = Some(path);
        self
    }
}

/// Accepts only absolute http(s) URLs with a host
pub fn is_valid_service_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.api_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(6));
        assert_eq!(config.ceiling_min, Duration::from_secs(5));
        assert_eq!(config.ceiling_max, Duration::from_secs(60));
        assert_eq!(config.session_name, "proxychecker");
        assert!(config.solver_url.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .with_solver_url("http://localhost:8191/v1".to_string())
            .with_retry_delay(Duration::from_millis(10))
            .with_batch_concurrency(3);

        assert_eq!(config.solver_url.as_deref(), Some("http://localhost:8191/v1"));
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert_eq!(config.batch_concurrency, 3);
    }

    #[test]
    fn test_service_url_validation() {
        assert!(is_valid_service_url("http://localhost:8191/v1"));
        assert!(is_valid_service_url("https://solver.example.com"));
        assert!(!is_valid_service_url(""));
        assert!(!is_valid_service_url("localhost:8191"));
        assert!(!is_valid_service_url("ftp://example.com"));
    }
}
