//! Proxy data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proxy protocol, in the order the transport probe tries them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
}

impl ProxyType {
    /// Priority order used when detecting which protocol a proxy speaks
    pub const PROBE_ORDER: [ProxyType; 5] = [
        ProxyType::Http,
        ProxyType::Https,
        ProxyType::Socks4,
        ProxyType::Socks4a,
        ProxyType::Socks5,
    ];

    /// Whether the protocol carries a username and password
    pub fn supports_password_auth(&self) -> bool {
        matches!(self, ProxyType::Http | ProxyType::Https | ProxyType::Socks5)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks4a => "socks4a",
            ProxyType::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(ProxyType::Http),
            "https" => Ok(ProxyType::Https),
            "socks4" => Ok(ProxyType::Socks4),
            "socks4a" => Ok(ProxyType::Socks4a),
            "socks5" => Ok(ProxyType::Socks5),
            _ => Err(anyhow::anyhow!(
                "Invalid proxy type: {}. Use: http, https, socks4, socks4a, socks5",
                s
            )),
        }
    }
}

/// Proxy authentication credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// Where to reach a proxy, independent of the protocol it speaks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<ProxyAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Proxy URL without credentials, as reqwest and the solver service expect it
    pub fn descriptor(&self, kind: ProxyType) -> String {
        format!("{}://{}:{}", kind, self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A proxy under test, as kept in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// Store id, 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
    /// Egress address observed through the proxy
    #[serde(default)]
    pub real_address: Option<String>,
}

impl Proxy {
    /// Create a new proxy without authentication
    pub fn new(host: String, port: u16, proxy_type: ProxyType) -> Self {
        Self {
            id: 0,
            host,
            port,
            proxy_type,
            auth: None,
            real_address: None,
        }
    }

    /// Create a new proxy with authentication
    pub fn with_auth(
        host: String,
        port: u16,
        proxy_type: ProxyType,
        username: String,
        password: String,
    ) -> Self {
        Self {
            auth: Some(ProxyAuth::new(username, password)),
            ..Self::new(host, port, proxy_type)
        }
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.host.clone(), self.port).with_auth(self.auth.clone())
    }

    /// Get the proxy string in IP:PORT format
    pub fn to_simple_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the proxy string with auth in IP:PORT:USER:PASS format
    pub fn to_full_string(&self) -> String {
        match &self.auth {
            Some(auth) => format!("{}:{}:{}:{}", self.host, self.port, auth.username, auth.password),
            None => self.to_simple_string(),
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.real_address {
            Some(real) => write!(f, "[{}] {} ({})", self.id, self.to_simple_string(), real),
            None => write!(f, "[{}] {}", self.id, self.to_simple_string()),
        }
    }
}

/// A secondary proxy used only to route around challenge blocking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BypassProxy {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub proxy_type: Option<ProxyType>,
}

impl BypassProxy {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            id: 0,
            host,
            port,
            proxy_type: None,
        }
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.host.clone(), self.port)
    }
}

impl fmt::Display for BypassProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credential for the verification API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: i64,
    pub token: String,
}

/// Blocked egress address together with its /24 mask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedProxy {
    pub id: i64,
    pub address: String,
    pub mask: String,
}

impl BlockedProxy {
    /// First three octets of a dotted address, `None` if it has fewer
    pub fn mask_for(address: &str) -> Option<String> {
        let octets: Vec<&str> = address.trim().split('.').collect();
        if octets.len() < 3 || octets[..3].iter().any(|o| o.is_empty()) {
            return None;
        }
        Some(octets[..3].join("."))
    }

    /// Exact address match, or the address falls inside the mask
    pub fn matches(&self, address: &str) -> bool {
        self.address == address || address.starts_with(&format!("{}.", self.mask))
    }
}

/// Outcome of one successful verification
///
/// Field names follow the verification API's JSON; the tagging fields are
/// filled in by the checker, never by the remote side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    #[serde(default, skip_deserializing)]
    pub id: i64,
    #[serde(default, skip_deserializing)]
    pub ip: Option<String>,
    #[serde(default, skip_deserializing)]
    pub proxy_type: Option<ProxyType>,
    pub fraud_score: Option<i32>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    #[serde(rename = "ISP")]
    pub isp: Option<String>,
    #[serde(rename = "ASN")]
    pub asn: Option<i64>,
    pub organization: Option<String>,
    pub is_crawler: Option<bool>,
    pub timezone: Option<String>,
    pub mobile: Option<bool>,
    pub host: Option<String>,
    pub proxy: Option<bool>,
    pub vpn: Option<bool>,
    pub tor: Option<bool>,
    pub active_vpn: Option<bool>,
    pub active_tor: Option<bool>,
    pub recent_abuse: Option<bool>,
    pub bot_status: Option<bool>,
    pub connection_type: Option<String>,
    pub abuse_velocity: Option<String>,
    pub zip_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub request_id: Option<String>,
    #[serde(default, skip_deserializing)]
    pub checked_at: Option<DateTime<Utc>>,
}

impl VerificationRecord {
    /// Only a fraud score of exactly zero counts as clean
    pub fn is_clean(&self) -> bool {
        self.fraud_score == Some(0)
    }

    /// Tag the record with the candidate it was produced for
    pub fn tagged(mut self, proxy: &Proxy) -> Self {
        self.ip = Some(proxy.host.clone());
        self.proxy_type = Some(proxy.proxy_type);
        self.checked_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_creation() {
        let proxy = Proxy::new("127.0.0.1".to_string(), 8080, ProxyType::Http);
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 8080);
        assert_eq!(proxy.proxy_type, ProxyType::Http);
        assert!(proxy.auth.is_none());
        assert!(proxy.real_address.is_none());
    }

    #[test]
    fn test_endpoint_descriptor_drops_credentials() {
        let proxy = Proxy::with_auth(
            "192.168.1.1".to_string(),
            1080,
            ProxyType::Socks4a,
            "user".to_string(),
            "p#ss".to_string(),
        );
        assert_eq!(
            proxy.endpoint().descriptor(proxy.proxy_type),
            "socks4a://192.168.1.1:1080"
        );

        let endpoint = ProxyEndpoint::new("10.0.0.1", 3128);
        assert_eq!(endpoint.descriptor(ProxyType::Http), "http://10.0.0.1:3128");
    }

    #[test]
    fn test_password_auth_support() {
        assert!(ProxyType::Http.supports_password_auth());
        assert!(ProxyType::Https.supports_password_auth());
        assert!(ProxyType::Socks5.supports_password_auth());
        assert!(!ProxyType::Socks4.supports_password_auth());
        assert!(!ProxyType::Socks4a.supports_password_auth());
    }

    #[test]
    fn test_proxy_full_string() {
        let proxy = Proxy::with_auth(
            "127.0.0.1".to_string(),
            8080,
            ProxyType::Http,
            "user".to_string(),
            "pass".to_string(),
        );
        assert_eq!(proxy.to_full_string(), "127.0.0.1:8080:user:pass");
        assert_eq!(proxy.to_simple_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_proxy_type_parse() {
        assert_eq!("SOCKS4A".parse::<ProxyType>().unwrap(), ProxyType::Socks4a);
        assert_eq!("https".parse::<ProxyType>().unwrap(), ProxyType::Https);
        assert!("ftp".parse::<ProxyType>().is_err());
    }

    #[test]
    fn test_blocked_mask() {
        assert_eq!(BlockedProxy::mask_for("1.2.3.4").as_deref(), Some("1.2.3"));
        assert_eq!(BlockedProxy::mask_for("1.2.3").as_deref(), Some("1.2.3"));
        assert!(BlockedProxy::mask_for("1.2").is_none());

        let blocked = BlockedProxy {
            id: 1,
            address: "1.2.3.4".to_string(),
            mask: "1.2.3".to_string(),
        };
        assert!(blocked.matches("1.2.3.4"));
        assert!(blocked.matches("1.2.3.99"));
        assert!(!blocked.matches("1.2.30.1"));
        assert!(!blocked.matches("5.6.7.8"));
    }

    #[test]
    fn test_record_from_api_json() {
        let json = r#"{
            "success": true,
            "fraud_score": 0,
            "country_code": "US",
            "ISP": "Example ISP",
            "ASN": 64500,
            "proxy": false,
            "latitude": 40.5,
            "longitude": -74.25
        }"#;
        let record: VerificationRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_clean());
        assert_eq!(record.isp.as_deref(), Some("Example ISP"));
        assert_eq!(record.asn, Some(64500));
        assert_eq!(record.proxy, Some(false));
        assert!(record.ip.is_none());
    }

    #[test]
    fn test_record_tagging() {
        let mut proxy = Proxy::new("10.1.1.1".to_string(), 8080, ProxyType::Socks5);
        proxy.real_address = Some("203.0.113.9".to_string());

        let record = VerificationRecord {
            fraud_score: Some(0),
            ..Default::default()
        }
        .tagged(&proxy);

        assert_eq!(record.ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(record.proxy_type, Some(ProxyType::Socks5));
        assert!(record.checked_at.is_some());

        let dirty = VerificationRecord {
            fraud_score: Some(75),
            ..Default::default()
        };
        assert!(!dirty.is_clean());
        assert!(!VerificationRecord::default().is_clean());
    }
}
