//! Transport probe: finds the protocol a proxy speaks and hands back a client tunnelled through it

use crate::config::Config;
use crate::proxy::models::{ProxyEndpoint, ProxyType};
use crate::Result;
use anyhow::bail;
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Opens a client through a proxy with one protocol and proves that it works
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn open(&self, endpoint: &ProxyEndpoint, kind: ProxyType) -> Result<Client>;
}

/// Liveness check that issues one GET to an always-2xx endpoint
pub struct HttpLivenessCheck {
    url: String,
    timeout: Duration,
}

impl HttpLivenessCheck {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    /// Create a reqwest client with the proxy
    fn create_client(&self, endpoint: &ProxyEndpoint, kind: ProxyType) -> Result<Client> {
        let mut reqwest_proxy = ReqwestProxy::all(endpoint.descriptor(kind))?;
        // socks4 has no password field
        if let Some(auth) = endpoint.auth.as_ref().filter(|_| kind.supports_password_auth()) {
            reqwest_proxy = reqwest_proxy.basic_auth(&auth.username, &auth.password);
        }

        let client = Client::builder()
            .proxy(reqwest_proxy)
            .timeout(self.timeout)
            .build()?;

        Ok(client)
    }
}

#[async_trait]
impl LivenessCheck for HttpLivenessCheck {
    async fn open(&self, endpoint: &ProxyEndpoint, kind: ProxyType) -> Result<Client> {
        let client = self.create_client(endpoint, kind)?;
        let response = client.get(&self.url).send().await?;
        if !response.status().is_success() {
            bail!("HTTP status: {}", response.status());
        }
        Ok(client)
    }
}

/// A working tunnel through a proxy
#[derive(Debug, Clone)]
pub struct Transport {
    pub kind: ProxyType,
    pub client: Client,
}

impl Transport {
    /// Ask `url` for the address the world sees behind this tunnel
    pub async fn egress_address(&self, url: &str) -> Result<String> {
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let address = body.trim();
        if !is_valid_ipv4(address) {
            bail!("egress endpoint returned something other than an IPv4 address: {:?}", address);
        }
        Ok(address.to_string())
    }
}

/// Dotted IPv4 address whose first octet is not zero
pub fn is_valid_ipv4(address: &str) -> bool {
    match address.parse::<Ipv4Addr>() {
        Ok(ip) => ip.octets()[0] != 0,
        Err(_) => false,
    }
}

/// Tries every protocol in priority order until one tunnels traffic
#[derive(Clone)]
pub struct TransportProbe {
    check: Arc<dyn LivenessCheck>,
}

impl TransportProbe {
    pub fn new(config: &Config) -> Self {
        Self::with_check(Arc::new(HttpLivenessCheck::new(
            config.liveness_url.clone(),
            config.probe_timeout,
        )))
    }

    pub fn with_check(check: Arc<dyn LivenessCheck>) -> Self {
        Self { check }
    }

    /// First protocol whose liveness request succeeds, or `None`
    pub async fn detect(&self, endpoint: &ProxyEndpoint) -> Option<Transport> {
        for kind in ProxyType::PROBE_ORDER {
            match self.check.open(endpoint, kind).await {
                Ok(client) => {
                    debug!(proxy = %endpoint, protocol = %kind, "protocol detected");
                    return Some(Transport { kind, client });
                }
                Err(e) => {
                    debug!(proxy = %endpoint, protocol = %kind, "probe failed: {:#}", e);
                }
            }
        }

        info!(proxy = %endpoint, "no protocol could tunnel through proxy");
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use crate::proxy::models::ProxyAuth;

    /// Records every attempt and succeeds only for the listed protocols
    pub(crate) struct ScriptedCheck {
        pub working: Vec<ProxyType>,
        pub attempts: Mutex<Vec<(String, ProxyType)>>,
    }

    impl ScriptedCheck {
        pub(crate) fn new(working: Vec<ProxyType>) -> Self {
            Self {
                working,
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LivenessCheck for ScriptedCheck {
        async fn open(&self, endpoint: &ProxyEndpoint, kind: ProxyType) -> Result<Client> {
            self.attempts.lock().push((endpoint.to_string(), kind));
            if self.working.contains(&kind) {
                Ok(Client::builder().no_proxy().build()?)
            } else {
                bail!("connection refused")
            }
        }
    }

    /// Plain-text HTTP responder on a random local port, returns its URL
    pub(crate) async fn serve_text(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_detect_walks_priority_order() {
        let check = Arc::new(ScriptedCheck::new(vec![ProxyType::Socks5]));
        let probe = TransportProbe::with_check(check.clone());

        let transport = probe
            .detect(&ProxyEndpoint::new("10.0.0.1", 1080))
            .await
            .expect("socks5 should be detected");

        assert_eq!(transport.kind, ProxyType::Socks5);
        let tried: Vec<ProxyType> = check.attempts.lock().iter().map(|(_, k)| *k).collect();
        assert_eq!(
            tried,
            vec![
                ProxyType::Http,
                ProxyType::Https,
                ProxyType::Socks4,
                ProxyType::Socks4a,
                ProxyType::Socks5,
            ]
        );
    }

    #[tokio::test]
    async fn test_detect_stops_at_first_success() {
        let check = Arc::new(ScriptedCheck::new(vec![ProxyType::Https, ProxyType::Socks5]));
        let probe = TransportProbe::with_check(check.clone());

        let transport = probe.detect(&ProxyEndpoint::new("10.0.0.2", 443)).await.unwrap();
        assert_eq!(transport.kind, ProxyType::Https);
        assert_eq!(check.attempts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_undetected_tries_every_protocol() {
        let check = Arc::new(ScriptedCheck::new(vec![]));
        let probe = TransportProbe::with_check(check.clone());
        let endpoint = ProxyEndpoint::new("10.0.0.3", 8080);

        assert!(probe.detect(&endpoint).await.is_none());
        assert_eq!(check.attempts.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_egress_address_is_validated() {
        let probe = TransportProbe::with_check(Arc::new(ScriptedCheck::new(vec![ProxyType::Http])));
        let transport = probe.detect(&ProxyEndpoint::new("10.0.0.4", 8080)).await.unwrap();

        let good = serve_text("198.51.100.23\n").await;
        assert_eq!(transport.egress_address(&good).await.unwrap(), "198.51.100.23");

        let bad = serve_text("<html>blocked</html>").await;
        assert!(transport.egress_address(&bad).await.is_err());
    }

    #[test]
    fn test_client_builds_for_every_protocol() {
        let check = HttpLivenessCheck::new("http://example.com".to_string(), Duration::from_secs(1));
        let endpoint = ProxyEndpoint::new("127.0.0.1", 8080);
        assert!(check.create_client(&endpoint, ProxyType::Http).is_ok());
        assert!(check.create_client(&endpoint, ProxyType::Socks5).is_ok());
    }

    #[test]
    fn test_reserved_characters_in_password() {
        let check = HttpLivenessCheck::new("http://example.com".to_string(), Duration::from_secs(1));
        for password in ["p#ss", "p/ss", "p?ss", "p@ss", "p:ss"] {
            let endpoint = ProxyEndpoint::new("127.0.0.1", 8080)
                .with_auth(Some(ProxyAuth::new("user".to_string(), password.to_string())));
            for kind in ProxyType::PROBE_ORDER {
                assert!(
                    check.create_client(&endpoint, kind).is_ok(),
                    "{} client with password {:?}",
                    kind,
                    password
                );
            }
        }
    }

    #[tokio::test]
    async fn test_credentials_reach_http_proxy() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy_side = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            String::from_utf8_lossy(&request).to_lowercase()
        });

        let check = HttpLivenessCheck::new("http://liveness.test/".to_string(), Duration::from_secs(5));
        let endpoint = ProxyEndpoint::new("127.0.0.1", port)
            .with_auth(Some(ProxyAuth::new("user".to_string(), "p#ss".to_string())));
        check.open(&endpoint, ProxyType::Http).await.unwrap();

        // base64 of "user:p#ss"
        let request = proxy_side.await.unwrap();
        assert!(request.contains("proxy-authorization: basic dxnlcjpwi3nz"), "{}", request);
    }

    #[test]
    fn test_ipv4_validation() {
        assert!(is_valid_ipv4("203.0.113.7"));
        assert!(!is_valid_ipv4("0.1.2.3"));
        assert!(!is_valid_ipv4("256.1.1.1"));
        assert!(!is_valid_ipv4("<html>"));
        assert!(!is_valid_ipv4(""));
    }
}
