//! Proxy list parsing for batch import

use crate::proxy::models::{Proxy, ProxyType};
use crate::Result;
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

/// scheme://[user:pass@]host:port
static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks4a?|socks5)://(?:([^:@]+):([^@]+)@)?([^:/@]+):(\d+)/?$")
        .expect("Invalid proxy URL regex")
});

/// user:pass@host:port
static AUTH_AT_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^:@]+):([^@]+)@([^:@]+):(\d+)$").expect("Invalid user:pass@host regex")
});

/// Proxy parser for parsing proxies from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - IP:PORT:USER:PASS
    /// - USER:PASS@IP:PORT
    /// - scheme://IP:PORT
    /// - scheme://USER:PASS@IP:PORT
    ///
    /// `default_type` is only a hint; the probe decides the real protocol.
    pub fn parse_line(line: &str, default_type: ProxyType) -> Option<Proxy> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        Self::parse_url_format(line)
            .or_else(|| Self::parse_auth_at_format(line, default_type))
            .or_else(|| Self::parse_colon_format(line, default_type))
    }

    fn parse_url_format(line: &str) -> Option<Proxy> {
        let caps = URL_FORMAT.captures(line)?;

        let proxy_type: ProxyType = caps[1].parse().ok()?;
        let host = caps[4].to_string();
        let port = parse_port(&caps[5])?;

        match (caps.get(2), caps.get(3)) {
            (Some(user), Some(pass)) => Some(Proxy::with_auth(
                host,
                port,
                proxy_type,
                user.as_str().to_string(),
                pass.as_str().to_string(),
            )),
            _ => Some(Proxy::new(host, port, proxy_type)),
        }
    }

    fn parse_auth_at_format(line: &str, default_type: ProxyType) -> Option<Proxy> {
        let caps = AUTH_AT_FORMAT.captures(line)?;
        let port = parse_port(&caps[4])?;

        Some(Proxy::with_auth(
            caps[3].to_string(),
            port,
            default_type,
            caps[1].to_string(),
            caps[2].to_string(),
        ))
    }

    fn parse_colon_format(line: &str, default_type: ProxyType) -> Option<Proxy> {
        let parts: Vec<&str> = line.split(':').collect();

        match parts.as_slice() {
            [host, port] if !host.is_empty() => {
                Some(Proxy::new(host.to_string(), parse_port(port)?, default_type))
            }
            [host, port, user, pass] if !host.is_empty() => Some(Proxy::with_auth(
                host.to_string(),
                parse_port(port)?,
                default_type,
                user.to_string(),
                pass.to_string(),
            )),
            _ => None,
        }
    }

    /// Parse proxies from a string (multiple lines), dropping duplicates
    pub fn parse_string(content: &str, default_type: ProxyType) -> Vec<Proxy> {
        let mut proxies: Vec<Proxy> = Vec::new();
        for proxy in content
            .lines()
            .filter_map(|line| Self::parse_line(line, default_type))
        {
            let duplicate = proxies.iter().any(|p| {
                p.host == proxy.host && p.port == proxy.port && p.auth == proxy.auth
            });
            if !duplicate {
                proxies.push(proxy);
            }
        }
        proxies
    }

    /// Parse proxies from a file
    pub fn parse_file<P: AsRef<Path>>(path: P, default_type: ProxyType) -> Result<Vec<Proxy>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading proxy list {}", path.display()))?;
        Ok(Self::parse_string(&content, default_type))
    }

    /// Write proxies one per line in IP:PORT[:USER:PASS] format
    pub fn save_to_file<P: AsRef<Path>>(proxies: &[Proxy], path: P) -> Result<()> {
        let content: String = proxies
            .iter()
            .map(|p| p.to_full_string())
            .collect::<Vec<_>>()
            .join("\n");

        fs::write(path, content)?;
        Ok(())
    }
}

/// Port 0 is not a usable proxy port
fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}
