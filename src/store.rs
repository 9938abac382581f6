//! Persistent store for proxies, bypass proxies, blocked masks, API tokens and results

use crate::proxy::models::{
    ApiToken, BlockedProxy, BypassProxy, Proxy, ProxyAuth, ProxyType, VerificationRecord,
};
use crate::Result;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;

/// Settings key holding the solver service URL
pub const SOLVER_URL_KEY: &str = "solver_url";

/// Everything the checker needs from storage
#[async_trait]
pub trait ProxyStore: Send + Sync {
    async fn list_proxies(&self) -> Result<Vec<Proxy>>;
    /// Proxy with the same address, port and credentials
    async fn find_proxy(&self, host: &str, port: u16, auth: Option<&ProxyAuth>) -> Result<Option<Proxy>>;
    /// Insert a proxy. `None` if an identical one already exists.
    async fn add_proxy(&self, proxy: &Proxy) -> Result<Option<i64>>;
    async fn remove_proxy(&self, id: i64) -> Result<()>;
    async fn update_egress(&self, id: i64, real_address: &str, proxy_type: ProxyType) -> Result<()>;

    async fn list_bypass_proxies(&self) -> Result<Vec<BypassProxy>>;
    async fn add_bypass_proxy(&self, host: &str, port: u16) -> Result<Option<i64>>;
    async fn remove_bypass_proxy(&self, id: i64) -> Result<()>;

    async fn list_blocked(&self) -> Result<Vec<BlockedProxy>>;
    /// Block an address and the /24 around it
    async fn add_blocked(&self, address: &str) -> Result<BlockedProxy>;
    async fn remove_blocked(&self, id: i64) -> Result<()>;
    async fn is_blocked(&self, real_address: &str) -> Result<bool>;

    async fn list_tokens(&self) -> Result<Vec<ApiToken>>;
    async fn add_token(&self, token: &str) -> Result<Option<i64>>;
    async fn remove_token(&self, id: i64) -> Result<()>;

    async fn add_record(&self, record: &VerificationRecord) -> Result<i64>;
    async fn list_records(&self) -> Result<Vec<VerificationRecord>>;
    async fn clear_records(&self) -> Result<u64>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS proxies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT NOT NULL DEFAULT '',
        password TEXT NOT NULL DEFAULT '',
        real_address TEXT,
        proxy_type TEXT NOT NULL DEFAULT 'http',
        UNIQUE (host, port, username, password)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bypass_proxies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        proxy_type TEXT,
        UNIQUE (host, port)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS blocked_proxies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL,
        mask TEXT NOT NULL,
        UNIQUE (address, mask)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS api_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT NOT NULL UNIQUE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS verification_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT,
        proxy_type TEXT,
        fraud_score INTEGER,
        country_code TEXT,
        region TEXT,
        city TEXT,
        isp TEXT,
        asn INTEGER,
        organization TEXT,
        is_crawler BOOLEAN,
        timezone TEXT,
        mobile BOOLEAN,
        host TEXT,
        proxy BOOLEAN,
        vpn BOOLEAN,
        tor BOOLEAN,
        active_vpn BOOLEAN,
        active_tor BOOLEAN,
        recent_abuse BOOLEAN,
        bot_status BOOLEAN,
        connection_type TEXT,
        abuse_velocity TEXT,
        zip_code TEXT,
        latitude REAL,
        longitude REAL,
        request_id TEXT,
        checked_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#,
];

/// SQLite-backed [`ProxyStore`]
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {}", url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "database ready");
        Ok(store)
    }

    /// Private in-memory database, one connection kept open for its lifetime
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn port_from_row(row: &SqliteRow) -> Result<u16> {
    let port: i64 = row.try_get("port")?;
    u16::try_from(port).map_err(|_| anyhow!("port {} out of range", port))
}

fn proxy_from_row(row: &SqliteRow) -> Result<Proxy> {
    let username: String = row.try_get("username")?;
    let password: String = row.try_get("password")?;
    let proxy_type: String = row.try_get("proxy_type")?;

    let auth = if username.is_empty() && password.is_empty() {
        None
    } else {
        Some(ProxyAuth::new(username, password))
    };

    Ok(Proxy {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: port_from_row(row)?,
        proxy_type: proxy_type.parse().unwrap_or_default(),
        auth,
        real_address: row.try_get("real_address")?,
    })
}

fn optional_type(value: Option<String>) -> Option<ProxyType> {
    value.and_then(|v| v.parse().ok())
}

fn record_from_row(row: &SqliteRow) -> Result<VerificationRecord> {
    Ok(VerificationRecord {
        id: row.try_get("id")?,
        ip: row.try_get("ip")?,
        proxy_type: optional_type(row.try_get("proxy_type")?),
        fraud_score: row.try_get("fraud_score")?,
        country_code: row.try_get("country_code")?,
        region: row.try_get("region")?,
        city: row.try_get("city")?,
        isp: row.try_get("isp")?,
        asn: row.try_get("asn")?,
        organization: row.try_get("organization")?,
        is_crawler: row.try_get("is_crawler")?,
        timezone: row.try_get("timezone")?,
        mobile: row.try_get("mobile")?,
        host: row.try_get("host")?,
        proxy: row.try_get("proxy")?,
        vpn: row.try_get("vpn")?,
        tor: row.try_get("tor")?,
        active_vpn: row.try_get("active_vpn")?,
        active_tor: row.try_get("active_tor")?,
        recent_abuse: row.try_get("recent_abuse")?,
        bot_status: row.try_get("bot_status")?,
        connection_type: row.try_get("connection_type")?,
        abuse_velocity: row.try_get("abuse_velocity")?,
        zip_code: row.try_get("zip_code")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        request_id: row.try_get("request_id")?,
        checked_at: row.try_get("checked_at")?,
    })
}

#[async_trait]
impl ProxyStore for SqliteStore {
    async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        let rows = sqlx::query("SELECT * FROM proxies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(proxy_from_row).collect()
    }

    async fn find_proxy(&self, host: &str, port: u16, auth: Option<&ProxyAuth>) -> Result<Option<Proxy>> {
        let (username, password) = auth
            .map(|a| (a.username.as_str(), a.password.as_str()))
            .unwrap_or(("", ""));

        let row = sqlx::query(
            "SELECT * FROM proxies WHERE host = ?1 AND port = ?2 AND username = ?3 AND password = ?4",
        )
        .bind(host)
        .bind(i64::from(port))
        .bind(username)
        .bind(password)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(proxy_from_row).transpose()
    }

    async fn add_proxy(&self, proxy: &Proxy) -> Result<Option<i64>> {
        let (username, password) = proxy
            .auth
            .as_ref()
            .map(|a| (a.username.as_str(), a.password.as_str()))
            .unwrap_or(("", ""));

        let result = sqlx::query(
            "INSERT INTO proxies (host, port, username, password, real_address, proxy_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (host, port, username, password) DO NOTHING",
        )
        .bind(&proxy.host)
        .bind(i64::from(proxy.port))
        .bind(username)
        .bind(password)
        .bind(&proxy.real_address)
        .bind(proxy.proxy_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then(|| result.last_insert_rowid()))
    }

    async fn remove_proxy(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM proxies WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_egress(&self, id: i64, real_address: &str, proxy_type: ProxyType) -> Result<()> {
        sqlx::query("UPDATE proxies SET real_address = ?1, proxy_type = ?2 WHERE id = ?3")
            .bind(real_address)
            .bind(proxy_type.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_bypass_proxies(&self) -> Result<Vec<BypassProxy>> {
        let rows = sqlx::query("SELECT * FROM bypass_proxies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BypassProxy {
                    id: row.try_get("id")?,
                    host: row.try_get("host")?,
                    port: port_from_row(row)?,
                    proxy_type: optional_type(row.try_get("proxy_type")?),
                })
            })
            .collect()
    }

    async fn add_bypass_proxy(&self, host: &str, port: u16) -> Result<Option<i64>> {
        let result = sqlx::query(
            "INSERT INTO bypass_proxies (host, port) VALUES (?1, ?2)
             ON CONFLICT (host, port) DO NOTHING",
        )
        .bind(host)
        .bind(i64::from(port))
        .execute(&self.pool)
        .await?;
        Ok((result.rows_affected() > 0).then(|| result.last_insert_rowid()))
    }

    async fn remove_bypass_proxy(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM bypass_proxies WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_blocked(&self) -> Result<Vec<BlockedProxy>> {
        let rows = sqlx::query("SELECT * FROM blocked_proxies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BlockedProxy {
                    id: row.try_get("id")?,
                    address: row.try_get("address")?,
                    mask: row.try_get("mask")?,
                })
            })
            .collect()
    }

    async fn add_blocked(&self, address: &str) -> Result<BlockedProxy> {
        let address = address.trim();
        let mask = BlockedProxy::mask_for(address)
            .ok_or_else(|| anyhow!("{:?} is not a dotted address with at least three octets", address))?;

        sqlx::query(
            "INSERT INTO blocked_proxies (address, mask) VALUES (?1, ?2)
             ON CONFLICT (address, mask) DO NOTHING",
        )
        .bind(address)
        .bind(&mask)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM blocked_proxies WHERE address = ?1 AND mask = ?2")
            .bind(address)
            .bind(&mask)
            .fetch_one(&self.pool)
            .await?;

        Ok(BlockedProxy {
            id,
            address: address.to_string(),
            mask,
        })
    }

    async fn remove_blocked(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM blocked_proxies WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_blocked(&self, real_address: &str) -> Result<bool> {
        let hits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM blocked_proxies
             WHERE address = ?1 OR substr(?1, 1, length(mask) + 1) = mask || '.'",
        )
        .bind(real_address)
        .fetch_one(&self.pool)
        .await?;
        Ok(hits > 0)
    }

    async fn list_tokens(&self) -> Result<Vec<ApiToken>> {
        let rows = sqlx::query("SELECT id, token FROM api_tokens ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ApiToken {
                    id: row.try_get("id")?,
                    token: row.try_get("token")?,
                })
            })
            .collect()
    }

    async fn add_token(&self, token: &str) -> Result<Option<i64>> {
        let result = sqlx::query("INSERT INTO api_tokens (token) VALUES (?1) ON CONFLICT (token) DO NOTHING")
            .bind(token.trim())
            .execute(&self.pool)
            .await?;
        Ok((result.rows_affected() > 0).then(|| result.last_insert_rowid()))
    }

    async fn remove_token(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM api_tokens WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_record(&self, record: &VerificationRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO verification_records (
                ip, proxy_type, fraud_score, country_code, region, city, isp, asn,
                organization, is_crawler, timezone, mobile, host, proxy, vpn, tor,
                active_vpn, active_tor, recent_abuse, bot_status, connection_type,
                abuse_velocity, zip_code, latitude, longitude, request_id, checked_at
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
             )",
        )
        .bind(&record.ip)
        .bind(record.proxy_type.map(|t| t.as_str()))
        .bind(record.fraud_score)
        .bind(&record.country_code)
        .bind(&record.region)
        .bind(&record.city)
        .bind(&record.isp)
        .bind(record.asn)
        .bind(&record.organization)
        .bind(record.is_crawler)
        .bind(&record.timezone)
        .bind(record.mobile)
        .bind(&record.host)
        .bind(record.proxy)
        .bind(record.vpn)
        .bind(record.tor)
        .bind(record.active_vpn)
        .bind(record.active_tor)
        .bind(record.recent_abuse)
        .bind(record.bot_status)
        .bind(&record.connection_type)
        .bind(&record.abuse_velocity)
        .bind(&record.zip_code)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(&record.request_id)
        .bind(record.checked_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_records(&self) -> Result<Vec<VerificationRecord>> {
        let rows = sqlx::query("SELECT * FROM verification_records ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn clear_records(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM verification_records")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
