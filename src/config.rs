use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "COORDINATOR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub static_dir: PathBuf,
    /// Handed to every new room unchanged.
    pub ice_servers: Value,
    /// Connections silent for longer than this are reaped. Zero disables reaping.
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub credit_retry: CreditRetryPolicy,
    /// Sessions to preload into the in-memory gateway.
    pub sessions_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CreditRetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl CreditRetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), plus up to 50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff.saturating_mul(1 << attempt.saturating_sub(1).min(16));
        let jitter_ms = exp.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
    }
}

impl Default for CreditRetryPolicy {
    fn default() -> Self {
        CreditRetryPolicy {
            attempts: 3,
            base_backoff: Duration::from_millis(250),
        }
    }
}

pub fn default_ice_servers() -> Value {
    json!([{ "urls": ["stun:stun.l.google.com:19302"] }])
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 2052,
            tls_cert_path: PathBuf::from("ssl/room/certificate.pem"),
            tls_key_path: PathBuf::from("ssl/room/private.key"),
            static_dir: PathBuf::from("public"),
            ice_servers: default_ice_servers(),
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(20),
            credit_retry: CreditRetryPolicy::default(),
            sessions_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to defaults for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.trim().is_empty());
        let mut config = ServerConfig::default();

        if let Some(v) = get("BIND") {
            config.bind = parse("COORDINATOR_BIND", &v)?;
        }
        if let Some(v) = get("PORT") {
            config.port = parse("COORDINATOR_PORT", &v)?;
        }
        if let Some(v) = get("TLS_CERT") {
            config.tls_cert_path = PathBuf::from(v);
        }
        if let Some(v) = get("TLS_KEY") {
            config.tls_key_path = PathBuf::from(v);
        }
        if let Some(v) = get("STATIC_DIR") {
            config.static_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ICE_SERVERS") {
            config.ice_servers = serde_json::from_str(&v).map_err(|e| ConfigError::InvalidValue {
                key: "COORDINATOR_ICE_SERVERS",
                reason: e.to_string(),
            })?;
        }
        if let Some(v) = get("IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(parse("COORDINATOR_IDLE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("PING_INTERVAL_SECS") {
            let secs: u64 = parse("COORDINATOR_PING_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "COORDINATOR_PING_INTERVAL_SECS",
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("CREDIT_RETRIES") {
            let attempts: u32 = parse("COORDINATOR_CREDIT_RETRIES", &v)?;
            config.credit_retry.attempts = attempts.max(1);
        }
        if let Some(v) = get("CREDIT_BACKOFF_MS") {
            config.credit_retry.base_backoff =
                Duration::from_millis(parse("COORDINATOR_CREDIT_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("SESSIONS_FILE") {
            config.sessions_file = Some(PathBuf::from(v));
        }

        Ok(config)
    }

    pub fn use_tls(&self) -> bool {
        self.tls_cert_path.is_file() && self.tls_key_path.is_file()
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        reason: e.to_string(),
    })
}
