//! Runtime configuration, loaded from environment variables with the
//! defaults named throughout the component design.

use crate::error::{CoreError, CoreResult};

/// Configuration shared by every worker-tier process (job-processor worker,
/// keep-alive service, and any admin-triggered balance-check tooling).
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the relational store (SQLite file path or URI).
    pub database_url: String,
    /// Connection string for the shared key-value store (Redis URL).
    pub shared_store_url: String,
    /// Stable identifier for this worker process, used as the value stored
    /// in lease and login-lock keys.
    pub worker_id: String,
    /// Number of job handlers run concurrently by one worker process.
    pub worker_concurrency: usize,
    /// Ceiling on jobs processed per minute by one worker process.
    pub worker_rate_limit_per_minute: u32,
    /// Deadline for the pre-login startup phase of `START_RENEWAL`.
    pub pre_login_timeout_secs: u64,
    /// Keep-alive service cycle interval, in minutes (1-60).
    pub keepalive_interval_minutes: u32,
    /// Deadline for CAPTCHA-solution polling.
    pub captcha_timeout_secs: u64,
    /// Optional API key for the external CAPTCHA-solving vendor. When
    /// absent, CAPTCHA challenges always pause to `AWAITING_CAPTCHA`.
    pub captcha_2captcha_key: Option<String>,
    /// Maximum number of pooled relational-store connections.
    pub db_pool_max_size: u32,
    /// Default log level, overridden by `RUST_LOG` when set.
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process environment, applying the
    /// defaults named in the component design where a variable is unset.
    pub fn from_env() -> CoreResult<Self> {
        Ok(Self {
            database_url: env_or("DATABASE_URL", "sqlite://./worker.db"),
            shared_store_url: env_or("SHARED_STORE_URL", "redis://127.0.0.1:6379"),
            worker_id: env_or_else("WORKER_ID", || format!("worker-{}", uuid_like())),
            worker_concurrency: parse_env_or("WORKER_CONCURRENCY", 3)?,
            worker_rate_limit_per_minute: parse_env_or("WORKER_RATE_LIMIT_PER_MINUTE", 30)?,
            pre_login_timeout_secs: parse_env_or("PRE_LOGIN_TIMEOUT_SECS", 120)?,
            keepalive_interval_minutes: parse_env_or("KEEPALIVE_INTERVAL_MINUTES", 19)?,
            captcha_timeout_secs: parse_env_or("CAPTCHA_TIMEOUT_SECS", 120)?,
            captcha_2captcha_key: std::env::var("CAPTCHA_2CAPTCHA_KEY").ok(),
            db_pool_max_size: parse_env_or("DB_POOL_MAX_SIZE", 10)?,
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_else(key: &str, default: impl FnOnce() -> String) -> String {
    std::env::var(key).unwrap_or_else(|_| default())
}

fn parse_env_or<T>(key: &str, default: T) -> CoreResult<T>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|_| CoreError::InvalidEnv {
            name: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// A short, dependency-free stand-in for a random suffix; worker ids only
/// need to be distinct within an operator's fleet, not globally unique.
fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xffff_ffff)
}
