use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cleanup::CleanupWorkerConfig;
use crate::db::DbConfig;
use crate::jobs::SchedulerConfig;
use crate::retry::RetryPolicy;

/// Where staffing data, stored webhooks, proposals and the audit log live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    /// Process-local; everything is lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => bail!("unknown storage backend {other:?} (expected postgres or memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub storage: StorageBackend,
    /// Shared HMAC secret of the HR system.
    pub webhook_secret: String,
    /// Retry policy of the synchronous apply path.
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
    /// `max_attempts` of jobs created without an explicit value.
    pub job_max_attempts: u32,
    pub cleanup: CleanupWorkerConfig,
    /// Optional TOML file overriding the discrepancy rules.
    pub rules_path: Option<PathBuf>,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("LOTACAO_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("LOTACAO_LISTEN_ADDR")?;

        let log_level = lookup("LOTACAO_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("LOTACAO_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let storage = lookup("LOTACAO_STORAGE")
            .unwrap_or_else(|| "postgres".to_string())
            .parse()?;

        let webhook_secret = match lookup("LOTACAO_WEBHOOK_SECRET") {
            Some(secret) if !secret.is_empty() => secret,
            _ => bail!("LOTACAO_WEBHOOK_SECRET must be set"),
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse(&lookup, "LOTACAO_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: millis(&lookup, "LOTACAO_RETRY_BASE_DELAY_MS", retry_defaults.base_delay)?,
            max_delay: millis(&lookup, "LOTACAO_RETRY_MAX_DELAY_MS", retry_defaults.max_delay)?,
            attempt_timeout: millis(
                &lookup,
                "LOTACAO_RETRY_ATTEMPT_TIMEOUT_MS",
                retry_defaults.attempt_timeout,
            )?,
        };
        if retry.max_attempts == 0 {
            bail!("LOTACAO_RETRY_MAX_ATTEMPTS must be at least 1");
        }

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_concurrent: parse(
                &lookup,
                "LOTACAO_SCHEDULER_MAX_CONCURRENT",
                scheduler_defaults.max_concurrent,
            )?
            .max(1),
            poll_interval: millis(
                &lookup,
                "LOTACAO_SCHEDULER_POLL_INTERVAL_MS",
                scheduler_defaults.poll_interval,
            )?,
            job_timeout: secs(
                &lookup,
                "LOTACAO_SCHEDULER_JOB_TIMEOUT_SECS",
                scheduler_defaults.job_timeout,
            )?,
            backoff: RetryPolicy {
                base_delay: millis(
                    &lookup,
                    "LOTACAO_SCHEDULER_BASE_DELAY_MS",
                    scheduler_defaults.backoff.base_delay,
                )?,
                ..scheduler_defaults.backoff
            },
        };

        let job_max_attempts = parse(&lookup, "LOTACAO_JOB_MAX_ATTEMPTS", 3u32)?.max(1);

        let cleanup_defaults = CleanupWorkerConfig::default();
        let cleanup = CleanupWorkerConfig {
            interval: secs(
                &lookup,
                "LOTACAO_CLEANUP_INTERVAL_SECS",
                cleanup_defaults.interval,
            )?,
            job_retention: Duration::from_secs(
                parse(&lookup, "LOTACAO_JOB_RETENTION_HOURS", 24u64)? * 3600,
            ),
            ledger_retention_days: parse(
                &lookup,
                "LOTACAO_LEDGER_RETENTION_DAYS",
                cleanup_defaults.ledger_retention_days,
            )?,
            webhook_retention_days: parse(
                &lookup,
                "LOTACAO_WEBHOOK_RETENTION_DAYS",
                cleanup_defaults.webhook_retention_days,
            )?,
        };

        let rules_path = lookup("LOTACAO_RULES_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let database = DbConfig::from_env();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            storage,
            webhook_secret,
            retry,
            scheduler,
            job_max_attempts,
            cleanup,
            rules_path,
            database,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    let ms = parse(lookup, name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    let s = parse(lookup, name, default.as_secs())?;
    Ok(Duration::from_secs(s))
}
