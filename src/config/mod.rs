//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

use chrono::TimeDelta;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provisioning::policy::FolderPolicy;
use crate::queue::{QueueConfig, RetryPolicy};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Identity recorded as `locked_by` on claimed jobs and as lease holder.
    pub worker_id: String,
    pub poll_interval: Duration,
    /// How long a claim lasts before the job counts as stale.
    pub job_lock_duration: Duration,
    pub stale_sweep_interval: Duration,
    pub folder_policy_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var(&lookup, "DATABASE_URL")?),
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|v| !v.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            worker_id: lookup("WORKER_ID")
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            poll_interval: Duration::from_millis(number_var(&lookup, "JOB_POLL_INTERVAL_MS", 2000)?),
            job_lock_duration: Duration::from_secs(number_var(&lookup, "JOB_LOCK_SECONDS", 1800)?),
            stale_sweep_interval: Duration::from_secs(number_var(
                &lookup,
                "STALE_SWEEP_SECONDS",
                60,
            )?),
            folder_policy_path: lookup("FOLDER_POLICY_PATH").map(PathBuf::from),
        })
    }

    pub fn folder_policy(&self) -> Result<FolderPolicy> {
        load_folder_policy(self.folder_policy_path.as_deref())
    }

    pub fn queue_config(&self) -> Result<QueueConfig> {
        let lock_duration = TimeDelta::from_std(self.job_lock_duration)
            .map_err(|e| Error::Config(format!("JOB_LOCK_SECONDS out of range: {e}")))?;
        Ok(QueueConfig {
            lock_duration,
            retry: RetryPolicy::default(),
        })
    }
}

/// The folder policy at `path`, or the default policy.
pub fn load_folder_policy(path: Option<&Path>) -> Result<FolderPolicy> {
    match path {
        Some(path) => FolderPolicy::from_toml_file(path),
        None => Ok(FolderPolicy::default()),
    }
}

fn required_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    lookup(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn number_var(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<u64> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not a valid number: {e}"))),
    }
}
