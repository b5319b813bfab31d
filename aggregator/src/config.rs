//! Environment configuration for the aggregator and validator binaries.

use std::time::Duration;

use openvote_core::HashVersion;

use crate::accumulator::AccumulatorConfig;
use crate::database::constants::DEFAULT_DB_PATH;
use crate::pipeline::PipelineConfig;
use crate::reconcile::ReconcilerConfig;
use crate::retry::RetryConfig;
use crate::utils::{env_millis, env_opt, env_parse, env_secs};

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_INTAKE_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub db_path: String,
    pub port: u16,
    pub max_batch_size: usize,
    pub max_batch_interval: Duration,
    /// Unset runs against the in-memory dev ledger.
    pub ledger_url: Option<String>,
    pub ledger_timeout: Duration,
    pub commit_max_attempts: usize,
    pub queue_write_timeout: Duration,
    pub reconcile_interval: Duration,
    pub archive_repair_interval: Duration,
    pub metrics_auth_token: Option<String>,
    pub intake_body_limit: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            port: DEFAULT_PORT,
            max_batch_size: 1000,
            max_batch_interval: Duration::from_millis(300_000),
            ledger_url: None,
            ledger_timeout: Duration::from_millis(10_000),
            commit_max_attempts: 5,
            queue_write_timeout: Duration::from_millis(5_000),
            reconcile_interval: Duration::from_secs(30),
            archive_repair_interval: Duration::from_secs(30),
            metrics_auth_token: None,
            intake_body_limit: DEFAULT_INTAKE_BODY_LIMIT,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: env_opt("DB_PATH").unwrap_or(d.db_path),
            port: env_parse("PORT", d.port),
            max_batch_size: env_parse("MAX_BATCH_SIZE", d.max_batch_size).max(1),
            max_batch_interval: env_millis(
                "MAX_BATCH_INTERVAL_MS",
                d.max_batch_interval.as_millis() as u64,
            ),
            ledger_url: env_opt("LEDGER_URL"),
            ledger_timeout: env_millis("LEDGER_TIMEOUT_MS", d.ledger_timeout.as_millis() as u64),
            commit_max_attempts: env_parse("COMMIT_MAX_ATTEMPTS", d.commit_max_attempts).max(1),
            queue_write_timeout: env_millis(
                "QUEUE_WRITE_TIMEOUT_MS",
                d.queue_write_timeout.as_millis() as u64,
            ),
            reconcile_interval: env_secs(
                "RECONCILE_INTERVAL_SECS",
                d.reconcile_interval.as_secs(),
            ),
            archive_repair_interval: env_secs(
                "ARCHIVE_REPAIR_INTERVAL_SECS",
                d.archive_repair_interval.as_secs(),
            ),
            metrics_auth_token: env_opt("METRICS_AUTH_TOKEN"),
            intake_body_limit: env_parse("INTAKE_BODY_LIMIT", d.intake_body_limit),
        }
    }

    pub fn accumulator(&self) -> AccumulatorConfig {
        AccumulatorConfig {
            max_batch_size: self.max_batch_size,
            max_batch_interval: self.max_batch_interval,
            hash_version: HashVersion::CURRENT,
            force_empty: false,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            commit_retry: RetryConfig::commit(self.commit_max_attempts),
            commit_timeout: self.ledger_timeout,
            archive_retry: RetryConfig::archive(),
            repair_interval: self.archive_repair_interval,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            ..ReconcilerConfig::default()
        }
    }
}

/// Standalone validator: a remote ledger and a remote archive.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub ledger_url: String,
    pub archive_url: String,
    pub request_timeout: Duration,
    pub reconcile_interval: Duration,
}

impl ValidatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let Some(ledger_url) = env_opt("LEDGER_URL") else {
            anyhow::bail!("LEDGER_URL is required");
        };
        let Some(archive_url) = env_opt("ARCHIVE_URL") else {
            anyhow::bail!("ARCHIVE_URL is required");
        };
        Ok(Self {
            ledger_url,
            archive_url,
            request_timeout: env_millis("LEDGER_TIMEOUT_MS", 10_000),
            reconcile_interval: env_secs("RECONCILE_INTERVAL_SECS", 30),
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            ..ReconcilerConfig::default()
        }
    }
}
