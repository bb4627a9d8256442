//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be set with `-f` or the `IMGBATCH_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration
//! 2. **Environment variables** - Variables prefixed with `IMGBATCH_` override YAML values
//! 3. **DATABASE_URL** - Special case: overrides `database.url` if set
//!
//! Nested values use double underscores, e.g. `IMGBATCH_WORKER__JPEG_QUALITY=70`.
//!
//! Without a database URL the service runs on the in-memory backends, which lose all state on
//! restart.

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use url::Url;

use crate::daemon::DaemonConfig;
use crate::error::ImgBatchError;
use crate::http::FetchLimits;
use crate::queue::RetryPolicy;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "IMGBATCH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub webhooks: WebhookConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            webhooks: WebhookConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string. Unset means in-memory backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory of processed images, served under `/images`
    pub output_dir: PathBuf,
    /// Base of every `outputUrl`
    pub public_base_url: String,
    /// Where export CSV files are written
    pub export_dir: PathBuf,
    /// Largest accepted batch upload
    pub max_upload_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/processed"),
            public_base_url: "http://localhost:3000/images".to_string(),
            export_dir: PathBuf::from("data/exports"),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Retry policy attached to every job at fan-out.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Total attempts per image, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    pub backoff_factor: u64,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_ms: self.backoff.as_millis() as u64,
            backoff_factor: self.backoff_factor,
            max_backoff_ms: self.max_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Maximum number of jobs claimed per iteration
    pub claim_batch_size: usize,
    /// Sleep between claim iterations when idle
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,
    /// Concurrent fetches per source host
    pub default_host_concurrency: usize,
    /// Per-host overrides, keyed by lowercase host name
    pub host_concurrency_limits: HashMap<String, usize>,
    /// Whole-request deadline for one image download
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    pub max_image_bytes: usize,
    /// JPEG quality of processed images (1-100)
    pub jpeg_quality: u8,
    /// Interval of the in-flight status log. Unset disables it.
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
    /// Jobs claimed longer ago than this are handed out again
    #[serde(with = "humantime_serde")]
    pub claim_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 50,
            claim_interval: Duration::from_secs(1),
            default_host_concurrency: 8,
            host_concurrency_limits: HashMap::new(),
            fetch_timeout: Duration::from_secs(30),
            max_image_bytes: 20 * 1024 * 1024,
            jpeg_quality: 50,
            status_log_interval: Some(Duration::from_secs(5)),
            claim_timeout: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            claim_batch_size: self.claim_batch_size,
            default_host_concurrency: self.default_host_concurrency,
            host_concurrency_limits: self.host_concurrency_limits.clone(),
            claim_interval_ms: self.claim_interval.as_millis() as u64,
            status_log_interval_ms: self.status_log_interval.map(|d| d.as_millis() as u64),
        }
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            timeout: self.fetch_timeout,
            max_bytes: self.max_image_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Sweep for Requests stranded by an interrupted fan-out.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Requests younger than this are left alone; their fan-out may still be running
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(300),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ImgBatchError> {
        let invalid = |message: String| {
            Err(ImgBatchError::Other(anyhow::anyhow!(
                "Config validation: {message}"
            )))
        };

        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be at least 1".to_string());
        }
        if !(1..=100).contains(&self.worker.jpeg_quality) {
            return invalid(format!(
                "worker.jpeg_quality must be between 1 and 100, got {}",
                self.worker.jpeg_quality
            ));
        }
        if self.worker.claim_batch_size == 0 {
            return invalid("worker.claim_batch_size must be at least 1".to_string());
        }
        if self.worker.fetch_timeout.is_zero() {
            return invalid("worker.fetch_timeout must be greater than zero".to_string());
        }
        if let Err(e) = Url::parse(&self.storage.public_base_url) {
            return invalid(format!(
                "storage.public_base_url '{}' is not a valid URL: {e}",
                self.storage.public_base_url
            ));
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("IMGBATCH_").split("__"))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.url".into()),
            )
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml"))?;
            assert_eq!(config.port, 3000);
            assert!(config.database.url.is_none());
            assert_eq!(config.queue.retry_policy(), RetryPolicy::default());
            assert_eq!(config.worker.jpeg_quality, 50);
            assert_eq!(config.worker.fetch_limits(), FetchLimits::default());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 8080
queue:
  max_attempts: 5
  backoff: 500ms
  max_backoff: 1m
worker:
  claim_interval: 250ms
  host_concurrency_limits:
    slow.example.com: 2
  status_log_interval: 10s
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.port, 8080);

            let retry = config.queue.retry_policy();
            assert_eq!(retry.max_attempts, 5);
            assert_eq!(retry.backoff_ms, 500);
            assert_eq!(retry.backoff_factor, 2); // default
            assert_eq!(retry.max_backoff_ms, 60_000);

            let daemon = config.worker.daemon_config();
            assert_eq!(daemon.claim_interval_ms, 250);
            assert_eq!(daemon.host_concurrency_limits.get("slow.example.com"), Some(&2));
            assert_eq!(daemon.status_log_interval_ms, Some(10_000));
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "port: 8080\n")?;
            jail.set_env("IMGBATCH_PORT", "9090");
            jail.set_env("IMGBATCH_WORKER__JPEG_QUALITY", "80");
            jail.set_env("DATABASE_URL", "postgres://localhost/imgbatch");

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.port, 9090);
            assert_eq!(config.worker.jpeg_quality, 80);
            assert_eq!(
                config.database.url.as_deref(),
                Some("postgres://localhost/imgbatch")
            );
            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "worker:\n  jpeg_qualty: 10\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.public_base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
