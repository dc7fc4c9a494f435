//! Configuration management for the tsugi tracker
//!
//! Configuration loads from environment variables (`TSUGI_*`) or a TOML
//! file, with validation before anything is constructed from it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source site configuration
    pub source: SourceConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Orchestrator configuration
    pub orchestrator: OrchestratorConfig,

    /// Notification configuration
    pub notifier: NotifierConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Source-fetcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the source API
    pub base_url: String,

    /// Rate limit (requests per second)
    pub rate_limit: u32,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// User agent string
    pub user_agent: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds between scheduling cycles
    pub poll_interval_secs: u64,

    /// Maximum concurrently executing jobs
    pub max_concurrent_jobs: usize,

    /// Maximum due items picked up per cycle
    pub due_batch_limit: i64,

    /// Seconds in-flight jobs get to finish on shutdown
    pub shutdown_grace_secs: u64,

    /// Consecutive infrastructure failures tolerated before the process
    /// gives up and exits non-zero
    pub max_infra_failures: u32,
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Webhook endpoint for release notifications; disabled when unset
    pub webhook_url: Option<String>,

    /// Webhook request timeout in seconds
    pub webhook_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("TSUGI_SOURCE_URL")
            .unwrap_or_else(|_| String::from("https://source.example/api"));

        let rate_limit = std::env::var("TSUGI_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(2);

        let request_timeout_secs = std::env::var("TSUGI_REQUEST_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let user_agent = std::env::var("TSUGI_USER_AGENT")
            .unwrap_or_else(|_| format!("tsugi/{}", env!("CARGO_PKG_VERSION")));

        let postgres_url = std::env::var("POSTGRES_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| String::from("postgresql://localhost/tsugi"));

        let pool_size = std::env::var("TSUGI_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10);

        let poll_interval_secs = std::env::var("TSUGI_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        let max_concurrent_jobs = std::env::var("TSUGI_MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(5);

        let webhook_url = std::env::var("TSUGI_WEBHOOK_URL").ok();

        let log_level = std::env::var("TSUGI_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));
        let log_format = std::env::var("TSUGI_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            source: SourceConfig {
                base_url,
                rate_limit,
                request_timeout_secs,
                user_agent,
            },
            database: DatabaseConfig {
                postgres_url,
                pool_size,
            },
            orchestrator: OrchestratorConfig {
                poll_interval_secs,
                max_concurrent_jobs,
                due_batch_limit: 50,
                shutdown_grace_secs: 30,
                max_infra_failures: 3,
            },
            notifier: NotifierConfig {
                webhook_url,
                webhook_timeout_secs: 10,
            },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.source.base_url)
            .with_context(|| format!("invalid source base_url: {}", self.source.base_url))?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("source base_url must be http or https");
        }

        if self.source.rate_limit == 0 {
            anyhow::bail!("rate_limit must be greater than 0");
        }

        if self.database.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if self.orchestrator.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be greater than 0");
        }

        if self.orchestrator.due_batch_limit <= 0 {
            anyhow::bail!("due_batch_limit must be greater than 0");
        }

        if let Some(raw) = &self.notifier.webhook_url {
            let webhook = url::Url::parse(raw)
                .with_context(|| format!("invalid webhook_url: {raw}"))?;
            if !matches!(webhook.scheme(), "http" | "https") {
                anyhow::bail!("webhook_url must be http or https");
            }
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_secs)
    }

    /// Get poll interval as Duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.orchestrator.poll_interval()
    }

    /// Get shutdown grace period as Duration
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.orchestrator.shutdown_grace()
    }
}

impl OrchestratorConfig {
    /// Get poll interval as Duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Get shutdown grace period as Duration
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                base_url: String::from("https://source.example/api"),
                rate_limit: 2,
                request_timeout_secs: 30,
                user_agent: format!("tsugi/{}", env!("CARGO_PKG_VERSION")),
            },
            database: DatabaseConfig {
                postgres_url: String::from("postgresql://localhost/tsugi"),
                pool_size: 10,
            },
            orchestrator: OrchestratorConfig {
                poll_interval_secs: 300,
                max_concurrent_jobs: 5,
                due_batch_limit: 50,
                shutdown_grace_secs: 30,
                max_infra_failures: 3,
            },
            notifier: NotifierConfig {
                webhook_url: None,
                webhook_timeout_secs: 10,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.orchestrator.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_webhook_url_rejected() {
        let mut config = Config::default();
        config.notifier.webhook_url = Some(String::from("hooks.example.com/tsugi"));
        assert!(config.validate().is_err());

        config.notifier.webhook_url = Some(String::from("https://hooks.example.com/tsugi"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_conversions() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml_file() {
        let toml = r#"
            [source]
            base_url = "https://source.example/api"
            rate_limit = 4
            request_timeout_secs = 15
            user_agent = "tsugi-test"

            [database]
            postgres_url = "postgresql://localhost/tsugi_test"
            pool_size = 4

            [orchestrator]
            poll_interval_secs = 60
            max_concurrent_jobs = 5
            due_batch_limit = 20
            shutdown_grace_secs = 10
            max_infra_failures = 3

            [notifier]
            webhook_timeout_secs = 5

            [logging]
            level = "debug"
            format = "json"
        "#;

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.source.rate_limit, 4);
        assert_eq!(config.orchestrator.poll_interval_secs, 60);
        assert!(config.notifier.webhook_url.is_none());
        assert!(config.validate().is_ok());
    }
}
