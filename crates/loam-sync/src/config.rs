//! Configuration management

use loam_common::env;
use serde::{Deserialize, Serialize};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default ops router host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default ops router port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/loambase";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Sync Configuration Constants
// ============================================================================

/// Run state key for the Perenual species pipeline.
pub const DEFAULT_PIPELINE: &str = "perenual_catalog";

/// Provider calls allowed per invocation. The free tier allows 100 a day;
/// the remainder is headroom for manual lookups.
pub const DEFAULT_REQUEST_BUDGET: u32 = 95;

/// Items requested per list page.
pub const DEFAULT_PAGE_SIZE: u32 = 30;

/// Maximum incomplete records considered by one backfill sweep.
pub const DEFAULT_BACKFILL_BATCH_SIZE: u32 = 100;

/// Hour (UTC) of the daily scheduled invocation.
pub const DEFAULT_CRON_HOUR_UTC: u32 = 4;

/// Hours (UTC) of the quota-not-reset retries, in attempt order.
pub const DEFAULT_RETRY_HOURS_UTC: [u32; 3] = [6, 9, 12];

/// A `running` row older than this is treated as a crashed invocation.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 2 * 60 * 60;

// ============================================================================
// Provider / Notification Constants
// ============================================================================

pub const DEFAULT_PERENUAL_BASE_URL: &str = "https://perenual.com/api";

pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_SUBJECT_PREFIX: &str = "LoamBase Perenual Fetch";

/// Top level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub provider: ProviderConfig,
    pub notify: NotifyConfig,
}

/// Ops router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Pipeline configuration (`CATALOG_SYNC_*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Run the daily schedule in `worker` mode
    pub enabled: bool,
    pub pipeline: String,
    pub request_budget: u32,
    pub page_size: u32,
    pub backfill_batch_size: u32,
    pub cron_hour_utc: u32,
    pub retry_hours_utc: Vec<u32>,
    pub stale_after_secs: u64,
}

/// Perenual API configuration (`PERENUAL_*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub subject_prefix: String,
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Read configuration from the environment without validating it
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            server: ServerConfig {
                host: env::var_or("LOAM_HOST", DEFAULT_SERVER_HOST),
                port: env::parse_or("LOAM_PORT", DEFAULT_SERVER_PORT)?,
                shutdown_timeout_secs: env::parse_or(
                    "LOAM_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                )?,
            },
            database: DatabaseConfig {
                url: env::var_or("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env::parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env::parse_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env::parse_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
                idle_timeout_secs: env::parse_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                )?,
            },
            sync: SyncConfig::from_env()?,
            provider: ProviderConfig {
                api_key: env::var_or("PERENUAL_API_KEY", ""),
                base_url: env::var_or("PERENUAL_BASE_URL", DEFAULT_PERENUAL_BASE_URL),
                timeout_secs: env::parse_or("PERENUAL_TIMEOUT_SECS", DEFAULT_PROVIDER_TIMEOUT_SECS)?,
            },
            notify: NotifyConfig {
                webhook_url: env::optional("NOTIFY_WEBHOOK_URL"),
                subject_prefix: env::var_or("NOTIFY_SUBJECT_PREFIX", DEFAULT_SUBJECT_PREFIX),
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.sync.validate()?;

        if self.provider.base_url.is_empty() {
            anyhow::bail!("PERENUAL_BASE_URL cannot be empty");
        }

        if self.provider.timeout_secs == 0 {
            anyhow::bail!("PERENUAL_TIMEOUT_SECS must be greater than 0");
        }

        if self.provider.api_key.is_empty() {
            tracing::warn!("PERENUAL_API_KEY is not set - provider calls will be rejected");
        }

        Ok(())
    }
}

impl SyncConfig {
    /// Load `CATALOG_SYNC_*` settings
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            enabled: env::parse_or("CATALOG_SYNC_ENABLED", true)?,
            pipeline: env::var_or("CATALOG_SYNC_PIPELINE", DEFAULT_PIPELINE),
            request_budget: env::parse_or("CATALOG_SYNC_REQUEST_BUDGET", DEFAULT_REQUEST_BUDGET)?,
            page_size: env::parse_or("CATALOG_SYNC_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            backfill_batch_size: env::parse_or(
                "CATALOG_SYNC_BACKFILL_BATCH_SIZE",
                DEFAULT_BACKFILL_BATCH_SIZE,
            )?,
            cron_hour_utc: env::parse_or("CATALOG_SYNC_CRON_HOUR_UTC", DEFAULT_CRON_HOUR_UTC)?,
            retry_hours_utc: env::parse_list(
                "CATALOG_SYNC_RETRY_HOURS_UTC",
                &DEFAULT_RETRY_HOURS_UTC,
            )?,
            stale_after_secs: env::parse_or(
                "CATALOG_SYNC_STALE_AFTER_SECS",
                DEFAULT_STALE_AFTER_SECS,
            )?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.is_empty() {
            anyhow::bail!("CATALOG_SYNC_PIPELINE cannot be empty");
        }

        if self.request_budget == 0 {
            anyhow::bail!("CATALOG_SYNC_REQUEST_BUDGET must be greater than 0");
        }

        if self.page_size == 0 {
            anyhow::bail!("CATALOG_SYNC_PAGE_SIZE must be greater than 0");
        }

        if self.backfill_batch_size == 0 {
            anyhow::bail!("CATALOG_SYNC_BACKFILL_BATCH_SIZE must be greater than 0");
        }

        if self.cron_hour_utc > 23 {
            anyhow::bail!(
                "CATALOG_SYNC_CRON_HOUR_UTC must be between 0 and 23, got {}",
                self.cron_hour_utc
            );
        }

        if let Some(hour) = self.retry_hours_utc.iter().find(|h| **h > 23) {
            anyhow::bail!(
                "CATALOG_SYNC_RETRY_HOURS_UTC entries must be between 0 and 23, got {}",
                hour
            );
        }

        if self.request_budget <= self.page_size {
            tracing::warn!(
                "Request budget ({}) cannot cover one page of {} items plus its list call; \
                 pagination will never advance",
                self.request_budget,
                self.page_size
            );
        }

        Ok(())
    }

    pub fn stale_after(&self) -> chrono::Duration {
        // Capped at a year so the conversion cannot overflow
        chrono::Duration::seconds(self.stale_after_secs.min(365 * 24 * 60 * 60) as i64)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pipeline: DEFAULT_PIPELINE.to_string(),
            request_budget: DEFAULT_REQUEST_BUDGET,
            page_size: DEFAULT_PAGE_SIZE,
            backfill_batch_size: DEFAULT_BACKFILL_BATCH_SIZE,
            cron_hour_utc: DEFAULT_CRON_HOUR_UTC,
            retry_hours_utc: DEFAULT_RETRY_HOURS_UTC.to_vec(),
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_PERENUAL_BASE_URL.to_string(),
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            sync: SyncConfig::default(),
            provider: ProviderConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.request_budget, 95);
        assert_eq!(config.sync.retry_hours_utc, vec![6, 9, 12]);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let sync = SyncConfig {
            request_budget: 0,
            ..SyncConfig::default()
        };
        assert!(sync.validate().is_err());
    }

    #[test]
    fn test_out_of_range_hours_rejected() {
        let cron = SyncConfig {
            cron_hour_utc: 24,
            ..SyncConfig::default()
        };
        assert!(cron.validate().is_err());

        let retry = SyncConfig {
            retry_hours_utc: vec![6, 30],
            ..SyncConfig::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let mut config = Config::default();
        config.provider.base_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_never_serialized() {
        let provider = ProviderConfig {
            api_key: "sk-secret".to_string(),
            ..ProviderConfig::default()
        };
        let json = serde_json::to_string(&provider).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    #[serial]
    fn test_sync_config_from_env() {
        std::env::set_var("CATALOG_SYNC_REQUEST_BUDGET", "40");
        std::env::set_var("CATALOG_SYNC_RETRY_HOURS_UTC", "7,10");
        let sync = SyncConfig::from_env().unwrap();
        std::env::remove_var("CATALOG_SYNC_REQUEST_BUDGET");
        std::env::remove_var("CATALOG_SYNC_RETRY_HOURS_UTC");

        assert_eq!(sync.request_budget, 40);
        assert_eq!(sync.retry_hours_utc, vec![7, 10]);
        assert_eq!(sync.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    #[serial]
    fn test_malformed_budget_is_an_error() {
        std::env::set_var("CATALOG_SYNC_REQUEST_BUDGET", "lots");
        let result = SyncConfig::from_env();
        std::env::remove_var("CATALOG_SYNC_REQUEST_BUDGET");

        assert!(result.is_err());
    }
}
