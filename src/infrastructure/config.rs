//! Configuration infrastructure
//!
//! One `AppConfig` with a section per concern. Two ways in:
//! 1. `AppConfig::from_file` - layered file + `HARVEST_` environment overrides (config crate)
//! 2. `ConfigManager` - JSON file in the user config directory, created on first run

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::domain::ResumePolicy;
use crate::infrastructure::http_client::HttpClientConfig;
use crate::infrastructure::retry_policy::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub harvest: HarvestConfig,
    pub http: HttpClientConfig,
    pub retry: RetryPolicy,
    pub egress: EgressConfig,
    pub credentials: CredentialStoreConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Per-run harvesting behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Comments must be strictly longer than this many UTF-8 bytes
    pub min_comment_bytes: usize,
    /// Collections processed in parallel by `run_collections`
    pub max_concurrent_collections: usize,
    pub resume: ResumePolicy,
}

/// Proxy supplier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub enabled: bool,
    /// Endpoint returning one `host:port` per call
    pub supplier_url: String,
    pub auth_key: String,
    pub password: String,
    /// Known-good target fetched through a candidate proxy
    pub probe_url: String,
    /// JSON field the probe response must carry
    pub probe_field: String,
    pub probe_timeout_seconds: u64,
    pub supplier_timeout_seconds: u64,
    pub lease_ttl_seconds: u64,
}

/// Shared multi-site credential file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialStoreConfig {
    pub path: PathBuf,
    /// Give up acquiring the file lock after this long
    pub lock_timeout_ms: u64,
    pub lock_retry_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Defaults to `./logs` when unset
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,
    /// Offset applied to rendered timestamps
    pub utc_offset_hours: i32,
    /// Module-specific log level filters (e.g., "sqlx": "warn")
    pub module_filters: BTreeMap<String, String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            min_comment_bytes: defaults::MIN_COMMENT_BYTES,
            max_concurrent_collections: defaults::MAX_CONCURRENT_COLLECTIONS,
            resume: ResumePolicy::default(),
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            supplier_url: String::new(),
            auth_key: String::new(),
            password: String::new(),
            probe_url: defaults::EGRESS_PROBE_URL.to_string(),
            probe_field: defaults::EGRESS_PROBE_FIELD.to_string(),
            probe_timeout_seconds: defaults::EGRESS_PROBE_TIMEOUT_SECONDS,
            supplier_timeout_seconds: defaults::EGRESS_SUPPLIER_TIMEOUT_SECONDS,
            lease_ttl_seconds: defaults::EGRESS_LEASE_TTL_SECONDS,
        }
    }
}

impl Default for CredentialStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::CREDENTIAL_STORE_PATH),
            lock_timeout_ms: defaults::CREDENTIAL_LOCK_TIMEOUT_MS,
            lock_retry_ms: defaults::CREDENTIAL_LOCK_RETRY_MS,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::DATABASE_MAX_CONNECTIONS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            max_files: defaults::LOG_MAX_FILES,
            utc_offset_hours: defaults::LOG_UTC_OFFSET_HOURS,
            module_filters: BTreeMap::from([
                ("sqlx".to_string(), "warn".to_string()),
                ("reqwest".to_string(), "info".to_string()),
                ("hyper".to_string(), "warn".to_string()),
                ("h2".to_string(), "warn".to_string()),
            ]),
        }
    }
}

impl AppConfig {
    /// Load from a file (format from its extension) with `HARVEST_` environment
    /// overrides, e.g. `HARVEST_RETRY__MAX_ATTEMPTS=3`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| {
            Err(ConfigError::Validation {
                message: message.to_string(),
            })
        };

        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.retry.min_wait_ms > self.retry.max_wait_ms {
            return fail("retry.min_wait_ms cannot be greater than retry.max_wait_ms");
        }
        if self.harvest.max_concurrent_collections == 0 {
            return fail("harvest.max_concurrent_collections must be greater than 0");
        }
        if !(1..=120).contains(&self.http.timeout_seconds) {
            return fail("http.timeout_seconds must be within 1..=120");
        }
        if self.http.max_requests_per_second == 0 {
            return fail("http.max_requests_per_second must be greater than 0");
        }
        if self.http.user_agents.is_empty() {
            return fail("http.user_agents must contain at least one agent");
        }
        if self.egress.enabled && self.egress.supplier_url.is_empty() {
            return fail("egress.supplier_url is required when egress is enabled");
        }
        Ok(())
    }
}

/// JSON configuration file in the user's config directory
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(config_dir)
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist.
    /// A file that no longer parses is backed up and replaced by defaults.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file unreadable: {}", parse_error);
                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }
                self.reset_to_defaults().await
            }
        }
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    pub async fn reset_to_defaults(&self) -> Result<AppConfig> {
        info!("🔄 Resetting configuration to defaults");
        let default_config = AppConfig::default();
        self.save_config(&default_config).await?;
        Ok(default_config)
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "review-harvester";
    pub const CONFIG_FILE_NAME: &str = "harvester_config.json";
    pub const ENV_PREFIX: &str = "HARVEST";

    pub const MIN_COMMENT_BYTES: usize = 100;
    pub const MAX_CONCURRENT_COLLECTIONS: usize = 1;

    /// Per-call network timeout (distinct from retry backoff)
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 2;

    pub const RETRY_MAX_ATTEMPTS: u32 = 10;
    pub const RETRY_MIN_WAIT_MS: u64 = 4_000;
    pub const RETRY_MAX_WAIT_MS: u64 = 10_000;
    pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const RETRY_JITTER_MS: u64 = 1_000;

    pub const EGRESS_PROBE_URL: &str = "http://httpbin.org/ip";
    pub const EGRESS_PROBE_FIELD: &str = "origin";
    pub const EGRESS_PROBE_TIMEOUT_SECONDS: u64 = 5;
    pub const EGRESS_SUPPLIER_TIMEOUT_SECONDS: u64 = 10;
    pub const EGRESS_LEASE_TTL_SECONDS: u64 = 60;

    pub const CREDENTIAL_STORE_PATH: &str = "accounts/accounts.json";
    pub const CREDENTIAL_LOCK_TIMEOUT_MS: u64 = 10_000;
    pub const CREDENTIAL_LOCK_RETRY_MS: u64 = 50;

    pub const DATABASE_URL: &str = "sqlite:data/reviews.db";
    pub const DATABASE_MAX_CONNECTIONS: u32 = 5;
    pub const DATABASE_BUSY_TIMEOUT_SECS: u64 = 10;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "review-harvester.log";
    pub const LOG_MAX_FILES: u32 = 7;
    pub const LOG_UTC_OFFSET_HOURS: i32 = 8;
}
