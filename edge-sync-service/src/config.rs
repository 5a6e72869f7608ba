use serde::Deserialize;
use std::{fs, time::Duration};
use tracing_subscriber::EnvFilter;

use crate::{
    governor::{GovernorConfig, RetryPolicy},
    pool::PoolConfig,
    protocol::ProtocolKind,
    sync::RetentionPolicy,
};

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    #[serde(default = "default_store_connections")]
    pub max_connections: u32,
}

/// How the edge reaches the central side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentralMode {
    /// Talk to the central database directly.
    #[default]
    Store,
    /// Talk to the central HTTP API.
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CentralConfig {
    #[serde(default)]
    pub mode: CentralMode,
    pub store: Option<StoreConfig>,
    pub upload_url: Option<String>,
    pub config_url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantConfig {
    /// Used until the tenant row has been synchronized from the central side.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub poll_interval_ms: u64,
    pub protocol: ProtocolKind,
    pub read_timeout_ms: u64,
    pub default_unit_id: u8,
    pub max_batch_size: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            protocol: ProtocolKind::Modbus,
            read_timeout_ms: 5_000,
            default_unit_id: 1,
            max_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 16,
            idle_timeout_ms: 300_000,
            acquire_timeout_ms: 10_000,
            health_check_interval_ms: 60_000,
            close_timeout_ms: 5_000,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub breaker_threshold: u32,
    pub breaker_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            breaker_threshold: 5,
            breaker_timeout_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    pub fn to_governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            retry: self.to_policy(),
            breaker_threshold: self.breaker_threshold,
            breaker_timeout: Duration::from_millis(self.breaker_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub interval_ms: u64,
    /// Fallback when the tenant carries no upload batch size.
    pub batch_size: usize,
    pub max_retry_count: i32,
    pub retention: RetentionPolicy,
    /// Synchronized rows older than this are purged; `None` keeps them.
    pub purge_after_days: Option<u32>,
    pub stats_window_hours: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
            batch_size: 1_000,
            max_retry_count: 5,
            retention: RetentionPolicy::MarkSynchronized,
            purge_after_days: Some(30),
            stats_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub interval_ms: u64,
    /// Fallback when the tenant carries no download batch size.
    pub page_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_600_000,
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "warn,edge_sync_service=info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub edge_store: StoreConfig,
    pub central: CentralConfig,
    #[serde(default)]
    pub tenant: TenantConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_store_connections() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("EDGE_SYNC_CONFIG").unwrap_or_else(|_| "edge-sync.toml".to_string());
        let contents =
            fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let collection = &self.collection;
        anyhow::ensure!(
            collection.poll_interval_ms > 0,
            "collection.poll_interval_ms must be positive"
        );
        anyhow::ensure!(
            collection.read_timeout_ms > 0,
            "collection.read_timeout_ms must be positive"
        );
        anyhow::ensure!(
            collection.max_batch_size > 0,
            "collection.max_batch_size must be positive"
        );
        anyhow::ensure!(self.pool.max_connections > 0, "pool.max_connections must be positive");
        anyhow::ensure!(self.retry.multiplier >= 1.0, "retry.multiplier must be at least 1.0");
        anyhow::ensure!(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "retry.base_delay_ms exceeds retry.max_delay_ms"
        );
        anyhow::ensure!(
            self.retry.breaker_threshold > 0,
            "retry.breaker_threshold must be positive"
        );
        anyhow::ensure!(self.upload.interval_ms > 0, "upload.interval_ms must be positive");
        anyhow::ensure!(self.upload.batch_size > 0, "upload.batch_size must be positive");
        anyhow::ensure!(self.upload.max_retry_count > 0, "upload.max_retry_count must be positive");
        anyhow::ensure!(self.download.interval_ms > 0, "download.interval_ms must be positive");
        anyhow::ensure!(self.download.page_size > 0, "download.page_size must be positive");
        let filter = &self.logging.filter;
        EnvFilter::try_new(filter)
            .map_err(|e| anyhow::anyhow!("logging.filter {filter:?} is invalid: {e}"))?;

        match self.central.mode {
            CentralMode::Store => {
                anyhow::ensure!(
                    self.central.store.is_some(),
                    "central.mode = \"store\" requires [central.store]"
                )
            }
            CentralMode::Http => anyhow::ensure!(
                self.central.upload_url.is_some() && self.central.config_url.is_some(),
                "central.mode = \"http\" requires central.upload_url and central.config_url"
            ),
        }
        Ok(())
    }
}
