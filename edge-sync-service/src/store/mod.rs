//! Persistence seam shared by the edge store and the central store.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use meter_client::domain::{
    DeviceRegister, Meter, MeterKey, NewReading, NewSyncLog, PendingReading, Register,
    SyncLogSummary, Tenant,
};
use serde::Deserialize;
use time::OffsetDateTime;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.into())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_tenant(&self) -> Result<Option<Tenant>, StoreError>;
    async fn load_meters(&self) -> Result<Vec<Meter>, StoreError>;
    async fn load_registers(&self) -> Result<Vec<Register>, StoreError>;
    async fn load_device_registers(&self) -> Result<Vec<DeviceRegister>, StoreError>;

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;
    async fn delete_tenant(&self, tenant_id: i64) -> Result<(), StoreError>;
    async fn upsert_meter(&self, tenant_id: i64, meter: &Meter) -> Result<(), StoreError>;
    async fn delete_meter(&self, key: MeterKey) -> Result<(), StoreError>;
    async fn upsert_register(&self, register: &Register) -> Result<(), StoreError>;
    async fn delete_register(&self, register_id: i64) -> Result<(), StoreError>;
    async fn upsert_device_register(&self, row: &DeviceRegister) -> Result<(), StoreError>;
    async fn delete_device_register(&self, device_register_id: i64) -> Result<(), StoreError>;

    /// Insert a batch, ignoring readings whose event id is already present.
    /// Returns the number of rows inserted.
    async fn insert_readings(&self, batch: &[NewReading]) -> Result<u64, StoreError>;
    /// Oldest unsynchronized rows with `retry_count < max_retry_count`.
    async fn select_unsynchronized(&self, limit: usize, max_retry_count: i32)
        -> Result<Vec<PendingReading>, StoreError>;
    async fn mark_synchronized(&self, ids: &[i64]) -> Result<u64, StoreError>;
    async fn delete_readings(&self, ids: &[i64]) -> Result<u64, StoreError>;
    async fn increment_retry_count(&self, ids: &[i64]) -> Result<u64, StoreError>;
    async fn delete_synchronized_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError>;
    async fn count_unsynchronized(&self) -> Result<u64, StoreError>;
    async fn count_stuck(&self, max_retry_count: i32) -> Result<u64, StoreError>;

    async fn append_sync_log(&self, entry: &NewSyncLog) -> Result<(), StoreError>;
    async fn summarize_sync_logs(&self, window_hours: u32) -> Result<SyncLogSummary, StoreError>;
}

/// Everything the central side knows about one tenant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigSnapshot {
    pub tenant: Tenant,
    #[serde(default)]
    pub meters: Vec<Meter>,
    #[serde(default)]
    pub registers: Vec<Register>,
    #[serde(default)]
    pub device_registers: Vec<DeviceRegister>,
}

/// Where download sync pulls authoritative configuration from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch_config(
        &self,
        api_key: &str,
        page_size: usize,
    ) -> Result<ConfigSnapshot, StoreError>;
}

pub(crate) fn unknown_api_key() -> StoreError {
    StoreError::NotFound("no tenant for the configured api key".to_string())
}

pub(crate) fn window_start(window_hours: u32) -> OffsetDateTime {
    OffsetDateTime::now_utc() - time::Duration::hours(i64::from(window_hours))
}

/// Keep only device-register rows for devices that appear in `meters`.
pub(crate) fn device_registers_for(
    meters: &[Meter],
    rows: Vec<DeviceRegister>,
) -> Vec<DeviceRegister> {
    let devices: std::collections::HashSet<i64> = meters.iter().map(|m| m.device_id).collect();
    rows.into_iter().filter(|r| devices.contains(&r.device_id)).collect()
}
