use async_trait::async_trait;
use meter_client::{
    db::{config_queries, reading_queries, sync_log_queries},
    domain::{
        DeviceRegister, Meter, MeterKey, NewReading, NewSyncLog, PendingReading, Register,
        SyncLogSummary, Tenant,
    },
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use time::OffsetDateTime;

use super::{
    device_registers_for, unknown_api_key, window_start, ConfigSnapshot, ConfigSource, Store,
    StoreError,
};

/// PostgreSQL-backed store. Used for the edge store and, when reachable
/// directly, the central store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

#[async_trait]
impl Store for PgStore {
    async fn load_tenant(&self) -> Result<Option<Tenant>, StoreError> {
        Ok(config_queries::fetch_local_tenant(&self.pool).await?)
    }

    async fn load_meters(&self) -> Result<Vec<Meter>, StoreError> {
        Ok(config_queries::list_all_meters(&self.pool).await?)
    }

    async fn load_registers(&self) -> Result<Vec<Register>, StoreError> {
        Ok(config_queries::list_registers(&self.pool).await?)
    }

    async fn load_device_registers(&self) -> Result<Vec<DeviceRegister>, StoreError> {
        Ok(config_queries::list_device_registers(&self.pool).await?)
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        Ok(config_queries::upsert_tenant(&self.pool, tenant).await?)
    }

    async fn delete_tenant(&self, tenant_id: i64) -> Result<(), StoreError> {
        Ok(config_queries::delete_tenant(&self.pool, tenant_id).await?)
    }

    async fn upsert_meter(&self, tenant_id: i64, meter: &Meter) -> Result<(), StoreError> {
        Ok(config_queries::upsert_meter(&self.pool, tenant_id, meter).await?)
    }

    async fn delete_meter(&self, key: MeterKey) -> Result<(), StoreError> {
        Ok(config_queries::delete_meter(&self.pool, key).await?)
    }

    async fn upsert_register(&self, register: &Register) -> Result<(), StoreError> {
        Ok(config_queries::upsert_register(&self.pool, register).await?)
    }

    async fn delete_register(&self, register_id: i64) -> Result<(), StoreError> {
        Ok(config_queries::delete_register(&self.pool, register_id).await?)
    }

    async fn upsert_device_register(&self, row: &DeviceRegister) -> Result<(), StoreError> {
        Ok(config_queries::upsert_device_register(&self.pool, row).await?)
    }

    async fn delete_device_register(&self, device_register_id: i64) -> Result<(), StoreError> {
        Ok(config_queries::delete_device_register(&self.pool, device_register_id).await?)
    }

    async fn insert_readings(&self, batch: &[NewReading]) -> Result<u64, StoreError> {
        Ok(reading_queries::insert_readings(&self.pool, batch).await?)
    }

    async fn select_unsynchronized(
        &self,
        limit: usize,
        max_retry_count: i32,
    ) -> Result<Vec<PendingReading>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(reading_queries::select_unsynchronized(&self.pool, limit, max_retry_count).await?)
    }

    async fn mark_synchronized(&self, ids: &[i64]) -> Result<u64, StoreError> {
        Ok(reading_queries::mark_synchronized(&self.pool, ids).await?)
    }

    async fn delete_readings(&self, ids: &[i64]) -> Result<u64, StoreError> {
        Ok(reading_queries::delete_readings(&self.pool, ids).await?)
    }

    async fn increment_retry_count(&self, ids: &[i64]) -> Result<u64, StoreError> {
        Ok(reading_queries::increment_retry_count(&self.pool, ids).await?)
    }

    async fn delete_synchronized_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        Ok(reading_queries::delete_synchronized_before(&self.pool, cutoff).await?)
    }

    async fn count_unsynchronized(&self) -> Result<u64, StoreError> {
        Ok(count(reading_queries::count_unsynchronized(&self.pool).await?))
    }

    async fn count_stuck(&self, max_retry_count: i32) -> Result<u64, StoreError> {
        Ok(count(reading_queries::count_stuck(&self.pool, max_retry_count).await?))
    }

    async fn append_sync_log(&self, entry: &NewSyncLog) -> Result<(), StoreError> {
        Ok(sync_log_queries::insert_sync_log(&self.pool, entry).await?)
    }

    async fn summarize_sync_logs(&self, window_hours: u32) -> Result<SyncLogSummary, StoreError> {
        Ok(sync_log_queries::summarize_since(&self.pool, window_start(window_hours)).await?)
    }
}

#[async_trait]
impl ConfigSource for PgStore {
    async fn fetch_config(
        &self,
        api_key: &str,
        page_size: usize,
    ) -> Result<ConfigSnapshot, StoreError> {
        let tenant = config_queries::fetch_tenant_by_api_key(&self.pool, api_key)
            .await?
            .ok_or_else(unknown_api_key)?;

        let page_size = page_size.max(1) as i64;
        let mut meters = Vec::new();
        let mut offset = 0i64;
        loop {
            let page =
                config_queries::list_meters_page(&self.pool, tenant.tenant_id, page_size, offset)
                    .await?;
            let fetched = page.len() as i64;
            meters.extend(page);
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        let registers = config_queries::list_registers(&self.pool).await?;
        let rows = config_queries::list_device_registers(&self.pool).await?;
        let device_registers = device_registers_for(&meters, rows);

        tracing::debug!(
            tenant_id = tenant.tenant_id,
            meters = meters.len(),
            registers = registers.len(),
            device_registers = device_registers.len(),
            "fetched tenant configuration from central store"
        );

        Ok(ConfigSnapshot {
            tenant,
            meters,
            registers,
            device_registers,
        })
    }
}
