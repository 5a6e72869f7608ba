//! Moves unsynchronized readings from the edge store upstream.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use meter_client::domain::{NewSyncLog, SyncLogSummary};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    cache::TenantCache,
    governor::{retry_async, RetryPolicy},
    store::{Store, StoreError},
    transport::{UploadBatch, UploadTransport},
};

/// What happens to rows once the central side confirmed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    #[serde(rename = "mark")]
    MarkSynchronized,
    Delete,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Used when the tenant row is missing or has no usable batch size.
    pub fallback_batch_size: usize,
    pub fallback_api_key: Option<String>,
    pub max_retry_count: i32,
    pub retention: RetentionPolicy,
    pub store_retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    AlreadySyncing,
    Idle,
    Uploaded { rows: usize, records: usize, processed: u64 },
    Failed { rows: usize, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadStatistics {
    pub window_hours: u32,
    pub queue_size: u64,
    pub stuck_rows: u64,
    pub summary: SyncLogSummary,
}

impl UploadStatistics {
    pub async fn collect(
        store: &dyn Store,
        window_hours: u32,
        max_retry_count: i32,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            window_hours,
            queue_size: store.count_unsynchronized().await?,
            stuck_rows: store.count_stuck(max_retry_count).await?,
            summary: store.summarize_sync_logs(window_hours).await?,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no api key available: tenant not synchronized and none configured")]
    NoApiKey,
}

/// Clears the in-progress flag when a sync pass ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UploadSyncManager {
    edge: Arc<dyn Store>,
    transport: Arc<dyn UploadTransport>,
    tenant: Arc<TenantCache>,
    settings: UploadSettings,
    syncing: AtomicBool,
}

impl UploadSyncManager {
    pub fn new(
        edge: Arc<dyn Store>,
        transport: Arc<dyn UploadTransport>,
        tenant: Arc<TenantCache>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            edge,
            transport,
            tenant,
            settings,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn queue_size(&self) -> Result<u64, StoreError> {
        self.edge.count_unsynchronized().await
    }

    fn batch_size_and_key(&self) -> Result<(usize, String), UploadError> {
        let tenant = self.tenant.tenant().ok().flatten();
        let batch_size = tenant
            .as_ref()
            .and_then(|t| usize::try_from(t.upload_batch_size).ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.fallback_batch_size)
            .max(1);
        let api_key = tenant
            .map(|t| t.api_key)
            .filter(|k| !k.is_empty())
            .or_else(|| self.settings.fallback_api_key.clone())
            .ok_or(UploadError::NoApiKey)?;
        Ok((batch_size, api_key))
    }

    /// Upload one batch of the oldest unsynchronized readings.
    ///
    /// Concurrent calls return [`SyncOutcome::AlreadySyncing`] without touching the store.
    pub async fn sync_readings(&self) -> Result<SyncOutcome, UploadError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("upload sync already running");
            return Ok(SyncOutcome::AlreadySyncing);
        }
        let _guard = SyncGuard(&self.syncing);

        let (batch_size, api_key) = self.batch_size_and_key()?;
        let max_retry = self.settings.max_retry_count;
        let rows = retry_async(&self.settings.store_retry, "select_unsynchronized", || {
            self.edge.select_unsynchronized(batch_size, max_retry)
        })
        .await?;

        let queue = self.edge.count_unsynchronized().await.unwrap_or_default();
        metrics::gauge!("upload_queue_size").set(queue as f64);

        if rows.is_empty() {
            return Ok(SyncOutcome::Idle);
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let batch = UploadBatch::from_readings(&rows);
        let row_count = rows.len();

        match self.transport.submit(&batch, &api_key).await {
            Ok(ack) => {
                let store_retry = &self.settings.store_retry;
                match self.settings.retention {
                    RetentionPolicy::MarkSynchronized => {
                        retry_async(store_retry, "mark_synchronized", || {
                            self.edge.mark_synchronized(&ids)
                        })
                        .await?;
                    }
                    RetentionPolicy::Delete => {
                        retry_async(store_retry, "delete_readings", || {
                            self.edge.delete_readings(&ids)
                        })
                        .await?;
                    }
                }
                self.append_log(row_count, true, None).await;
                metrics::counter!("upload_batches_total", "result" => "success").increment(1);
                metrics::counter!("upload_readings_total").increment(row_count as u64);
                tracing::info!(
                    rows = row_count,
                    records = batch.records.len(),
                    processed = ack.processed,
                    batch_id = %batch.batch_id,
                    "upload batch confirmed"
                );
                Ok(SyncOutcome::Uploaded {
                    rows: row_count,
                    records: batch.records.len(),
                    processed: ack.processed,
                })
            }
            Err(e) => {
                let error = e.to_string();
                tracing::warn!(
                    rows = row_count,
                    batch_id = %batch.batch_id,
                    error = %error,
                    "upload batch failed"
                );
                metrics::counter!("upload_batches_total", "result" => "failure").increment(1);
                if let Err(store_err) =
                    retry_async(&self.settings.store_retry, "increment_retry_count", || {
                        self.edge.increment_retry_count(&ids)
                    })
                    .await
                {
                    tracing::error!(error = %store_err, "failed to record upload retry");
                }
                self.append_log(row_count, false, Some(error.clone())).await;
                Ok(SyncOutcome::Failed { rows: row_count, error })
            }
        }
    }

    async fn append_log(&self, batch_size: usize, success: bool, error_message: Option<String>) {
        let entry = NewSyncLog {
            batch_size: i32::try_from(batch_size).unwrap_or(i32::MAX),
            success,
            error_message,
            synced_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.edge.append_sync_log(&entry).await {
            tracing::error!(error = %e, "failed to append sync log");
        }
    }

    pub async fn statistics(&self, window_hours: u32) -> Result<UploadStatistics, StoreError> {
        let max_retry_count = self.settings.max_retry_count;
        UploadStatistics::collect(self.edge.as_ref(), window_hours, max_retry_count).await
    }

    /// Delete synchronized rows created more than `retention_days` ago.
    pub async fn purge_synchronized(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(retention_days));
        let purged = self.edge.delete_synchronized_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, retention_days, "purged synchronized readings");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        test_support::{tenant, RecordingTransport},
        transport::CentralStoreTransport,
    };
    use meter_client::domain::NewReading;
    use std::time::Duration;
    use time::macros::datetime;
    use tokio::sync::Semaphore;

    fn settings(retention: RetentionPolicy) -> UploadSettings {
        UploadSettings {
            fallback_batch_size: 100,
            fallback_api_key: None,
            max_retry_count: 3,
            retention,
            store_retry: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: false,
            },
        }
    }

    async fn edge_with_readings(upload_batch_size: i32, n: usize) -> Arc<MemoryStore> {
        let edge = Arc::new(MemoryStore::new());
        edge.upsert_tenant(&tenant(upload_batch_size)).await.unwrap();
        let readings: Vec<NewReading> = (0..n)
            .map(|i| NewReading {
                meter_id: 1,
                meter_element_id: 1,
                field_name: format!("f{i}"),
                value: i as f64,
                created_at: datetime!(2024-05-01 12:00:00 UTC),
            })
            .collect();
        edge.insert_readings(&readings).await.unwrap();
        edge
    }

    async fn tenant_cache(edge: &MemoryStore) -> Arc<TenantCache> {
        let cache = Arc::new(TenantCache::default());
        cache.initialize(edge).await.unwrap();
        cache
    }

    #[tokio::test]
    async fn uploads_tenant_sized_batch_and_marks_rows() {
        let edge = edge_with_readings(2, 3).await;
        let transport = RecordingTransport::new();
        let manager = UploadSyncManager::new(
            edge.clone(),
            transport.clone(),
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        );

        let outcome = manager.sync_readings().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Uploaded {
                rows: 2,
                records: 1,
                processed: 2
            }
        );
        assert_eq!(transport.api_keys(), vec!["tenant-key".to_string()]);
        assert_eq!(manager.queue_size().await.unwrap(), 1);
        assert!(edge.sync_logs()[0].success);

        manager.sync_readings().await.unwrap();
        assert_eq!(manager.sync_readings().await.unwrap(), SyncOutcome::Idle);
    }

    #[tokio::test]
    async fn delete_retention_removes_confirmed_rows() {
        let edge = edge_with_readings(10, 2).await;
        let manager = UploadSyncManager::new(
            edge.clone(),
            RecordingTransport::new(),
            tenant_cache(&edge).await,
            settings(RetentionPolicy::Delete),
        );

        manager.sync_readings().await.unwrap();
        assert!(edge.readings().is_empty());
    }

    #[tokio::test]
    async fn failure_increments_retry_count_and_logs_error() {
        let edge = edge_with_readings(10, 2).await;
        let transport = RecordingTransport::new();
        transport.fail_next(1);
        let manager = UploadSyncManager::new(
            edge.clone(),
            transport.clone(),
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        );

        let outcome = manager.sync_readings().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Failed { rows: 2, .. }));
        assert!(edge.readings().iter().all(|r| r.retry_count == 1 && !r.is_synchronized));
        let log = &edge.sync_logs()[0];
        assert!(!log.success);
        assert!(log.error_message.as_deref().unwrap().contains("simulated outage"));
    }

    #[tokio::test]
    async fn rows_at_retry_ceiling_are_kept_and_reported() {
        let edge = edge_with_readings(10, 1).await;
        let transport = RecordingTransport::new();
        transport.fail_next(3);
        let manager = UploadSyncManager::new(
            edge.clone(),
            transport.clone(),
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        );

        for _ in 0..3 {
            manager.sync_readings().await.unwrap();
        }
        assert_eq!(manager.sync_readings().await.unwrap(), SyncOutcome::Idle);
        assert_eq!(edge.readings().len(), 1);

        let stats = manager.statistics(24).await.unwrap();
        assert_eq!(stats.stuck_rows, 1);
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.summary.failures, 3);
    }

    #[tokio::test]
    async fn retry_after_failure_does_not_duplicate_central_rows() {
        let edge = edge_with_readings(10, 2).await;
        let central = Arc::new(MemoryStore::new());
        let transport = Arc::new(CentralStoreTransport::new(central.clone()));
        let manager = UploadSyncManager::new(
            edge.clone(),
            transport,
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        );

        // Central insert succeeds but the edge never records it.
        edge.fail_on("mark_synchronized");
        assert!(manager.sync_readings().await.is_err());
        assert_eq!(central.readings().len(), 2);

        edge.recover("mark_synchronized");
        manager.sync_readings().await.unwrap();
        assert_eq!(central.readings().len(), 2);
        assert_eq!(manager.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_sync_is_rejected() {
        let edge = edge_with_readings(10, 2).await;
        let gate = Arc::new(Semaphore::new(0));
        let transport = RecordingTransport::gated(Arc::clone(&gate));
        let manager = Arc::new(UploadSyncManager::new(
            edge.clone(),
            transport.clone(),
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        ));

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.sync_readings().await })
        };
        while !manager.is_syncing() {
            tokio::task::yield_now().await;
        }

        assert_eq!(manager.sync_readings().await.unwrap(), SyncOutcome::AlreadySyncing);
        gate.add_permits(1);
        assert!(matches!(first.await.unwrap().unwrap(), SyncOutcome::Uploaded { .. }));
        assert!(!manager.is_syncing());
        assert_eq!(transport.batches().len(), 1);
    }

    #[tokio::test]
    async fn missing_tenant_falls_back_to_configured_key() {
        let edge = edge_with_readings(10, 1).await;
        edge.delete_tenant(1).await.unwrap();
        let transport = RecordingTransport::new();
        let mut s = settings(RetentionPolicy::MarkSynchronized);
        s.fallback_api_key = Some("bootstrap".into());
        let tenant = tenant_cache(&edge).await;
        let manager = UploadSyncManager::new(edge.clone(), transport.clone(), tenant, s);

        manager.sync_readings().await.unwrap();
        assert_eq!(transport.api_keys(), vec!["bootstrap".to_string()]);

        let no_key = UploadSyncManager::new(
            edge.clone(),
            transport,
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        );
        assert!(matches!(no_key.sync_readings().await, Err(UploadError::NoApiKey)));
        assert!(!no_key.is_syncing());
    }

    #[tokio::test]
    async fn purge_removes_only_old_synchronized_rows() {
        let edge = edge_with_readings(10, 2).await;
        edge.mark_synchronized(&[1]).await.unwrap();
        let manager = UploadSyncManager::new(
            edge.clone(),
            RecordingTransport::new(),
            tenant_cache(&edge).await,
            settings(RetentionPolicy::MarkSynchronized),
        );

        assert_eq!(manager.purge_synchronized(1).await.unwrap(), 1);
        assert_eq!(edge.readings().len(), 1);
    }

    #[test]
    fn retention_policy_parses_config_names() {
        let parse = |name: &str| serde_json::from_value::<RetentionPolicy>(serde_json::json!(name));
        assert_eq!(parse("mark").unwrap(), RetentionPolicy::MarkSynchronized);
        assert_eq!(parse("delete").unwrap(), RetentionPolicy::Delete);
        assert!(parse("keep").is_err());
    }
}
