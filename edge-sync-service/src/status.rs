//! Operator-facing snapshot of the engine, served as JSON on `/status`.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    cache::ConfigCaches,
    collector::{CollectionManager, CycleResult, ReadPerformance},
    governor::{GovernorSnapshot, RetryGovernor},
    pool::{ConnectionPool, PoolStats},
    protocol::ClientFactory,
    sync::{DownloadReport, SyncOutcome, UploadStatistics, UploadSyncManager},
};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatus {
    pub tenant: bool,
    pub meters: bool,
    pub device_registers: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub caches: CacheStatus,
    pub pool: PoolStats,
    pub governor: GovernorSnapshot,
    pub read_performance: ReadPerformance,
    pub upload_in_progress: bool,
    pub upload: Option<UploadStatistics>,
    pub upload_error: Option<String>,
    pub last_cycle: Option<CycleResult>,
    pub last_upload: Option<SyncOutcome>,
    pub last_download: Option<DownloadReport>,
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn report(&self) -> StatusReport;
}

/// Latest pass results, written by the loops and read by `/status`.
#[derive(Default)]
pub struct LastResults {
    cycle: ArcSwapOption<CycleResult>,
    upload: ArcSwapOption<SyncOutcome>,
    download: ArcSwapOption<DownloadReport>,
}

impl LastResults {
    pub fn record_cycle(&self, result: CycleResult) {
        self.cycle.store(Some(Arc::new(result)));
    }

    pub fn record_upload(&self, outcome: SyncOutcome) {
        self.upload.store(Some(Arc::new(outcome)));
    }

    pub fn record_download(&self, report: DownloadReport) {
        self.download.store(Some(Arc::new(report)));
    }
}

pub struct EngineStatus<F: ClientFactory> {
    pub pool: Arc<ConnectionPool<F>>,
    pub governor: Arc<RetryGovernor>,
    pub caches: Arc<ConfigCaches>,
    pub collector: Arc<CollectionManager<F>>,
    pub upload: Arc<UploadSyncManager>,
    pub last: Arc<LastResults>,
    pub window_hours: u32,
}

#[async_trait]
impl<F: ClientFactory> StatusSource for EngineStatus<F> {
    async fn report(&self) -> StatusReport {
        let (upload, upload_error) = match self.upload.statistics(self.window_hours).await {
            Ok(stats) => (Some(stats), None),
            Err(e) => (None, Some(e.to_string())),
        };

        StatusReport {
            generated_at: OffsetDateTime::now_utc(),
            caches: CacheStatus {
                tenant: self.caches.tenant.is_valid(),
                meters: self.caches.meters.is_valid(),
                device_registers: self.caches.device_registers.is_valid(),
            },
            pool: self.pool.stats(),
            governor: self.governor.snapshot(),
            read_performance: self.collector.read_performance(),
            upload_in_progress: self.upload.is_syncing(),
            upload,
            upload_error,
            last_cycle: self.last.cycle.load_full().map(|c| (*c).clone()),
            last_upload: self.last.upload.load_full().map(|u| (*u).clone()),
            last_download: self.last.download.load_full().map(|d| (*d).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{
        batcher::ReadingBatcher,
        collector::PerformanceTracker,
        governor::{GovernorConfig, RetryPolicy},
        pool::PoolConfig,
        protocol::{EventPublisher, ProtocolKind},
        store::Store,
        sync::{RetentionPolicy, UploadSettings},
        test_support::{seeded_edge_store, DeviceFarm, RecordingTransport, ScriptedFactory},
    };

    #[tokio::test]
    async fn report_reflects_cycle_and_backlog() {
        let store = seeded_edge_store(10).await;
        let farm = DeviceFarm::new();
        farm.values(1, &[(10, 2300.0), (11, 105.0)]);
        let events = EventPublisher::new(64);
        let pool = Arc::new(ConnectionPool::new(
            PoolConfig::default(),
            ScriptedFactory {
                farm,
                events: events.clone(),
            },
        ));
        let governor = Arc::new(RetryGovernor::new(GovernorConfig {
            retry: RetryPolicy::default(),
            breaker_threshold: 5,
            breaker_timeout: Duration::from_secs(60),
        }));
        let caches = Arc::new(ConfigCaches::new());
        caches.initialize(store.as_ref()).await.unwrap();
        let edge: Arc<dyn Store> = store.clone();
        let collector = Arc::new(CollectionManager::new(
            Arc::clone(&pool),
            Arc::clone(&governor),
            Arc::clone(&caches),
            Arc::new(ReadingBatcher::new(Arc::clone(&edge), 100, RetryPolicy::default())),
            ProtocolKind::Modbus,
            PerformanceTracker::new(events.subscribe()),
        ));
        let upload = Arc::new(UploadSyncManager::new(
            edge,
            RecordingTransport::new(),
            Arc::clone(&caches.tenant),
            UploadSettings {
                fallback_batch_size: 100,
                fallback_api_key: None,
                max_retry_count: 5,
                retention: RetentionPolicy::MarkSynchronized,
                store_retry: RetryPolicy::default(),
            },
        ));
        let last = Arc::new(LastResults::default());
        let status = EngineStatus {
            pool,
            governor,
            caches,
            collector: Arc::clone(&collector),
            upload,
            last: Arc::clone(&last),
            window_hours: 24,
        };

        last.record_cycle(collector.run_cycle().await.unwrap());
        let report = status.report().await;

        assert!(report.caches.meters && report.caches.tenant);
        assert_eq!(report.upload.as_ref().unwrap().queue_size, 2);
        assert_eq!(report.last_cycle.as_ref().unwrap().readings_persisted, 2);
        assert!(report.last_upload.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["upload"]["queue_size"], 2);
        assert!(json["governor"]["breakers"].is_array());
    }
}
