//! Whole-engine runs: configuration download, one collection cycle, uploads.

use std::{sync::Arc, time::Duration};

use crate::{
    batcher::ReadingBatcher,
    cache::ConfigCaches,
    collector::{CollectionManager, PerformanceTracker},
    governor::{GovernorConfig, RetryGovernor, RetryPolicy},
    pool::{ConnectionPool, PoolConfig},
    protocol::{EventPublisher, ProtocolKind},
    store::{MemoryStore, Store},
    sync::{
        ConfigSyncManager, DownloadSettings, RetentionPolicy, SyncOutcome, UploadSettings,
        UploadSyncManager,
    },
    test_support::{seeded_edge_store, DeviceFarm, RecordingTransport, ScriptedFactory},
    transport::{CentralStoreTransport, UploadTransport},
};

struct Engine {
    edge: Arc<MemoryStore>,
    farm: Arc<DeviceFarm>,
    caches: Arc<ConfigCaches>,
    collector: CollectionManager<ScriptedFactory>,
    download: ConfigSyncManager,
    upload: UploadSyncManager,
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        multiplier: 1.0,
        jitter: false,
    }
}

/// An empty edge wired to `central`, bootstrapped only with the api key.
async fn engine(central: Arc<MemoryStore>, transport: Arc<dyn UploadTransport>) -> Engine {
    let edge = Arc::new(MemoryStore::new());
    let farm = DeviceFarm::new();
    let events = EventPublisher::new(64);
    let pool = Arc::new(ConnectionPool::new(
        PoolConfig::default(),
        ScriptedFactory {
            farm: Arc::clone(&farm),
            events: events.clone(),
        },
    ));
    let governor = Arc::new(RetryGovernor::new(GovernorConfig {
        retry: quick_retry(),
        breaker_threshold: 5,
        breaker_timeout: Duration::from_secs(60),
    }));
    let caches = Arc::new(ConfigCaches::new());
    caches.initialize(edge.as_ref()).await.unwrap();

    let collector = CollectionManager::new(
        pool,
        governor,
        Arc::clone(&caches),
        Arc::new(ReadingBatcher::new(edge.clone(), 100, quick_retry())),
        ProtocolKind::Modbus,
        PerformanceTracker::new(events.subscribe()),
    );
    let download = ConfigSyncManager::new(
        central,
        edge.clone(),
        Arc::clone(&caches),
        DownloadSettings {
            fallback_page_size: 50,
            fallback_api_key: Some("tenant-key".into()),
        },
    );
    let upload = UploadSyncManager::new(
        edge.clone(),
        transport,
        Arc::clone(&caches.tenant),
        UploadSettings {
            fallback_batch_size: 100,
            fallback_api_key: None,
            max_retry_count: 5,
            retention: RetentionPolicy::MarkSynchronized,
            store_retry: quick_retry(),
        },
    );

    Engine {
        edge,
        farm,
        caches,
        collector,
        download,
        upload,
    }
}

#[tokio::test]
async fn voltage_and_current_reach_central_one_reading_per_upload() {
    // Central tenant carries upload_batch_size = 1.
    let central = seeded_edge_store(1).await;
    let transport = RecordingTransport::new();
    let e = engine(central, transport.clone()).await;
    assert!(e.caches.tenant.tenant().unwrap().is_none());

    let report = e.download.sync_config().await.unwrap();
    assert!(report.all_succeeded());
    assert!(report.caches_reloaded);
    assert_eq!(e.caches.device_registers.for_device(1).unwrap().len(), 2);

    e.farm.values(1, &[(10, 2300.0), (11, 105.0)]);
    let cycle = e.collector.run_cycle().await.unwrap();
    assert_eq!(cycle.readings_persisted, 2);
    assert_eq!(e.upload.queue_size().await.unwrap(), 2);

    for _ in 0..2 {
        let outcome = e.upload.sync_readings().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Uploaded { rows: 1, records: 1, .. }));
    }
    assert_eq!(e.upload.sync_readings().await.unwrap(), SyncOutcome::Idle);

    let batches = transport.batches();
    assert_eq!(batches.len(), 2);
    let mut fields: Vec<(String, f64)> = batches
        .iter()
        .flat_map(|b| b.records.iter())
        .inspect(|r| assert_eq!((r.meter_id, r.meter_element_id), (100, 1)))
        .flat_map(|r| r.fields.iter().map(|(k, v)| (k.clone(), *v)))
        .collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].0, "current_line_a");
    assert!((fields[0].1 - 10.5).abs() < 1e-9);
    assert_eq!(fields[1].0, "voltage_a_n");
    assert!((fields[1].1 - 230.0).abs() < 1e-9);
    assert!(transport.api_keys().iter().all(|k| k == "tenant-key"));

    assert_eq!(e.upload.queue_size().await.unwrap(), 0);
    assert!(e.edge.readings().iter().all(|r| r.is_synchronized));
    let stats = e.upload.statistics(24).await.unwrap();
    assert_eq!(stats.summary.successes, 2);
}

#[tokio::test]
async fn readings_land_in_central_store_after_outage() {
    let central = seeded_edge_store(10).await;
    let e = engine(central.clone(), Arc::new(CentralStoreTransport::new(central.clone()))).await;
    e.download.sync_config().await.unwrap();
    e.farm.values(1, &[(10, 2300.0), (11, 105.0)]);
    e.collector.run_cycle().await.unwrap();

    central.fail_on("insert_readings");
    let failed = e.upload.sync_readings().await.unwrap();
    assert!(matches!(failed, SyncOutcome::Failed { rows: 2, .. }));
    assert!(e.edge.readings().iter().all(|r| r.retry_count == 1 && !r.is_synchronized));

    central.recover("insert_readings");
    let outcome = e.upload.sync_readings().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Uploaded { rows: 2, records: 1, processed: 2 }));

    let landed = central.readings();
    assert_eq!(landed.len(), 2);
    let edge_ids: Vec<String> = e.edge.readings().iter().map(|r| r.event_id.clone()).collect();
    assert!(landed.iter().all(|r| edge_ids.contains(&r.event_id)));
}
