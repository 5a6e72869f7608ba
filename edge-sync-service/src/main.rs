use anyhow::{anyhow, Result};
use edge_sync_service::{
    batcher::ReadingBatcher,
    cache::ConfigCaches,
    collector::{CollectionManager, PerformanceTracker},
    config::{AppConfig, CentralMode},
    governor::RetryGovernor,
    metrics_server,
    observability,
    pool::ConnectionPool,
    protocol::{DeviceClientFactory, EventPublisher},
    scheduler::spawn_periodic,
    status::{EngineStatus, LastResults, StatusSource},
    store::{ConfigSource, PgStore, Store},
    sync::{
        ConfigSyncManager, DownloadError, DownloadSettings, SyncOutcome, UploadSettings,
        UploadSyncManager,
    },
    transport::{CentralStoreTransport, HttpConfigSource, HttpUploadTransport, UploadTransport},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

const CLIENT_EVENT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    observability::init_tracing(&cfg.logging)?;

    let edge: Arc<dyn Store> =
        Arc::new(PgStore::connect(&cfg.edge_store.uri, cfg.edge_store.max_connections).await?);

    let central: (Arc<dyn UploadTransport>, Arc<dyn ConfigSource>) = match cfg.central.mode {
        CentralMode::Store => {
            let store_cfg = cfg
                .central
                .store
                .as_ref()
                .ok_or_else(|| anyhow!("central.store must be configured in store mode"))?;
            let central =
                Arc::new(PgStore::connect(&store_cfg.uri, store_cfg.max_connections).await?);
            (Arc::new(CentralStoreTransport::new(central.clone())), central)
        }
        CentralMode::Http => {
            let timeout = Duration::from_millis(cfg.central.request_timeout_ms);
            let upload_url = cfg
                .central
                .upload_url
                .clone()
                .ok_or_else(|| anyhow!("central.upload_url must be configured in http mode"))?;
            let config_url = cfg
                .central
                .config_url
                .clone()
                .ok_or_else(|| anyhow!("central.config_url must be configured in http mode"))?;
            (
                Arc::new(HttpUploadTransport::new(upload_url, timeout)?),
                Arc::new(HttpConfigSource::new(config_url, timeout)?),
            )
        }
    };
    let (transport, config_source) = central;

    let caches = Arc::new(ConfigCaches::new());
    let events = EventPublisher::new(CLIENT_EVENT_CAPACITY);
    let pool = Arc::new(ConnectionPool::new(
        cfg.pool.to_pool_config(),
        DeviceClientFactory {
            kind: cfg.collection.protocol,
            timeout: Duration::from_millis(cfg.collection.read_timeout_ms),
            default_unit_id: cfg.collection.default_unit_id,
            events: events.clone(),
        },
    ));
    let governor = Arc::new(RetryGovernor::new(cfg.retry.to_governor_config()));
    let batcher = Arc::new(ReadingBatcher::new(
        Arc::clone(&edge),
        cfg.collection.max_batch_size,
        cfg.retry.to_policy(),
    ));
    let collector = Arc::new(CollectionManager::new(
        Arc::clone(&pool),
        Arc::clone(&governor),
        Arc::clone(&caches),
        batcher,
        cfg.collection.protocol,
        PerformanceTracker::new(events.subscribe()),
    ));
    let upload = Arc::new(UploadSyncManager::new(
        Arc::clone(&edge),
        transport,
        Arc::clone(&caches.tenant),
        UploadSettings {
            fallback_batch_size: cfg.upload.batch_size,
            fallback_api_key: cfg.tenant.api_key.clone(),
            max_retry_count: cfg.upload.max_retry_count,
            retention: cfg.upload.retention,
            store_retry: cfg.retry.to_policy(),
        },
    ));
    let download = Arc::new(ConfigSyncManager::new(
        config_source,
        Arc::clone(&edge),
        Arc::clone(&caches),
        DownloadSettings {
            fallback_page_size: cfg.download.page_size,
            fallback_api_key: cfg.tenant.api_key.clone(),
        },
    ));
    let last = Arc::new(LastResults::default());

    // A fresh edge has nothing to cache yet; pull configuration before polling.
    let needs_download = match caches.initialize(edge.as_ref()).await {
        Ok(()) => caches.tenant.tenant().ok().flatten().is_none(),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "cache initialization failed, falling back to configuration sync"
            );
            true
        }
    };
    if needs_download {
        match download.sync_config().await {
            Ok(report) => last.record_download(report),
            Err(e) => tracing::error!(error = %e, "initial configuration sync failed"),
        }
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if let Some(metrics_cfg) = &cfg.metrics {
        let status: Arc<dyn StatusSource> = Arc::new(EngineStatus {
            pool: Arc::clone(&pool),
            governor: Arc::clone(&governor),
            caches: Arc::clone(&caches),
            collector: Arc::clone(&collector),
            upload: Arc::clone(&upload),
            last: Arc::clone(&last),
            window_hours: cfg.upload.stats_window_hours,
        });
        let state = metrics_server::ServerState {
            status,
            governor: Arc::clone(&governor),
        };
        tasks.push(metrics_server::serve(&metrics_cfg.bind_addr, state, cancel.clone()).await?);
    }

    tasks.push(pool.spawn_health_check(cancel.clone()));

    {
        let collector = Arc::clone(&collector);
        let last = Arc::clone(&last);
        tasks.push(spawn_periodic(
            "collection",
            Duration::from_millis(cfg.collection.poll_interval_ms),
            cancel.clone(),
            move || {
                let collector = Arc::clone(&collector);
                let last = Arc::clone(&last);
                async move {
                    match collector.run_cycle().await {
                        Ok(result) => last.record_cycle(result),
                        Err(e) => tracing::warn!(error = %e, "collection cycle skipped"),
                    }
                }
            },
        ));
    }

    {
        let upload = Arc::clone(&upload);
        let last = Arc::clone(&last);
        let purge_after_days = cfg.upload.purge_after_days;
        tasks.push(spawn_periodic(
            "upload",
            Duration::from_millis(cfg.upload.interval_ms),
            cancel.clone(),
            move || {
                let upload = Arc::clone(&upload);
                let last = Arc::clone(&last);
                async move {
                    match upload.sync_readings().await {
                        Ok(SyncOutcome::AlreadySyncing) => {
                            tracing::debug!("upload still running, pass skipped")
                        }
                        Ok(outcome) => last.record_upload(outcome),
                        Err(e) => tracing::error!(error = %e, "upload sync failed"),
                    }
                    if let Some(days) = purge_after_days {
                        if let Err(e) = upload.purge_synchronized(days).await {
                            tracing::warn!(error = %e, "purging synchronized readings failed");
                        }
                    }
                }
            },
        ));
    }

    {
        let download = Arc::clone(&download);
        let last = Arc::clone(&last);
        tasks.push(spawn_periodic(
            "download",
            Duration::from_millis(cfg.download.interval_ms),
            cancel.clone(),
            move || {
                let download = Arc::clone(&download);
                let last = Arc::clone(&last);
                async move {
                    match download.sync_config().await {
                        Ok(report) => last.record_download(report),
                        Err(DownloadError::AlreadySyncing) => {
                            tracing::debug!("configuration sync still running")
                        }
                        Err(e) => tracing::error!(error = %e, "configuration sync failed"),
                    }
                }
            },
        ));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task ended abnormally");
        }
    }
    if let Err(e) = pool.close_all().await {
        tracing::warn!(error = %e, "some device connections did not close cleanly");
    }
    tracing::info!("edge sync service stopped");
    Ok(())
}
