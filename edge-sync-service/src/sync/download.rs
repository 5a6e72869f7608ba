//! Reconciles configuration from the central side into the edge store.
//!
//! Entities are reconciled in dependency order: tenant, registers, meters,
//! device registers. Each entity is diffed against the edge store and the
//! differences applied row by row; there is no transaction spanning entities,
//! so one entity failing leaves the others reconciled.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use meter_client::domain::{DeviceRegister, Meter, Register, Tenant};
use serde::Serialize;

use super::diff::{diff_by_key, Diff};
use crate::{
    cache::ConfigCaches,
    store::{ConfigSnapshot, ConfigSource, Store, StoreError},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub success: bool,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

impl EntityReport {
    fn failed(mut self, error: StoreError) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub tenant: EntityReport,
    pub registers: EntityReport,
    pub meters: EntityReport,
    pub device_registers: EntityReport,
    pub caches_reloaded: bool,
    pub cache_error: Option<String>,
    pub duration_ms: u64,
}

impl DownloadReport {
    pub fn all_succeeded(&self) -> bool {
        [&self.tenant, &self.registers, &self.meters, &self.device_registers]
            .iter()
            .all(|e| e.success)
    }

    fn any_succeeded(&self) -> bool {
        [&self.tenant, &self.registers, &self.meters, &self.device_registers]
            .iter()
            .any(|e| e.success)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("configuration sync already running")]
    AlreadySyncing,
    #[error("no api key available: tenant not synchronized and none configured")]
    NoApiKey,
    #[error("fetching configuration: {0}")]
    Fetch(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub fallback_page_size: usize,
    pub fallback_api_key: Option<String>,
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConfigSyncManager {
    central: Arc<dyn ConfigSource>,
    edge: Arc<dyn Store>,
    caches: Arc<ConfigCaches>,
    settings: DownloadSettings,
    syncing: AtomicBool,
}

impl ConfigSyncManager {
    pub fn new(
        central: Arc<dyn ConfigSource>,
        edge: Arc<dyn Store>,
        caches: Arc<ConfigCaches>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            central,
            edge,
            caches,
            settings,
            syncing: AtomicBool::new(false),
        }
    }

    pub async fn sync_config(&self) -> Result<DownloadReport, DownloadError> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DownloadError::AlreadySyncing);
        }
        let _guard = SyncGuard(&self.syncing);
        let started = Instant::now();

        let local_tenant = self.caches.tenant.tenant().ok().flatten();
        let api_key = local_tenant
            .as_ref()
            .map(|t| t.api_key.clone())
            .filter(|k| !k.is_empty())
            .or_else(|| self.settings.fallback_api_key.clone())
            .ok_or(DownloadError::NoApiKey)?;
        let page_size = local_tenant
            .as_ref()
            .and_then(|t| usize::try_from(t.download_batch_size).ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.settings.fallback_page_size);

        let snapshot = self
            .central
            .fetch_config(&api_key, page_size)
            .await
            .map_err(DownloadError::Fetch)?;
        let ConfigSnapshot {
            tenant,
            meters,
            registers,
            device_registers,
        } = snapshot;
        let tenant_id = tenant.tenant_id;

        let tenant_report = self.reconcile_tenant(tenant).await;
        let register_report = self.reconcile_registers(registers).await;
        let meter_report = self.reconcile_meters(tenant_id, meters).await;
        let device_register_report = self.reconcile_device_registers(device_registers).await;

        let mut report = DownloadReport {
            tenant: tenant_report,
            registers: register_report,
            meters: meter_report,
            device_registers: device_register_report,
            caches_reloaded: false,
            cache_error: None,
            duration_ms: 0,
        };

        if report.any_succeeded() {
            match self.caches.reload(self.edge.as_ref()).await {
                Ok(()) => report.caches_reloaded = true,
                Err(e) => report.cache_error = Some(e.to_string()),
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        let result = if report.all_succeeded() { "success" } else { "partial" };
        metrics::counter!("config_sync_total", "result" => result).increment(1);
        let (registers, meters) = (&report.registers, &report.meters);
        tracing::info!(
            tenant_id,
            registers = ?(registers.inserted, registers.updated, registers.deleted),
            meters = ?(meters.inserted, meters.updated, meters.deleted),
            device_registers_skipped = report.device_registers.skipped,
            caches_reloaded = report.caches_reloaded,
            result,
            "configuration sync finished"
        );
        Ok(report)
    }

    async fn reconcile_tenant(&self, remote: Tenant) -> EntityReport {
        let report = EntityReport::default();
        let local = match self.edge.load_tenant().await {
            Ok(local) => local.into_iter().collect(),
            Err(e) => return report.failed(e),
        };
        let diff = diff_by_key(local, vec![remote], |t: &Tenant| t.tenant_id);
        let result = apply(
            diff,
            report,
            |t| async move { self.edge.upsert_tenant(&t).await },
            |id| async move { self.edge.delete_tenant(id).await },
        )
        .await;
        log_entity("tenant", &result);
        result
    }

    async fn reconcile_registers(&self, remote: Vec<Register>) -> EntityReport {
        let report = EntityReport::default();
        let local = match self.edge.load_registers().await {
            Ok(local) => local,
            Err(e) => return report.failed(e),
        };
        let diff = diff_by_key(local, remote, |r: &Register| r.register_id);
        let result = apply(
            diff,
            report,
            |r| async move { self.edge.upsert_register(&r).await },
            |id| async move { self.edge.delete_register(id).await },
        )
        .await;
        log_entity("registers", &result);
        result
    }

    async fn reconcile_meters(&self, tenant_id: i64, remote: Vec<Meter>) -> EntityReport {
        let report = EntityReport::default();
        let local = match self.edge.load_meters().await {
            Ok(local) => local,
            Err(e) => return report.failed(e),
        };
        let diff = diff_by_key(local, remote, Meter::key);
        let result = apply(
            diff,
            report,
            |m| async move { self.edge.upsert_meter(tenant_id, &m).await },
            |key| async move { self.edge.delete_meter(key).await },
        )
        .await;
        log_entity("meters", &result);
        result
    }

    /// Rows pointing at a device or register that is not in the edge store
    /// are skipped rather than failing the entity.
    async fn reconcile_device_registers(&self, remote: Vec<DeviceRegister>) -> EntityReport {
        let mut report = EntityReport::default();
        let known = async {
            let meters = self.edge.load_meters().await?;
            let devices: HashSet<i64> = meters.iter().map(|m| m.device_id).collect();
            let registers = self.edge.load_registers().await?;
            let registers: HashSet<i64> = registers.iter().map(|r| r.register_id).collect();
            let local = self.edge.load_device_registers().await?;
            Ok::<_, StoreError>((devices, registers, local))
        }
        .await;
        let (devices, registers, local) = match known {
            Ok(known) => known,
            Err(e) => return report.failed(e),
        };

        let (resolvable, unresolvable): (Vec<_>, Vec<_>) = remote
            .into_iter()
            .partition(|row| {
                devices.contains(&row.device_id) && registers.contains(&row.register_id)
            });
        for row in &unresolvable {
            tracing::debug!(
                device_register_id = row.device_register_id,
                device_id = row.device_id,
                register_id = row.register_id,
                "device register references unknown device or register, skipped"
            );
        }
        report.skipped = unresolvable.len();

        let diff = diff_by_key(local, resolvable, |r: &DeviceRegister| r.device_register_id);
        let result = apply(
            diff,
            report,
            |r| async move { self.edge.upsert_device_register(&r).await },
            |id| async move { self.edge.delete_device_register(id).await },
        )
        .await;
        log_entity("device_registers", &result);
        result
    }
}

/// Apply a diff, stopping at the first store error.
async fn apply<K, T, U, UF, D, DF>(
    diff: Diff<K, T>,
    mut report: EntityReport,
    upsert: U,
    delete: D,
) -> EntityReport
where
    U: Fn(T) -> UF,
    UF: std::future::Future<Output = Result<(), StoreError>>,
    D: Fn(K) -> DF,
    DF: std::future::Future<Output = Result<(), StoreError>>,
{
    for row in diff.insert {
        if let Err(e) = upsert(row).await {
            return report.failed(e);
        }
        report.inserted += 1;
    }
    for row in diff.update {
        if let Err(e) = upsert(row).await {
            return report.failed(e);
        }
        report.updated += 1;
    }
    for key in diff.delete {
        if let Err(e) = delete(key).await {
            return report.failed(e);
        }
        report.deleted += 1;
    }
    report.success = true;
    report
}

fn log_entity(entity: &'static str, report: &EntityReport) {
    if let Some(error) = &report.error {
        tracing::warn!(
            entity,
            error = %error,
            inserted = report.inserted,
            updated = report.updated,
            "entity reconciliation failed"
        );
    } else {
        tracing::debug!(
            entity,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped,
            "entity reconciled"
        );
    }
}
