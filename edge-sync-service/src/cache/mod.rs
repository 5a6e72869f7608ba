//! In-memory configuration caches.
//!
//! Each cache owns a versioned snapshot that is rebuilt wholesale from the
//! edge store. A rebuild is loaded completely before it is published, so
//! readers never observe a half-built generation. A failed load empties the
//! cache and marks it invalid until the next successful load.

pub mod snapshot;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use meter_client::domain::{DeviceRegister, Meter, MeterKey, Register, Tenant};

use crate::store::{Store, StoreError};

pub use snapshot::{Snapshot, SnapshotCache};

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("{0} cache is not initialized or its last load failed")]
    Invalid(&'static str),
    #[error("loading {cache} cache: {source}")]
    Load {
        cache: &'static str,
        #[source]
        source: StoreError,
    },
}

fn publish<T>(cache: &SnapshotCache<T>, loaded: Result<T, StoreError>) -> Result<u64, CacheError> {
    match loaded {
        Ok(data) => {
            let snapshot = cache.install(data);
            tracing::debug!(
                cache = cache.name(),
                version = snapshot.version,
                "cache snapshot installed"
            );
            Ok(snapshot.version)
        }
        Err(source) => {
            cache.clear();
            tracing::error!(
                cache = cache.name(),
                error = %source,
                "cache load failed, cache invalidated"
            );
            Err(CacheError::Load {
                cache: cache.name(),
                source,
            })
        }
    }
}

pub struct TenantCache {
    inner: SnapshotCache<Option<Tenant>>,
}

impl Default for TenantCache {
    fn default() -> Self {
        Self {
            inner: SnapshotCache::new("tenant"),
        }
    }
}

impl TenantCache {
    pub async fn initialize(&self, store: &dyn Store) -> Result<u64, CacheError> {
        publish(&self.inner, store.load_tenant().await)
    }

    pub async fn reload(&self, store: &dyn Store) -> Result<u64, CacheError> {
        self.initialize(store).await
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// The active tenant. `Ok(None)` means the store holds no tenant yet.
    pub fn tenant(&self) -> Result<Option<Tenant>, CacheError> {
        let snapshot = self.inner.load().ok_or(CacheError::Invalid(self.inner.name()))?;
        Ok(snapshot.data.clone())
    }
}

/// Active and inactive meters keyed by identity.
#[derive(Debug, Default)]
pub struct MeterSet {
    by_key: BTreeMap<MeterKey, Meter>,
    excluded: usize,
}

impl MeterSet {
    /// Active meters without a usable endpoint or device id are left out.
    pub fn build(meters: Vec<Meter>) -> Self {
        let mut set = Self::default();
        for meter in meters {
            if meter.active && (meter.endpoint().is_none() || meter.device_id <= 0) {
                tracing::warn!(
                    meter = %meter.key(),
                    ip = ?meter.ip,
                    port = ?meter.port,
                    device_id = meter.device_id,
                    "active meter has no usable address, excluded from cache"
                );
                set.excluded += 1;
                continue;
            }
            set.by_key.insert(meter.key(), meter);
        }
        set
    }

    pub fn get(&self, key: MeterKey) -> Option<&Meter> {
        self.by_key.get(&key)
    }

    pub fn active(&self) -> impl Iterator<Item = &Meter> {
        self.by_key.values().filter(|m| m.active)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn excluded(&self) -> usize {
        self.excluded
    }
}

pub struct MeterCache {
    inner: SnapshotCache<MeterSet>,
}

impl Default for MeterCache {
    fn default() -> Self {
        Self {
            inner: SnapshotCache::new("meter"),
        }
    }
}

impl MeterCache {
    pub async fn initialize(&self, store: &dyn Store) -> Result<u64, CacheError> {
        publish(&self.inner, store.load_meters().await.map(MeterSet::build))
    }

    pub async fn reload(&self, store: &dyn Store) -> Result<u64, CacheError> {
        self.initialize(store).await
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn snapshot(&self) -> Result<Arc<Snapshot<MeterSet>>, CacheError> {
        self.inner.load().ok_or(CacheError::Invalid(self.inner.name()))
    }

    /// Look up a meter by its `meter_id:meter_element_id` key.
    pub fn lookup(&self, key: &str) -> Result<Option<Meter>, CacheError> {
        let snapshot = self.snapshot()?;
        let Some(key) = parse_meter_key(key) else {
            return Ok(None);
        };
        Ok(snapshot.data.get(key).cloned())
    }
}

fn parse_meter_key(key: &str) -> Option<MeterKey> {
    let (meter, element) = key.split_once(':')?;
    Some(MeterKey::new(meter.trim().parse().ok()?, element.trim().parse().ok()?))
}

/// One register a device exposes, joined with its definition.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBinding {
    pub register_id: i64,
    pub address: i32,
    pub name: String,
    pub field_name: String,
    pub unit: Option<String>,
    pub scale: f64,
}

#[derive(Debug, Default)]
pub struct DeviceRegisterSet {
    by_device: HashMap<i64, Vec<RegisterBinding>>,
    dangling: usize,
}

impl DeviceRegisterSet {
    pub fn build(rows: Vec<DeviceRegister>, registers: Vec<Register>) -> Self {
        let registers: HashMap<i64, Register> =
            registers.into_iter().map(|r| (r.register_id, r)).collect();
        let mut set = Self::default();
        for row in rows {
            let Some(register) = registers.get(&row.register_id) else {
                tracing::warn!(
                    device_register_id = row.device_register_id,
                    register_id = row.register_id,
                    "device register references unknown register"
                );
                set.dangling += 1;
                continue;
            };
            set.by_device.entry(row.device_id).or_default().push(RegisterBinding {
                register_id: register.register_id,
                address: register.register,
                name: register.name.clone(),
                field_name: register.field_name.clone(),
                unit: register.unit.clone(),
                scale: register.scale,
            });
        }
        for bindings in set.by_device.values_mut() {
            bindings.sort_by_key(|b| (b.address, b.register_id));
        }
        set
    }

    /// Bindings for a device ordered by address; empty when the device is unknown.
    pub fn for_device(&self, device_id: i64) -> &[RegisterBinding] {
        self.by_device.get(&device_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dangling(&self) -> usize {
        self.dangling
    }
}

pub struct DeviceRegisterCache {
    inner: SnapshotCache<DeviceRegisterSet>,
}

impl Default for DeviceRegisterCache {
    fn default() -> Self {
        Self {
            inner: SnapshotCache::new("device_register"),
        }
    }
}

impl DeviceRegisterCache {
    pub async fn initialize(&self, store: &dyn Store) -> Result<u64, CacheError> {
        let loaded = async {
            let rows = store.load_device_registers().await?;
            let registers = store.load_registers().await?;
            Ok::<_, StoreError>(DeviceRegisterSet::build(rows, registers))
        }
        .await;
        publish(&self.inner, loaded)
    }

    pub async fn reload(&self, store: &dyn Store) -> Result<u64, CacheError> {
        self.initialize(store).await
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn snapshot(&self) -> Result<Arc<Snapshot<DeviceRegisterSet>>, CacheError> {
        self.inner.load().ok_or(CacheError::Invalid(self.inner.name()))
    }

    pub fn for_device(&self, device_id: i64) -> Result<Vec<RegisterBinding>, CacheError> {
        Ok(self.snapshot()?.data.for_device(device_id).to_vec())
    }
}

/// A consistent set of snapshots for one collection cycle.
pub struct CacheView {
    pub meters: Arc<Snapshot<MeterSet>>,
    pub device_registers: Arc<Snapshot<DeviceRegisterSet>>,
}

#[derive(Default)]
pub struct ConfigCaches {
    pub tenant: Arc<TenantCache>,
    pub meters: MeterCache,
    pub device_registers: DeviceRegisterCache,
}

impl ConfigCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every cache. All caches are attempted; the first error is returned.
    pub async fn initialize(&self, store: &dyn Store) -> Result<(), CacheError> {
        let tenant = self.tenant.initialize(store).await;
        let meters = self.meters.initialize(store).await;
        let device_registers = self.device_registers.initialize(store).await;

        let (tenant, meters, device_registers) = (tenant?, meters?, device_registers?);
        tracing::info!(
            tenant_version = tenant,
            meter_version = meters,
            device_register_version = device_registers,
            "configuration caches loaded"
        );
        Ok(())
    }

    pub async fn reload(&self, store: &dyn Store) -> Result<(), CacheError> {
        self.initialize(store).await
    }

    pub fn clear(&self) {
        self.tenant.clear();
        self.meters.clear();
        self.device_registers.clear();
    }

    pub fn is_valid(&self) -> bool {
        self.tenant.is_valid() && self.meters.is_valid() && self.device_registers.is_valid()
    }

    pub fn view(&self) -> Result<CacheView, CacheError> {
        if !self.tenant.is_valid() {
            return Err(CacheError::Invalid("tenant"));
        }
        Ok(CacheView {
            meters: self.meters.snapshot()?,
            device_registers: self.device_registers.snapshot()?,
        })
    }
}
