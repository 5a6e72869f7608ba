//! In-process store used by tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use meter_client::domain::{
    DeviceRegister, Meter, MeterKey, NewReading, NewSyncLog, PendingReading, Register, SyncLog,
    SyncLogSummary, Tenant,
};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::Notify;

use super::{
    device_registers_for, unknown_api_key, window_start, ConfigSnapshot, ConfigSource, Store,
    StoreError,
};

#[derive(Default)]
struct State {
    tenants: BTreeMap<i64, Tenant>,
    meters: BTreeMap<MeterKey, (i64, Meter)>,
    registers: BTreeMap<i64, Register>,
    device_registers: BTreeMap<i64, DeviceRegister>,
    readings: Vec<PendingReading>,
    event_ids: HashSet<String>,
    next_reading_id: i64,
    sync_logs: Vec<SyncLog>,
    failing: HashSet<&'static str>,
    failing_times: HashMap<&'static str, u32>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    meter_gate: Mutex<Option<Arc<Notify>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to the named operation fail until [`recover`](Self::recover).
    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    /// Fail only the next `times` calls to the named operation.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.state.lock().failing_times.insert(op, times);
    }

    pub fn recover(&self, op: &'static str) {
        let mut state = self.state.lock();
        state.failing.remove(op);
        state.failing_times.remove(op);
    }

    /// Park `load_meters` calls until [`release_meter_loads`](Self::release_meter_loads).
    pub fn hold_meter_loads(&self) {
        *self.meter_gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn release_meter_loads(&self) {
        if let Some(gate) = self.meter_gate.lock().take() {
            gate.notify_waiters();
        }
    }

    pub fn readings(&self) -> Vec<PendingReading> {
        self.state.lock().readings.clone()
    }

    pub fn sync_logs(&self) -> Vec<SyncLog> {
        self.state.lock().sync_logs.clone()
    }

    fn check(&self, op: &'static str) -> Result<parking_lot::MutexGuard<'_, State>, StoreError> {
        let mut state = self.state.lock();
        if state.failing.contains(op) {
            return Err(StoreError::Unavailable(format!("{op}: injected failure")));
        }
        if let Some(left) = state.failing_times.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Unavailable(format!("{op}: injected failure")));
            }
        }
        Ok(state)
    }
}

fn select_ids<'a>(
    readings: &'a mut [PendingReading],
    ids: &[i64],
) -> impl Iterator<Item = &'a mut PendingReading> {
    let ids: HashSet<i64> = ids.iter().copied().collect();
    readings.iter_mut().filter(move |r| ids.contains(&r.id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_tenant(&self) -> Result<Option<Tenant>, StoreError> {
        Ok(self.check("load_tenant")?.tenants.values().next().cloned())
    }

    async fn load_meters(&self) -> Result<Vec<Meter>, StoreError> {
        let gate = self.meter_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.check("load_meters")?.meters.values().map(|(_, m)| m.clone()).collect())
    }

    async fn load_registers(&self) -> Result<Vec<Register>, StoreError> {
        Ok(self.check("load_registers")?.registers.values().cloned().collect())
    }

    async fn load_device_registers(&self) -> Result<Vec<DeviceRegister>, StoreError> {
        Ok(self.check("load_device_registers")?.device_registers.values().cloned().collect())
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.check("upsert_tenant")?.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: i64) -> Result<(), StoreError> {
        self.check("delete_tenant")?.tenants.remove(&tenant_id);
        Ok(())
    }

    async fn upsert_meter(&self, tenant_id: i64, meter: &Meter) -> Result<(), StoreError> {
        self.check("upsert_meter")?.meters.insert(meter.key(), (tenant_id, meter.clone()));
        Ok(())
    }

    async fn delete_meter(&self, key: MeterKey) -> Result<(), StoreError> {
        self.check("delete_meter")?.meters.remove(&key);
        Ok(())
    }

    async fn upsert_register(&self, register: &Register) -> Result<(), StoreError> {
        self.check("upsert_register")?.registers.insert(register.register_id, register.clone());
        Ok(())
    }

    async fn delete_register(&self, register_id: i64) -> Result<(), StoreError> {
        self.check("delete_register")?.registers.remove(&register_id);
        Ok(())
    }

    async fn upsert_device_register(&self, row: &DeviceRegister) -> Result<(), StoreError> {
        self.check("upsert_device_register")?
            .device_registers
            .insert(row.device_register_id, row.clone());
        Ok(())
    }

    async fn delete_device_register(&self, device_register_id: i64) -> Result<(), StoreError> {
        self.check("delete_device_register")?.device_registers.remove(&device_register_id);
        Ok(())
    }

    async fn insert_readings(&self, batch: &[NewReading]) -> Result<u64, StoreError> {
        let mut state = self.check("insert_readings")?;
        let mut inserted = 0;
        for reading in batch {
            let event_id = reading.event_id();
            if !state.event_ids.insert(event_id.clone()) {
                continue;
            }
            state.next_reading_id += 1;
            let id = state.next_reading_id;
            state.readings.push(PendingReading {
                id,
                event_id,
                meter_id: reading.meter_id,
                meter_element_id: reading.meter_element_id,
                field_name: reading.field_name.clone(),
                value: reading.value,
                created_at: reading.created_at,
                is_synchronized: false,
                retry_count: 0,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn select_unsynchronized(
        &self,
        limit: usize,
        max_retry_count: i32,
    ) -> Result<Vec<PendingReading>, StoreError> {
        let state = self.check("select_unsynchronized")?;
        let mut rows: Vec<PendingReading> = state
            .readings
            .iter()
            .filter(|r| !r.is_synchronized && r.retry_count < max_retry_count)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_synchronized(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.check("mark_synchronized")?;
        let mut n = 0;
        for r in select_ids(&mut state.readings, ids) {
            r.is_synchronized = true;
            n += 1;
        }
        Ok(n)
    }

    async fn delete_readings(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.check("delete_readings")?;
        let ids: HashSet<i64> = ids.iter().copied().collect();
        let before = state.readings.len();
        state.readings.retain(|r| !ids.contains(&r.id));
        Ok((before - state.readings.len()) as u64)
    }

    async fn increment_retry_count(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.check("increment_retry_count")?;
        let mut n = 0;
        for r in select_ids(&mut state.readings, ids) {
            r.retry_count += 1;
            n += 1;
        }
        Ok(n)
    }

    async fn delete_synchronized_before(&self, cutoff: OffsetDateTime) -> Result<u64, StoreError> {
        let mut state = self.check("delete_synchronized_before")?;
        let before = state.readings.len();
        state.readings.retain(|r| !(r.is_synchronized && r.created_at < cutoff));
        Ok((before - state.readings.len()) as u64)
    }

    async fn count_unsynchronized(&self) -> Result<u64, StoreError> {
        let state = self.check("count_unsynchronized")?;
        Ok(state.readings.iter().filter(|r| !r.is_synchronized).count() as u64)
    }

    async fn count_stuck(&self, max_retry_count: i32) -> Result<u64, StoreError> {
        let state = self.check("count_stuck")?;
        Ok(state
            .readings
            .iter()
            .filter(|r| !r.is_synchronized && r.retry_count >= max_retry_count)
            .count() as u64)
    }

    async fn append_sync_log(&self, entry: &NewSyncLog) -> Result<(), StoreError> {
        let mut state = self.check("append_sync_log")?;
        let id = state.sync_logs.len() as i64 + 1;
        state.sync_logs.push(SyncLog {
            id,
            batch_size: entry.batch_size,
            success: entry.success,
            error_message: entry.error_message.clone(),
            synced_at: entry.synced_at,
        });
        Ok(())
    }

    async fn summarize_sync_logs(&self, window_hours: u32) -> Result<SyncLogSummary, StoreError> {
        let state = self.check("summarize_sync_logs")?;
        let since = window_start(window_hours);
        let mut summary = SyncLogSummary::default();
        for log in state.sync_logs.iter().filter(|l| l.synced_at >= since) {
            summary.attempts += 1;
            if log.success {
                summary.successes += 1;
                summary.rows_synced += i64::from(log.batch_size);
                summary.last_success_at = summary.last_success_at.max(Some(log.synced_at));
            } else {
                summary.failures += 1;
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl ConfigSource for MemoryStore {
    async fn fetch_config(
        &self,
        api_key: &str,
        _page_size: usize,
    ) -> Result<ConfigSnapshot, StoreError> {
        let state = self.check("fetch_config")?;
        let tenant = state
            .tenants
            .values()
            .find(|t| t.api_key == api_key)
            .cloned()
            .ok_or_else(unknown_api_key)?;

        let meters: Vec<Meter> = state
            .meters
            .values()
            .filter(|(tenant_id, _)| *tenant_id == tenant.tenant_id)
            .map(|(_, m)| m.clone())
            .collect();
        let rows = state.device_registers.values().cloned().collect();
        let device_registers = device_registers_for(&meters, rows);

        Ok(ConfigSnapshot {
            tenant,
            meters,
            registers: state.registers.values().cloned().collect(),
            device_registers,
        })
    }
}
