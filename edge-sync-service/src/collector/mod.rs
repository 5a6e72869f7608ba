//! One polling pass across every active cached meter.

pub mod performance;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{stream, StreamExt};
use meter_client::domain::{Meter, NewReading};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    batcher::{BatchFailure, ReadingBatcher},
    cache::{CacheError, ConfigCaches, RegisterBinding},
    error::{Operation, ProtocolError, ProtocolErrorKind},
    governor::RetryGovernor,
    pool::{ConnectionPool, PoolError, PooledClient},
    protocol::{ClientFactory, Endpoint, ProtocolClient, ProtocolKind, ReadTarget},
};

pub use performance::{PerformanceTracker, ReadPerformance};

#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error("configuration caches unusable: {0}")]
    CacheInvalid(#[from] CacheError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MeterOutcome {
    Succeeded { meter: String, readings: usize },
    Skipped { meter: String, reason: String },
    Failed { meter: String, device_id: i64, error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleResult {
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub duration_ms: u64,
    pub meters_succeeded: usize,
    pub meters_skipped: usize,
    pub meters_failed: usize,
    pub readings_built: usize,
    pub readings_persisted: u64,
    pub readings_rejected: usize,
    pub failed_batches: Vec<BatchFailure>,
    pub read_success_rate: Option<f64>,
    pub avg_read_latency_ms: Option<f64>,
    pub outcomes: Vec<MeterOutcome>,
}

/// Lazily checks a client out of the pool for one device and gives it back
/// (or discards it) when the session ends.
struct DeviceSession<'p, F: ClientFactory> {
    pool: &'p ConnectionPool<F>,
    endpoint: Endpoint,
    client: Option<PooledClient<F::Client>>,
}

impl<'p, F: ClientFactory> DeviceSession<'p, F> {
    fn new(pool: &'p ConnectionPool<F>, endpoint: Endpoint) -> Self {
        Self {
            pool,
            endpoint,
            client: None,
        }
    }

    async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
        let device_id = self.endpoint.device_id;
        if self.client.is_none() {
            let acquired = self.pool.acquire(&self.endpoint).await.map_err(|e| match e {
                PoolError::Connect(e) => e,
                other => ProtocolError::new(
                    device_id,
                    Operation::Acquire,
                    ProtocolErrorKind::Pool(other.to_string()),
                ),
            })?;
            self.client = Some(acquired);
        }
        let Some(client) = self.client.as_mut() else {
            return Err(ProtocolError::not_connected(device_id));
        };

        let result = client.read(targets).await;
        if result.is_err() && !client.is_healthy() {
            if let Some(mut broken) = self.client.take() {
                broken.mark_broken();
            }
        }
        result
    }
}

pub struct CollectionManager<F: ClientFactory> {
    pool: Arc<ConnectionPool<F>>,
    governor: Arc<RetryGovernor>,
    caches: Arc<ConfigCaches>,
    batcher: Arc<ReadingBatcher>,
    protocol: ProtocolKind,
    parallelism: usize,
    performance: Mutex<PerformanceTracker>,
}

impl<F: ClientFactory> CollectionManager<F> {
    pub fn new(
        pool: Arc<ConnectionPool<F>>,
        governor: Arc<RetryGovernor>,
        caches: Arc<ConfigCaches>,
        batcher: Arc<ReadingBatcher>,
        protocol: ProtocolKind,
        performance: PerformanceTracker,
    ) -> Self {
        let parallelism = pool.config().max_connections.max(1);
        Self {
            pool,
            governor,
            caches,
            batcher,
            protocol,
            parallelism,
            performance: Mutex::new(performance),
        }
    }

    pub fn read_performance(&self) -> ReadPerformance {
        self.performance.lock().lifetime()
    }

    /// Poll every active meter once and persist what was read.
    pub async fn run_cycle(&self) -> Result<CycleResult, CycleError> {
        let work = self.snapshot_work()?;
        let started = Instant::now();
        let started_at = OffsetDateTime::now_utc();
        tracing::debug!(
            meters = work.len(),
            parallelism = self.parallelism,
            "collection cycle starting"
        );

        let polled: Vec<(MeterOutcome, Vec<NewReading>)> = stream::iter(work)
            .map(|(meter, bindings)| async move { self.poll_meter(&meter, &bindings).await })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut result = CycleResult {
            started_at: Some(started_at),
            ..CycleResult::default()
        };
        let mut readings = Vec::new();
        for (outcome, built) in polled {
            match &outcome {
                MeterOutcome::Succeeded { .. } => result.meters_succeeded += 1,
                MeterOutcome::Skipped { .. } => result.meters_skipped += 1,
                MeterOutcome::Failed { .. } => result.meters_failed += 1,
            }
            result.outcomes.push(outcome);
            readings.extend(built);
        }
        result.readings_built = readings.len();

        if !readings.is_empty() {
            let report = self.batcher.persist(readings).await;
            result.readings_persisted = report.persisted;
            result.readings_rejected = report.rejected;
            result.failed_batches = report.failed_batches;
        }

        let perf = self.performance.lock().drain();
        result.read_success_rate = perf.success_rate();
        result.avg_read_latency_ms = perf.avg_latency_ms();

        let elapsed = started.elapsed();
        result.duration_ms = elapsed.as_millis() as u64;
        record_cycle_metrics(&result, elapsed);

        tracing::info!(
            succeeded = result.meters_succeeded,
            skipped = result.meters_skipped,
            failed = result.meters_failed,
            built = result.readings_built,
            persisted = result.readings_persisted,
            rejected = result.readings_rejected,
            duration_ms = result.duration_ms,
            "collection cycle finished"
        );
        Ok(result)
    }

    /// Active meters paired with their bindings, copied out of the current cache snapshot.
    fn snapshot_work(&self) -> Result<Vec<(Meter, Vec<RegisterBinding>)>, CycleError> {
        let view = self.caches.view()?;
        let registers = &view.device_registers.data;
        Ok(view
            .meters
            .data
            .active()
            .map(|meter| (meter.clone(), registers.for_device(meter.device_id).to_vec()))
            .collect())
    }

    async fn poll_meter(
        &self,
        meter: &Meter,
        bindings: &[RegisterBinding],
    ) -> (MeterOutcome, Vec<NewReading>) {
        let label = meter.key().to_string();
        let skipped = |reason: &str| {
            tracing::info!(meter = %label, device_id = meter.device_id, reason, "meter skipped");
            (
                MeterOutcome::Skipped {
                    meter: label.clone(),
                    reason: reason.to_string(),
                },
                Vec::new(),
            )
        };

        if bindings.is_empty() {
            return skipped("no device registers");
        }
        let Some((host, port)) = meter.endpoint() else {
            return skipped("no endpoint");
        };

        let mut targets = Vec::with_capacity(bindings.len());
        let mut mapped = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.protocol.target_for(binding.address) {
                Some(target) => {
                    targets.push(target);
                    mapped.push(binding);
                }
                None => tracing::warn!(
                    meter = %label,
                    register_id = binding.register_id,
                    address = binding.address,
                    "register address not addressable by protocol"
                ),
            }
        }
        if targets.is_empty() {
            return skipped("no addressable registers");
        }

        let endpoint = Endpoint::new(host, port, meter.device_id);
        let mut session = DeviceSession::new(&self.pool, endpoint);
        let read = self
            .governor
            .execute(meter.device_id, &mut session, targets.as_slice(), |s, t| Box::pin(s.read(t)))
            .await;
        drop(session);

        match read {
            Ok(values) => {
                let created_at = OffsetDateTime::now_utc();
                let readings: Vec<NewReading> = mapped
                    .iter()
                    .zip(values)
                    .map(|(binding, raw)| NewReading {
                        meter_id: meter.meter_id,
                        meter_element_id: meter.meter_element_id,
                        field_name: binding.field_name.clone(),
                        value: raw * binding.scale,
                        created_at,
                    })
                    .collect();
                (
                    MeterOutcome::Succeeded {
                        meter: label,
                        readings: readings.len(),
                    },
                    readings,
                )
            }
            Err(e) => {
                tracing::warn!(meter = %label, device_id = meter.device_id, error = %e, "meter poll failed");
                (
                    MeterOutcome::Failed {
                        meter: label,
                        device_id: meter.device_id,
                        error: e.to_string(),
                    },
                    Vec::new(),
                )
            }
        }
    }
}

fn record_cycle_metrics(result: &CycleResult, elapsed: Duration) {
    metrics::histogram!("collection_cycle_duration_seconds").record(elapsed.as_secs_f64());
    for (outcome, count) in [
        ("succeeded", result.meters_succeeded),
        ("skipped", result.meters_skipped),
        ("failed", result.meters_failed),
    ] {
        metrics::counter!("collection_meters_total", "outcome" => outcome).increment(count as u64);
    }
    metrics::counter!("collection_readings_built_total").increment(result.readings_built as u64);
}
