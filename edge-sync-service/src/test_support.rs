//! Scripted devices and transports shared by unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use meter_client::domain::{DeviceRegister, Meter, Register, Tenant};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::{
    error::{Operation, ProtocolError, ProtocolErrorKind},
    protocol::{
        ClientEvent, ClientFactory, ConnectionState, Endpoint, EventPublisher, ProtocolClient,
        ReadTarget,
    },
    store::{MemoryStore, Store},
    transport::{TransportError, UploadAck, UploadBatch, UploadTransport},
};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Raw value per holding-register address.
    Values(HashMap<u16, f64>),
    Timeout,
    Refuse,
}

#[derive(Default)]
pub struct DeviceFarm {
    behaviors: Mutex<HashMap<i64, Behavior>>,
    reads: Mutex<HashMap<i64, usize>>,
    connects: AtomicUsize,
}

impl DeviceFarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, device_id: i64, behavior: Behavior) {
        self.behaviors.lock().insert(device_id, behavior);
    }

    pub fn values(&self, device_id: i64, values: &[(u16, f64)]) {
        self.set(device_id, Behavior::Values(values.iter().copied().collect()));
    }

    pub fn reads(&self, device_id: i64) -> usize {
        self.reads.lock().get(&device_id).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn behavior(&self, device_id: i64) -> Behavior {
        self.behaviors
            .lock()
            .get(&device_id)
            .cloned()
            .unwrap_or(Behavior::Refuse)
    }
}

pub struct ScriptedClient {
    endpoint: Endpoint,
    state: ConnectionState,
    farm: Arc<DeviceFarm>,
    events: EventPublisher,
}

impl ScriptedClient {
    fn scripted_read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
        let device_id = self.endpoint.device_id;
        *self.farm.reads.lock().entry(device_id).or_default() += 1;

        match self.farm.behavior(device_id) {
            Behavior::Values(values) => targets
                .iter()
                .map(|t| match t {
                    ReadTarget::HoldingRegister(addr) => values.get(addr).copied().ok_or_else(|| {
                        ProtocolError::new(
                            device_id,
                            Operation::Read,
                            ProtocolErrorKind::Exception("illegal data address".into()),
                        )
                    }),
                    other => Err(ProtocolError::new(
                        device_id,
                        Operation::Read,
                        ProtocolErrorKind::Unsupported(format!("{other:?}")),
                    )),
                })
                .collect(),
            Behavior::Timeout => {
                self.state = ConnectionState::Disconnected;
                Err(ProtocolError::new(
                    device_id,
                    Operation::Read,
                    ProtocolErrorKind::Timeout(Duration::from_millis(10)),
                ))
            }
            Behavior::Refuse => {
                self.state = ConnectionState::Disconnected;
                Err(ProtocolError::new(
                    device_id,
                    Operation::Read,
                    std::io::Error::from(std::io::ErrorKind::ConnectionReset),
                ))
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<ConnectionState, ProtocolError> {
        if self.state == ConnectionState::Connected {
            return Ok(self.state);
        }
        self.farm.connects.fetch_add(1, Ordering::SeqCst);
        if let Behavior::Refuse = self.farm.behavior(self.endpoint.device_id) {
            return Err(ProtocolError::new(
                self.endpoint.device_id,
                Operation::Connect,
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        self.state = ConnectionState::Connected;
        Ok(self.state)
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
        let result = self.scripted_read(targets);
        self.events.publish(ClientEvent::ReadCompleted {
            device_id: self.endpoint.device_id,
            points: targets.len(),
            latency: Duration::from_millis(1),
            success: result.is_ok(),
        });
        result
    }
}

#[derive(Clone)]
pub struct ScriptedFactory {
    pub farm: Arc<DeviceFarm>,
    pub events: EventPublisher,
}

impl ClientFactory for ScriptedFactory {
    type Client = ScriptedClient;

    fn create(&self, endpoint: &Endpoint) -> ScriptedClient {
        ScriptedClient {
            endpoint: endpoint.clone(),
            state: ConnectionState::Disconnected,
            farm: Arc::clone(&self.farm),
            events: self.events.clone(),
        }
    }
}

/// Upload transport that records batches and can fail or block on demand.
#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<(UploadBatch, String)>>,
    failures_remaining: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Each submit waits for a permit on `gate` before completing.
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<UploadBatch> {
        self.batches.lock().iter().map(|(b, _)| b.clone()).collect()
    }

    pub fn api_keys(&self) -> Vec<String> {
        self.batches.lock().iter().map(|(_, k)| k.clone()).collect()
    }
}

#[async_trait]
impl UploadTransport for RecordingTransport {
    async fn submit(
        &self,
        batch: &UploadBatch,
        api_key: &str,
    ) -> Result<UploadAck, TransportError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| TransportError::Rejected("gate closed".into()))?;
            permit.forget();
        }
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Status {
                status: 503,
                body: "simulated outage".into(),
            });
        }
        self.batches.lock().push((batch.clone(), api_key.to_string()));
        Ok(UploadAck {
            processed: batch.reading_count as u64,
        })
    }
}

pub fn tenant(upload_batch_size: i32) -> Tenant {
    Tenant {
        tenant_id: 1,
        api_key: "tenant-key".to_string(),
        download_batch_size: 100,
        upload_batch_size,
    }
}

pub fn meter(meter_id: i64, device_id: i64) -> Meter {
    Meter {
        meter_id,
        meter_element_id: 1,
        device_id,
        name: format!("meter {meter_id}"),
        active: true,
        ip: Some("10.0.0.1".to_string()),
        port: Some(502),
        element: Some("A".to_string()),
    }
}

pub fn register(register_id: i64, address: i32, field_name: &str, scale: f64) -> Register {
    Register {
        register_id,
        name: field_name.to_string(),
        register: address,
        unit: None,
        field_name: field_name.to_string(),
        scale,
    }
}

/// Edge store with one tenant, one meter on device 1 and the two
/// voltage/current registers at addresses 10 and 11 scaled by 0.1.
pub async fn seeded_edge_store(upload_batch_size: i32) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.upsert_tenant(&tenant(upload_batch_size)).await.unwrap();
    store.upsert_meter(1, &meter(100, 1)).await.unwrap();
    store.upsert_register(&register(1, 10, "voltage_a_n", 0.1)).await.unwrap();
    store.upsert_register(&register(2, 11, "current_line_a", 0.1)).await.unwrap();
    for (id, register_id) in [(1, 1), (2, 2)] {
        store
            .upsert_device_register(&DeviceRegister {
                device_register_id: id,
                device_id: 1,
                register_id,
            })
            .await
            .unwrap();
    }
    store
}
