//! Field-bus protocol clients.
//!
//! Both protocol families read through [`ProtocolClient::read`], which takes a
//! list of [`ReadTarget`]s and returns one raw value per target in the same
//! order. Connection state changes and read completions are published on a
//! broadcast channel so the collection cycle can aggregate success rate and
//! latency without being wired into the clients.

pub mod bacnet;
pub mod modbus;

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ProtocolError;

pub use bacnet::BacnetIpClient;
pub use modbus::ModbusTcpClient;

/// Network address of one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Protocol-level device identifier (Modbus unit id or BACnet device instance).
    pub device_id: i64,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, device_id: i64) -> Self {
        Self {
            host: host.into(),
            port,
            device_id,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One addressable value on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    /// Modbus holding register (function 0x03).
    HoldingRegister(u16),
    /// BACnet object property.
    ObjectProperty {
        object_type: u16,
        instance: u32,
        property: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[default]
    Modbus,
    Bacnet,
}

impl ProtocolKind {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Modbus => 502,
            Self::Bacnet => 47808,
        }
    }

    /// Map a configured register address onto this protocol's addressing.
    ///
    /// For BACnet the address is the instance of an analog-input object whose
    /// present-value is read.
    pub fn target_for(self, address: i32) -> Option<ReadTarget> {
        match self {
            Self::Modbus => u16::try_from(address).ok().map(ReadTarget::HoldingRegister),
            Self::Bacnet => u32::try_from(address)
                .ok()
                .filter(|instance| *instance <= bacnet::MAX_INSTANCE)
                .map(|instance| ReadTarget::ObjectProperty {
                    object_type: bacnet::OBJECT_ANALOG_INPUT,
                    instance,
                    property: bacnet::PROPERTY_PRESENT_VALUE,
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged {
        device_id: i64,
        state: ConnectionState,
    },
    ReadCompleted {
        device_id: i64,
        points: usize,
        latency: Duration,
        success: bool,
    },
}

/// Sending half of the client event channel.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[async_trait::async_trait]
pub trait ProtocolClient: Send {
    fn endpoint(&self) -> &Endpoint;

    fn state(&self) -> ConnectionState;

    /// Open the transport. Calling this while connected returns the current state.
    async fn connect(&mut self) -> Result<ConnectionState, ProtocolError>;

    /// Release the transport. The transport is gone when this returns, even on error.
    async fn disconnect(&mut self) -> Result<(), ProtocolError>;

    async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError>;

    fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Creates unconnected clients for the connection pool.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: ProtocolClient + 'static;

    fn create(&self, endpoint: &Endpoint) -> Self::Client;
}

/// A client for whichever protocol the deployment is configured for.
pub enum DeviceClient {
    Modbus(ModbusTcpClient),
    Bacnet(BacnetIpClient),
}

#[async_trait::async_trait]
impl ProtocolClient for DeviceClient {
    fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Modbus(c) => c.endpoint(),
            Self::Bacnet(c) => c.endpoint(),
        }
    }

    fn state(&self) -> ConnectionState {
        match self {
            Self::Modbus(c) => c.state(),
            Self::Bacnet(c) => c.state(),
        }
    }

    async fn connect(&mut self) -> Result<ConnectionState, ProtocolError> {
        match self {
            Self::Modbus(c) => c.connect().await,
            Self::Bacnet(c) => c.connect().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        match self {
            Self::Modbus(c) => c.disconnect().await,
            Self::Bacnet(c) => c.disconnect().await,
        }
    }

    async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
        match self {
            Self::Modbus(c) => c.read(targets).await,
            Self::Bacnet(c) => c.read(targets).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceClientFactory {
    pub kind: ProtocolKind,
    pub timeout: Duration,
    /// Unit id used when a device id does not fit Modbus unit addressing.
    pub default_unit_id: u8,
    pub events: EventPublisher,
}

impl ClientFactory for DeviceClientFactory {
    type Client = DeviceClient;

    fn create(&self, endpoint: &Endpoint) -> DeviceClient {
        match self.kind {
            ProtocolKind::Modbus => DeviceClient::Modbus(ModbusTcpClient::new(
                endpoint.clone(),
                self.default_unit_id,
                self.timeout,
                self.events.clone(),
            )),
            ProtocolKind::Bacnet => DeviceClient::Bacnet(BacnetIpClient::new(
                endpoint.clone(),
                self.timeout,
                self.events.clone(),
            )),
        }
    }
}
