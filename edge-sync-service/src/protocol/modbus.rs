//! Modbus TCP client for holding registers (function 0x03).

use std::time::{Duration, Instant};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::{ClientEvent, ConnectionState, Endpoint, EventPublisher, ProtocolClient, ReadTarget};
use crate::error::{Operation, ProtocolError, ProtocolErrorKind};

const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
const MBAP_HEADER_LEN: usize = 7;
/// Largest register count a single 0x03 request may ask for.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Build a read-holding-registers ADU.
pub fn encode_read_request(transaction_id: u16, unit_id: u8, start: u16, count: u16) -> [u8; 12] {
    let tid = transaction_id.to_be_bytes();
    let start = start.to_be_bytes();
    let count = count.to_be_bytes();
    [
        tid[0],
        tid[1],
        0x00,
        0x00, // protocol id
        0x00,
        0x06, // remaining length: unit + fc + start + count
        unit_id,
        FC_READ_HOLDING_REGISTERS,
        start[0],
        start[1],
        count[0],
        count[1],
    ]
}

/// Validate a full response ADU and return the register words.
///
/// `Err` carries a human-readable reason; exception responses are reported
/// with their exception code.
pub fn decode_read_response(
    transaction_id: u16,
    count: u16,
    frame: &[u8],
) -> Result<Vec<u16>, ResponseError> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(ResponseError::Malformed(format!("frame too short: {} bytes", frame.len())));
    }

    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    if tid != transaction_id {
        return Err(ResponseError::Malformed(format!(
            "transaction id mismatch: expected {transaction_id}, got {tid}"
        )));
    }
    let protocol = u16::from_be_bytes([frame[2], frame[3]]);
    if protocol != 0 {
        return Err(ResponseError::Malformed(format!("unexpected protocol id {protocol}")));
    }
    let length = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if length + 6 != frame.len() {
        return Err(ResponseError::Malformed(format!(
            "length field {length} does not match frame of {} bytes",
            frame.len()
        )));
    }

    let fc = frame[7];
    if fc == FC_READ_HOLDING_REGISTERS | 0x80 {
        return Err(ResponseError::Exception(frame[8]));
    }
    if fc != FC_READ_HOLDING_REGISTERS {
        return Err(ResponseError::Malformed(format!("unexpected function code {fc:#04x}")));
    }

    let byte_count = frame[8] as usize;
    let data = &frame[9..];
    if byte_count != count as usize * 2 || data.len() != byte_count {
        return Err(ResponseError::Malformed(format!(
            "byte count {byte_count} does not match {count} registers ({} data bytes)",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    Malformed(String),
    Exception(u8),
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

/// Group addresses into contiguous `(start, count)` ranges.
pub fn coalesce(addresses: &[u16]) -> Vec<(u16, u16)> {
    let mut sorted = addresses.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(u16, u16)> = Vec::new();
    for addr in sorted {
        match ranges.last_mut() {
            Some((start, count))
                if u32::from(*start) + u32::from(*count) == u32::from(addr)
                    && *count < MAX_REGISTERS_PER_REQUEST =>
            {
                *count += 1;
            }
            _ => ranges.push((addr, 1)),
        }
    }
    ranges
}

pub struct ModbusTcpClient {
    endpoint: Endpoint,
    unit_id: u8,
    timeout: Duration,
    stream: Option<TcpStream>,
    transaction_id: u16,
    state: ConnectionState,
    events: EventPublisher,
}

impl ModbusTcpClient {
    pub fn new(
        endpoint: Endpoint,
        default_unit_id: u8,
        timeout: Duration,
        events: EventPublisher,
    ) -> Self {
        // Device ids outside 1..=247 are not valid unit ids.
        let unit_id = u8::try_from(endpoint.device_id)
            .ok()
            .filter(|id| (1..=247).contains(id))
            .unwrap_or(default_unit_id);

        Self {
            endpoint,
            unit_id,
            timeout,
            stream: None,
            transaction_id: 0,
            state: ConnectionState::Disconnected,
            events,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    fn device_id(&self) -> i64 {
        self.endpoint.device_id
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.events.publish(ClientEvent::StateChanged {
                device_id: self.device_id(),
                state,
            });
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    async fn read_range(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        let device_id = self.device_id();
        let tid = self.next_transaction_id();
        let request = encode_read_request(tid, self.unit_id, start, count);
        let timeout = self.timeout;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProtocolError::not_connected(device_id))?;

        let exchange = async {
            stream.write_all(&request).await?;

            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            // length counts the unit id already read with the header
            if !(2..=254).contains(&length) {
                return Ok::<_, std::io::Error>(header.to_vec());
            }
            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + length - 1);
            frame.extend_from_slice(&header);
            frame.resize(MBAP_HEADER_LEN + length - 1, 0);
            stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;
            Ok(frame)
        };

        let frame = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.drop_transport();
                return Err(ProtocolError::new(device_id, Operation::Read, e));
            }
            Err(_) => {
                // A late response would desynchronize the stream.
                self.drop_transport();
                return Err(ProtocolError::new(
                    device_id,
                    Operation::Read,
                    ProtocolErrorKind::Timeout(timeout),
                ));
            }
        };

        match decode_read_response(tid, count, &frame) {
            Ok(words) => Ok(words),
            Err(ResponseError::Exception(code)) => Err(ProtocolError::new(
                device_id,
                Operation::Read,
                ProtocolErrorKind::Exception(format!(
                    "modbus exception {code:#04x} ({}) reading {count} register(s) at {start}",
                    exception_name(code)
                )),
            )),
            Err(ResponseError::Malformed(reason)) => {
                self.drop_transport();
                Err(ProtocolError::decode(device_id, reason, &frame))
            }
        }
    }

    fn drop_transport(&mut self) {
        self.stream = None;
        self.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait::async_trait]
impl ProtocolClient for ModbusTcpClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<ConnectionState, ProtocolError> {
        if self.stream.is_some() {
            return Ok(self.state);
        }

        let device_id = self.device_id();
        self.set_state(ConnectionState::Connecting);

        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::new(device_id, Operation::Connect, e));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::new(
                    device_id,
                    Operation::Connect,
                    ProtocolErrorKind::Timeout(self.timeout),
                ));
            }
        };
        let _ = stream.set_nodelay(true);

        self.stream = Some(stream);
        self.set_state(ConnectionState::Connected);
        tracing::debug!(endpoint = %self.endpoint, unit_id = self.unit_id, "modbus connected");
        Ok(self.state)
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let Some(mut stream) = self.stream.take() else {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };

        let result = match tokio::time::timeout(self.timeout, stream.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::new(self.device_id(), Operation::Disconnect, e)),
            Err(_) => Err(ProtocolError::new(
                self.device_id(),
                Operation::Disconnect,
                ProtocolErrorKind::Timeout(self.timeout),
            )),
        };
        drop(stream);
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
        let device_id = self.device_id();
        let started = Instant::now();

        let mut addresses = Vec::with_capacity(targets.len());
        for target in targets {
            match target {
                ReadTarget::HoldingRegister(addr) => addresses.push(*addr),
                other => {
                    return Err(ProtocolError::new(
                        device_id,
                        Operation::Read,
                        ProtocolErrorKind::Unsupported(format!("{other:?}")),
                    ))
                }
            }
        }

        let mut values = std::collections::HashMap::with_capacity(addresses.len());
        let mut outcome = Ok(());
        for (start, count) in coalesce(&addresses) {
            match self.read_range(start, count).await {
                Ok(words) => {
                    for (offset, word) in words.into_iter().enumerate() {
                        values.insert(start + offset as u16, f64::from(word));
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.events.publish(ClientEvent::ReadCompleted {
            device_id,
            points: targets.len(),
            latency: started.elapsed(),
            success: outcome.is_ok(),
        });
        outcome?;

        Ok(addresses.iter().map(|a| values[a]).collect())
    }
}
