//! BACnet/IP ReadProperty client.
//!
//! Only the confirmed ReadProperty service is spoken. Each target is one
//! request; responses are matched by invoke id and anything else arriving on
//! the socket is ignored until the read timeout.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::net::UdpSocket;

use super::{ClientEvent, ConnectionState, Endpoint, EventPublisher, ProtocolClient, ReadTarget};
use crate::error::{Operation, ProtocolError, ProtocolErrorKind};

pub const OBJECT_ANALOG_INPUT: u16 = 0;
pub const PROPERTY_PRESENT_VALUE: u32 = 85;
/// Highest assignable object instance (0x3FFFFF is the wildcard).
pub const MAX_INSTANCE: u32 = 0x3F_FFFE;

const BVLC_TYPE: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;
const SERVICE_READ_PROPERTY: u8 = 0x0C;
const MAX_FRAME: usize = 1500;

pub fn encode_read_property(
    invoke_id: u8,
    object_type: u16,
    instance: u32,
    property: u32,
) -> Vec<u8> {
    let mut apdu = vec![
        0x00, // confirmed request, unsegmented
        0x05, // max APDU 1476
        invoke_id,
        SERVICE_READ_PROPERTY,
    ];

    let object_id = (u32::from(object_type) << 22) | (instance & 0x3F_FFFF);
    apdu.push(0x0C); // context 0, length 4
    apdu.extend_from_slice(&object_id.to_be_bytes());

    if property <= 0xFF {
        apdu.extend_from_slice(&[0x19, property as u8]);
    } else if property <= 0xFFFF {
        apdu.push(0x1A);
        apdu.extend_from_slice(&(property as u16).to_be_bytes());
    } else {
        apdu.push(0x1C);
        apdu.extend_from_slice(&property.to_be_bytes());
    }

    let npdu = [0x01, 0x04]; // version 1, expecting reply
    let total = (4 + npdu.len() + apdu.len()) as u16;

    let mut frame = Vec::with_capacity(total as usize);
    frame.extend_from_slice(&[BVLC_TYPE, BVLC_ORIGINAL_UNICAST]);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&npdu);
    frame.extend_from_slice(&apdu);
    frame
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseError {
    /// A valid frame for a different request.
    OtherInvoke(u8),
    Malformed(String),
    /// Error, Reject or Abort PDU from the device.
    Device(String),
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

struct TagHeader {
    number: u8,
    context: bool,
    /// Length for data tags, 6/7 for opening/closing context tags.
    lvt: u32,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn u8(&mut self) -> Result<u8, ResponseError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| ResponseError::Malformed(format!("truncated at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ResponseError> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| {
                ResponseError::Malformed(format!("truncated reading {n} bytes at {}", self.pos))
            })?;
        self.pos = end;
        Ok(slice)
    }

    fn tag(&mut self) -> Result<TagHeader, ResponseError> {
        let b = self.u8()?;
        let mut number = b >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }
        let context = b & 0x08 != 0;
        let mut lvt = u32::from(b & 0x07);

        let is_open_close = context && (lvt == 6 || lvt == 7);
        let is_boolean = !context && number == 1;
        if lvt == 5 && !is_open_close && !is_boolean {
            lvt = match self.u8()? {
                254 => u32::from(u16::from_be_bytes([self.u8()?, self.u8()?])),
                255 => u32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]),
                n => u32::from(n),
            };
        }

        Ok(TagHeader { number, context, lvt })
    }
}

fn be_unsigned(bytes: &[u8]) -> Result<u64, ResponseError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(ResponseError::Malformed(format!("invalid integer length {}", bytes.len())));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn be_signed(bytes: &[u8]) -> Result<i64, ResponseError> {
    let raw = be_unsigned(bytes)?;
    let shift = 64 - 8 * bytes.len() as u32;
    Ok(((raw << shift) as i64) >> shift)
}

fn decode_application_value(cursor: &mut Cursor<'_>) -> Result<f64, ResponseError> {
    let tag = cursor.tag()?;
    if tag.context {
        return Err(ResponseError::Malformed(format!(
            "expected application tag, got context tag {}",
            tag.number
        )));
    }

    match tag.number {
        1 => Ok(if tag.lvt == 0 { 0.0 } else { 1.0 }),
        2 | 9 => Ok(be_unsigned(cursor.take(tag.lvt as usize)?)? as f64),
        3 => Ok(be_signed(cursor.take(tag.lvt as usize)?)? as f64),
        4 if tag.lvt == 4 => {
            let b = cursor.take(4)?;
            Ok(f64::from(f32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        }
        5 if tag.lvt == 8 => {
            let b = cursor.take(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(f64::from_be_bytes(raw))
        }
        n => Err(ResponseError::Malformed(format!(
            "unsupported application tag {n} (length {})",
            tag.lvt
        ))),
    }
}

/// Decode a ReadProperty ComplexACK into the property's numeric value.
pub fn decode_read_property_ack(invoke_id: u8, frame: &[u8]) -> Result<f64, ResponseError> {
    if frame.len() < 4 || frame[0] != BVLC_TYPE {
        return Err(ResponseError::Malformed("not a BACnet/IP frame".to_string()));
    }
    if frame[1] != BVLC_ORIGINAL_UNICAST && frame[1] != BVLC_ORIGINAL_BROADCAST {
        return Err(ResponseError::Malformed(format!("unexpected BVLC function {:#04x}", frame[1])));
    }
    let length = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if length != frame.len() {
        return Err(ResponseError::Malformed(format!(
            "BVLC length {length} does not match frame of {} bytes",
            frame.len()
        )));
    }

    let mut c = Cursor::new(frame, 4);
    if c.u8()? != 0x01 {
        return Err(ResponseError::Malformed("unsupported NPDU version".to_string()));
    }
    let control = c.u8()?;
    if control & 0x80 != 0 {
        return Err(ResponseError::Malformed("network layer message".to_string()));
    }
    if control & 0x20 != 0 {
        c.take(2)?;
        let dlen = c.u8()? as usize;
        c.take(dlen)?;
    }
    if control & 0x08 != 0 {
        c.take(2)?;
        let slen = c.u8()? as usize;
        c.take(slen)?;
    }
    if control & 0x20 != 0 {
        c.u8()?; // hop count
    }

    let pdu = c.u8()?;
    match pdu >> 4 {
        0x3 => {
            if pdu & 0x08 != 0 {
                return Err(ResponseError::Malformed("segmented response".to_string()));
            }
            let invoke = c.u8()?;
            if invoke != invoke_id {
                return Err(ResponseError::OtherInvoke(invoke));
            }
            let service = c.u8()?;
            if service != SERVICE_READ_PROPERTY {
                return Err(ResponseError::Malformed(format!("unexpected service {service}")));
            }
        }
        0x5 => {
            let invoke = c.u8()?;
            if invoke != invoke_id {
                return Err(ResponseError::OtherInvoke(invoke));
            }
            c.u8()?; // service
            let class = c.tag().and_then(|t| c.take(t.lvt as usize).and_then(be_unsigned))?;
            let code = c.tag().and_then(|t| c.take(t.lvt as usize).and_then(be_unsigned))?;
            return Err(ResponseError::Device(format!("error class {class} code {code}")));
        }
        0x6 | 0x7 => {
            let invoke = c.u8()?;
            if invoke != invoke_id {
                return Err(ResponseError::OtherInvoke(invoke));
            }
            let reason = c.u8()?;
            let kind = if pdu >> 4 == 0x6 { "reject" } else { "abort" };
            return Err(ResponseError::Device(format!("{kind} reason {reason}")));
        }
        other => {
            return Err(ResponseError::Malformed(format!("unexpected PDU type {other}")));
        }
    }

    // Skip object id, property id and optional array index up to the value.
    loop {
        let tag = c.tag()?;
        if !tag.context {
            return Err(ResponseError::Malformed(
                "application tag before property value".to_string(),
            ));
        }
        if tag.lvt == 6 {
            if tag.number != 3 {
                return Err(ResponseError::Malformed(format!(
                    "unexpected opening tag {}",
                    tag.number
                )));
            }
            break;
        }
        c.take(tag.lvt as usize)?;
    }

    let value = decode_application_value(&mut c)?;

    let closing = c.tag()?;
    if !(closing.context && closing.number == 3 && closing.lvt == 7) {
        return Err(ResponseError::Malformed("missing closing tag for property value".to_string()));
    }

    Ok(value)
}

pub struct BacnetIpClient {
    endpoint: Endpoint,
    timeout: Duration,
    socket: Option<UdpSocket>,
    invoke_id: u8,
    state: ConnectionState,
    events: EventPublisher,
}

impl BacnetIpClient {
    pub fn new(endpoint: Endpoint, timeout: Duration, events: EventPublisher) -> Self {
        Self {
            endpoint,
            timeout,
            socket: None,
            invoke_id: 0,
            state: ConnectionState::Disconnected,
            events,
        }
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

    fn drop_transport(&mut self) {
        self.socket = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn open_socket(&self) -> std::io::Result<UdpSocket> {
        let unresolved =
            || std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "host did not resolve");
        let target = (self.endpoint.host.as_str(), self.endpoint.port);
        let remote: SocketAddr = tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(unresolved)?;
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(socket)
    }

    async fn read_one(
        &mut self,
        object_type: u16,
        instance: u32,
        property: u32,
    ) -> Result<f64, ProtocolError> {
        let device_id = self.device_id();
        self.invoke_id = self.invoke_id.wrapping_add(1);
        let invoke_id = self.invoke_id;
        let request = encode_read_property(invoke_id, object_type, instance, property);
        let timeout = self.timeout;

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ProtocolError::not_connected(device_id))?;

        let exchange = async {
            socket.send(&request).await?;
            let mut buf = [0u8; MAX_FRAME];
            loop {
                let n = socket.recv(&mut buf).await?;
                match decode_read_property_ack(invoke_id, &buf[..n]) {
                    Err(ResponseError::OtherInvoke(other)) => {
                        tracing::debug!(
                            device_id,
                            invoke_id,
                            other,
                            "ignoring unrelated BACnet response"
                        );
                    }
                    decoded => return Ok::<_, std::io::Error>((decoded, buf[..n].to_vec())),
                }
            }
        };

        let (decoded, raw) = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.drop_transport();
                return Err(ProtocolError::new(device_id, Operation::Read, e));
            }
            Err(_) => {
                return Err(ProtocolError::new(
                    device_id,
                    Operation::Read,
                    ProtocolErrorKind::Timeout(timeout),
                ))
            }
        };

        match decoded {
            Ok(value) => Ok(value),
            Err(ResponseError::Device(detail)) => Err(ProtocolError::new(
                device_id,
                Operation::Read,
                ProtocolErrorKind::Exception(format!(
                    "bacnet {detail} reading object {object_type}:{instance} property {property}"
                )),
            )),
            Err(ResponseError::Malformed(reason)) => {
                Err(ProtocolError::decode(device_id, reason, &raw))
            }
            Err(ResponseError::OtherInvoke(other)) => Err(ProtocolError::decode(
                device_id,
                format!("response for invoke id {other}"),
                &raw,
            )),
        }
    }
}

#[async_trait::async_trait]
impl ProtocolClient for BacnetIpClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<ConnectionState, ProtocolError> {
        if self.socket.is_some() {
            return Ok(self.state);
        }

        self.set_state(ConnectionState::Connecting);
        let socket = match tokio::time::timeout(self.timeout, self.open_socket()).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::new(self.device_id(), Operation::Connect, e));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::new(
                    self.device_id(),
                    Operation::Connect,
                    ProtocolErrorKind::Timeout(self.timeout),
                ));
            }
        };

        self.socket = Some(socket);
        self.set_state(ConnectionState::Connected);
        Ok(self.state)
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        // Datagram sockets have no shutdown handshake.
        self.drop_transport();
        Ok(())
    }

    async fn read(&mut self, targets: &[ReadTarget]) -> Result<Vec<f64>, ProtocolError> {
        let device_id = self.device_id();
        let started = Instant::now();

        let mut values = Vec::with_capacity(targets.len());
        let mut outcome = Ok(());
        for target in targets {
            let result = match *target {
                ReadTarget::ObjectProperty {
                    object_type,
                    instance,
                    property,
                } => self.read_one(object_type, instance, property).await,
                ReadTarget::HoldingRegister(_) => Err(ProtocolError::new(
                    device_id,
                    Operation::Read,
                    ProtocolErrorKind::Unsupported(format!("{target:?}")),
                )),
            };
            match result {
                Ok(v) => values.push(v),
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
        outcome.map(|()| values)
    }
}
