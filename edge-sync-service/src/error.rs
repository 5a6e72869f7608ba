use std::{fmt, time::Duration};

use serde::Serialize;

/// Closed failure taxonomy used by the retry governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    ConnectionRefused,
    ProtocolDecode,
    DeviceUnreachable,
    Unknown,
}

impl ErrorCategory {
    /// Transport failures are retried; malformed responses and unknowns are not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionRefused | Self::DeviceUnreachable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ProtocolDecode => "protocol_decode",
            Self::DeviceUnreachable => "device_unreachable",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Read,
    Disconnect,
    Acquire,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Disconnect => "disconnect",
            Self::Acquire => "acquire",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolErrorKind {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response: {reason} (raw: {raw})")]
    Decode { reason: String, raw: String },
    #[error("device exception: {0}")]
    Exception(String),
    #[error("not connected")]
    NotConnected,
    #[error("unsupported read target: {0}")]
    Unsupported(String),
    #[error("connection pool: {0}")]
    Pool(String),
}

/// A protocol failure with the context needed to categorize and report it.
#[derive(thiserror::Error, Debug)]
#[error("device {device_id}: {operation} failed: {kind}")]
pub struct ProtocolError {
    pub device_id: i64,
    pub operation: Operation,
    #[source]
    pub kind: ProtocolErrorKind,
}

impl ProtocolError {
    pub fn new(device_id: i64, operation: Operation, kind: impl Into<ProtocolErrorKind>) -> Self {
        Self {
            device_id,
            operation,
            kind: kind.into(),
        }
    }

    pub fn not_connected(device_id: i64) -> Self {
        Self::new(device_id, Operation::Read, ProtocolErrorKind::NotConnected)
    }

    pub fn decode(device_id: i64, reason: impl Into<String>, raw: &[u8]) -> Self {
        Self::new(
            device_id,
            Operation::Read,
            ProtocolErrorKind::Decode {
                reason: reason.into(),
                raw: hex::encode(raw),
            },
        )
    }

    pub fn category(&self) -> ErrorCategory {
        use std::io::ErrorKind as Io;

        match &self.kind {
            ProtocolErrorKind::Timeout(_) => ErrorCategory::Timeout,
            ProtocolErrorKind::Io(e) => match e.kind() {
                Io::TimedOut | Io::WouldBlock => ErrorCategory::Timeout,
                Io::ConnectionRefused => ErrorCategory::ConnectionRefused,
                Io::ConnectionReset
                | Io::ConnectionAborted
                | Io::NotConnected
                | Io::BrokenPipe
                | Io::AddrNotAvailable
                | Io::UnexpectedEof => ErrorCategory::DeviceUnreachable,
                _ => ErrorCategory::Unknown,
            },
            ProtocolErrorKind::Decode { .. } | ProtocolErrorKind::Exception(_) => {
                ErrorCategory::ProtocolDecode
            }
            ProtocolErrorKind::NotConnected => ErrorCategory::DeviceUnreachable,
            ProtocolErrorKind::Unsupported(_) | ProtocolErrorKind::Pool(_) => {
                ErrorCategory::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error(kind: std::io::ErrorKind) -> ProtocolError {
        ProtocolError::new(7, Operation::Connect, std::io::Error::from(kind))
    }

    #[test]
    fn io_errors_map_onto_transport_categories() {
        assert_eq!(
            io_error(std::io::ErrorKind::ConnectionRefused).category(),
            ErrorCategory::ConnectionRefused
        );
        assert_eq!(
            io_error(std::io::ErrorKind::ConnectionReset).category(),
            ErrorCategory::DeviceUnreachable
        );
        assert_eq!(
            io_error(std::io::ErrorKind::TimedOut).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            io_error(std::io::ErrorKind::PermissionDenied).category(),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn decode_errors_are_not_retryable_and_keep_raw_payload() {
        let err = ProtocolError::decode(3, "short frame", &[0x00, 0x01, 0xff]);
        assert_eq!(err.category(), ErrorCategory::ProtocolDecode);
        assert!(!err.category().is_retryable());
        assert!(err.to_string().contains("0001ff"));
        assert!(err.to_string().contains("device 3"));
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = ProtocolError::new(
            1,
            Operation::Read,
            ProtocolErrorKind::Timeout(Duration::from_secs(1)),
        );
        assert!(err.category().is_retryable());
    }
}
