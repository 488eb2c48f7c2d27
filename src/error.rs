//! Error types for instrument sessions.
//!
//! This module defines [`SessionError`], the error returned by every session
//! operation, and [`TransportError`], the narrower error produced by a
//! [`Transport`](crate::transport::Transport) when reading a line.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the transport could not be opened. The session stays
//!   usable in the disconnected state and `connect` may be retried.
//! - **`NotConnected`**: a query was attempted before `connect` (or after
//!   `disconnect`). This is a caller error.
//! - **`Timeout`**: no matching reply arrived within the command's budget, or
//!   the transport could not be acquired in time. The caller decides whether
//!   to retry.
//! - **`Io`**: the transport failed mid-operation. Treat it as connection loss
//!   and reconnect.
//! - **`DeviceError`**: the device answered with a known fault token. Queries
//!   return this as data through [`Reply::DeviceError`]; the variant only
//!   appears when a caller opts into [`Reply::into_value`].
//! - **`InvalidCommand`** / **`Config`**: malformed calls and bad settings,
//!   rejected before any byte reaches the wire.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for session results.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Primary error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Opening the transport failed.
    #[error("Failed to connect to '{address}': {message}")]
    Connection {
        /// Address that was being opened
        address: String,
        /// Underlying failure
        message: String,
    },

    /// A query was issued while the session is disconnected.
    #[error("Session is not connected")]
    NotConnected,

    /// No matching reply (or no transport access) within the budget.
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout {
        /// What the session was waiting for
        what: String,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// Transport failure mid-operation.
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device reported a known fault token.
    #[error("Device reported {token}: {description}")]
    DeviceError {
        /// Literal token emitted by the device (e.g. `er2`)
        token: String,
        /// Human-readable meaning of the token
        description: String,
    },

    /// The command cannot be encoded for this device family.
    #[error("Invalid command '{code}': {reason}")]
    InvalidCommand {
        /// Offending command code
        code: String,
        /// Why it was rejected
        reason: String,
    },

    /// Session settings are unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether this error means the transport should be considered lost.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, SessionError::Io(_))
    }
}

/// Errors produced by [`Transport::read_line`](crate::transport::Transport::read_line).
#[derive(Error, Debug)]
pub enum TransportError {
    /// No complete line arrived within the per-read budget.
    #[error("read timed out")]
    Timeout,
    /// The peer closed the stream.
    #[error("transport closed by peer")]
    Closed,
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => SessionError::Timeout {
                what: "line from transport".to_string(),
                elapsed: Duration::ZERO,
            },
            TransportError::Closed => SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "transport closed by peer",
            )),
            TransportError::Io(e) => SessionError::Io(e),
        }
    }
}

/// A fault token reported by the device, surfaced as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    /// Literal token (e.g. `er2`)
    pub token: String,
    /// Human-readable description from the codec's token table
    pub description: String,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.token, self.description)
    }
}

/// Successful outcome of a query.
///
/// A device fault is a normal result: the call chain keeps running and the
/// caller inspects the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Payload of a query, or the verbatim acknowledgement of an actuation.
    Value(String),
    /// The device answered with a known fault token.
    DeviceError(DeviceFault),
}

impl Reply {
    /// Build a device-error reply.
    pub fn device_error(token: impl Into<String>, description: impl Into<String>) -> Self {
        Reply::DeviceError(DeviceFault {
            token: token.into(),
            description: description.into(),
        })
    }

    /// Payload if the device did not report a fault.
    pub fn value(&self) -> Option<&str> {
        match self {
            Reply::Value(v) => Some(v),
            Reply::DeviceError(_) => None,
        }
    }

    /// Whether the device reported a fault.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Reply::DeviceError(_))
    }

    /// Convert a device fault into [`SessionError::DeviceError`].
    pub fn into_value(self) -> SessionResult<String> {
        match self {
            Reply::Value(v) => Ok(v),
            Reply::DeviceError(fault) => Err(SessionError::DeviceError {
                token: fault.token,
                description: fault.description,
            }),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(v) => f.write_str(v),
            Reply::DeviceError(fault) => write!(f, "{}", fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_reply_converts_to_hard_error_on_request() {
        let reply = Reply::device_error("er2", "out of bounds");
        assert!(reply.is_device_error());
        assert_eq!(reply.value(), None);

        match reply.into_value() {
            Err(SessionError::DeviceError { token, description }) => {
                assert_eq!(token, "er2");
                assert_eq!(description, "out of bounds");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn transport_closed_maps_to_io() {
        let err: SessionError = TransportError::Closed.into();
        assert!(err.is_connection_loss());
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn value_reply_displays_payload() {
        let reply = Reply::Value("0123".to_string());
        assert_eq!(reply.to_string(), "0123");
        assert_eq!(reply.value(), Some("0123"));
    }
}
