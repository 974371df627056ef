//! Client error taxonomy.
//!
//! Connection-level I/O failures are retryable and are retried by the pool.
//! Protocol, serialization and validation failures indicate a client or data
//! bug and surface immediately.

use std::time::Duration;

use spacelink_domain::DomainError;
use spacelink_shared::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure to establish or keep a socket
    #[error("connection error: {0}")]
    Connection(String),

    /// Handshake rejected without recoverable credentials
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Bounded wait exceeded
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Frame-type mismatch, malformed envelope or unexpected close
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The server refused a request (subscription or query error)
    #[error("{operation} rejected by server: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    /// An established connection went away
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("circuit open for {key}, retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    #[error("not connected")]
    NotConnected,

    /// A worker task panicked while handling one item
    #[error("{operation} panicked: {reason}")]
    Panicked {
        operation: &'static str,
        reason: String,
    },

    #[error("credential store error: {0}")]
    Credentials(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Build from a payload caught by `catch_unwind`.
    pub fn panicked(operation: &'static str, payload: &(dyn std::any::Any + Send)) -> Self {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked { operation, reason }
    }

    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the pool may retry the operation that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionLost(_) | Self::Timeout { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownVariant { .. } => Self::ProtocolViolation(err.to_string()),
            other => Self::Serialization(other.to_string()),
        }
    }
}

impl From<DomainError> for ClientError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::Parse(msg) => Self::Configuration(msg),
            DomainError::InvalidStateTransition { from, to } => {
                Self::ProtocolViolation(format!("invalid state transition {from} -> {to}"))
            }
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ClientError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(ClientError::connection("refused").is_retryable());
        assert!(ClientError::lost("reset").is_retryable());
        assert!(ClientError::timeout("connect", Duration::from_secs(1)).is_retryable());

        assert!(!ClientError::protocol("binary frame on json").is_retryable());
        assert!(!ClientError::validation("name empty").is_retryable());
        assert!(!ClientError::authentication("403").is_retryable());
        assert!(!ClientError::Serialization("eof".into()).is_retryable());
    }

    #[test]
    fn unknown_envelopes_map_to_protocol_violations() {
        let err: ClientError = ProtocolError::unknown_variant("envelope", "Heartbeat").into();
        assert!(matches!(err, ClientError::ProtocolViolation(_)));

        let err: ClientError = ProtocolError::deserialization("bad").into();
        assert!(matches!(err, ClientError::Serialization(_)));
    }
}
