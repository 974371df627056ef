//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a single connection.
///
/// ```text
/// Disconnected -> Connecting -> [Authenticating] -> Connected -> Subscribed
///                                                        \           |
///                                                         +-> Closing <+
/// any state -> Error -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Socket open initiated
    Connecting,
    /// Negotiating credentials with the server
    Authenticating,
    /// Handshake complete, no acknowledged subscription yet
    Connected,
    /// At least one subscription acknowledged
    Subscribed,
    /// Close handshake in progress
    Closing,
    /// Unrecoverable failure; cleanup pending
    Error,
}

impl ConnectionState {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Authenticating => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Subscribed => 4,
            ConnectionState::Closing => 5,
            ConnectionState::Error => 6,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Subscribed,
            5 => ConnectionState::Closing,
            6 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether the socket is usable for requests
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Error {
            return self != Disconnected;
        }

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Authenticating, Connected)
                | (Authenticating, Disconnected)
                | (Connected, Subscribed)
                | (Connected, Closing)
                | (Subscribed, Closing)
                | (Closing, Disconnected)
                | (Error, Disconnected)
        )
    }

    /// Validate a transition, returning the new state.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::invalid_transition(self, next))
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Closing => "closing",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_roundtrip() {
        let states = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
            ConnectionState::Subscribed,
            ConnectionState::Closing,
            ConnectionState::Error,
        ];

        for state in states {
            assert_eq!(ConnectionState::from_u8(state.to_u8()), state);
        }
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        let path = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
            ConnectionState::Subscribed,
            ConnectionState::Closing,
            ConnectionState::Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn error_is_reachable_from_live_states_and_leads_to_disconnected() {
        assert!(ConnectionState::Subscribed.can_transition_to(ConnectionState::Error));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Error));
        assert!(ConnectionState::Error.can_transition_to(ConnectionState::Disconnected));
        assert!(!ConnectionState::Error.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn skipping_the_handshake_is_rejected() {
        let err = ConnectionState::Disconnected
            .transition(ConnectionState::Subscribed)
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }
}
