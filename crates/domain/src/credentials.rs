//! Credentials negotiated with a server.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity/token pair issued by a server on the first handshake.
///
/// Stored per `(host, database)` so a reconnect can skip the challenge.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub identity: String,
    pub auth_token: String,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            auth_token: auth_token.into(),
            issued_at: Utc::now(),
        }
    }

    /// `Authorization` header value
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.auth_token)
    }
}

// Tokens never go to logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("auth_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}
