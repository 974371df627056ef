//! Server selection: which implementation we talk to and how.
//!
//! A [`ServerConfig`] is immutable once built. It decides three things for
//! every connection built from it: the URL, the negotiated WebSocket
//! sub-protocol ([`WireProtocol`]) and therefore the frame type, and the
//! naming conventions of the server implementation ([`ServerLanguage`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ============================================================================
// Server Language
// ============================================================================

/// Implementation language of the server module, which determines its
/// field-naming and serialization conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerLanguage {
    /// snake_case keys, no injected metadata
    #[serde(rename = "rust", alias = "a")]
    Rust,
    /// PascalCase keys, RFC 3339 `CreatedAt`
    #[serde(rename = "csharp", alias = "c#", alias = "b")]
    CSharp,
    /// camelCase keys, `createdAt` in unix millis
    #[serde(rename = "typescript", alias = "ts", alias = "c")]
    TypeScript,
    /// PascalCase keys with Go initialisms, `CreatedAt` in unix seconds
    #[serde(rename = "go", alias = "golang", alias = "d")]
    Go,
}

impl ServerLanguage {
    /// All supported languages, in declaration order
    pub const ALL: [ServerLanguage; 4] = [
        ServerLanguage::Rust,
        ServerLanguage::CSharp,
        ServerLanguage::TypeScript,
        ServerLanguage::Go,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerLanguage::Rust => "rust",
            ServerLanguage::CSharp => "csharp",
            ServerLanguage::TypeScript => "typescript",
            ServerLanguage::Go => "go",
        }
    }
}

impl fmt::Display for ServerLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerLanguage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rust" | "a" => Ok(ServerLanguage::Rust),
            "csharp" | "c#" | "cs" | "b" => Ok(ServerLanguage::CSharp),
            "typescript" | "ts" | "c" => Ok(ServerLanguage::TypeScript),
            "go" | "golang" | "d" => Ok(ServerLanguage::Go),
            other => Err(DomainError::parse(format!("unknown server language '{other}'"))),
        }
    }
}

// ============================================================================
// Wire Protocol / Serialization Format
// ============================================================================

/// Payload encoding, independent of the server language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    Json,
    Binary,
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationFormat::Json => write!(f, "json"),
            SerializationFormat::Binary => write!(f, "binary"),
        }
    }
}

/// Negotiated WebSocket sub-protocol.
///
/// Exactly one frame type is valid per protocol: text frames for `Json`,
/// binary frames for `Binary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WireProtocol {
    #[default]
    Json,
    Binary,
}

impl WireProtocol {
    pub const JSON_SUBPROTOCOL: &'static str = "v1.json.spacetimedb";
    pub const BINARY_SUBPROTOCOL: &'static str = "v1.bsatn.spacetimedb";

    /// Value sent in the `Sec-WebSocket-Protocol` header
    pub fn subprotocol(&self) -> &'static str {
        match self {
            WireProtocol::Json => Self::JSON_SUBPROTOCOL,
            WireProtocol::Binary => Self::BINARY_SUBPROTOCOL,
        }
    }

    pub fn format(&self) -> SerializationFormat {
        match self {
            WireProtocol::Json => SerializationFormat::Json,
            WireProtocol::Binary => SerializationFormat::Binary,
        }
    }

    /// Whether frames for this protocol must be text frames
    pub fn is_text(&self) -> bool {
        matches!(self, WireProtocol::Json)
    }
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subprotocol())
    }
}

impl FromStr for WireProtocol {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "text" | Self::JSON_SUBPROTOCOL => Ok(WireProtocol::Json),
            "binary" | "bsatn" | Self::BINARY_SUBPROTOCOL => Ok(WireProtocol::Binary),
            other => Err(DomainError::parse(format!("unknown wire protocol '{other}'"))),
        }
    }
}

impl TryFrom<String> for WireProtocol {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WireProtocol> for String {
    fn from(value: WireProtocol) -> Self {
        match value {
            WireProtocol::Json => "json".to_string(),
            WireProtocol::Binary => "binary".to_string(),
        }
    }
}

// ============================================================================
// Server Config
// ============================================================================

fn default_port() -> u16 {
    3000
}

/// Everything needed to reach one database on one server.
///
/// Fields are private: a config is immutable once built, and a connection
/// built from it keeps a copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerConfig {
    language: ServerLanguage,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    #[serde(default)]
    protocol: WireProtocol,
    #[serde(default)]
    use_ssl: bool,
}

impl ServerConfig {
    /// Create a config speaking the JSON protocol over plain `ws://`
    pub fn new(
        language: ServerLanguage,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            language,
            host: host.into(),
            port,
            database: database.into(),
            protocol: WireProtocol::Json,
            use_ssl: false,
        }
    }

    pub fn with_protocol(mut self, protocol: WireProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    /// Check the invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.host.trim().is_empty() {
            return Err(DomainError::validation("server host must not be empty"));
        }
        if self.host.contains('/') || self.host.contains(char::is_whitespace) {
            return Err(DomainError::validation(format!(
                "server host '{}' must be a bare host name",
                self.host
            )));
        }
        if self.database.trim().is_empty() {
            return Err(DomainError::validation("database identity must not be empty"));
        }
        if self.port == 0 {
            return Err(DomainError::validation("server port must be non-zero"));
        }
        Ok(())
    }

    pub fn language(&self) -> ServerLanguage {
        self.language
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    pub fn format(&self) -> SerializationFormat {
        self.protocol.format()
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Subscribe URL for this database.
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/v1/database/{}/subscribe",
            self.host, self.port, self.database
        )
    }

    /// Key under which credentials for this server are stored
    pub fn credential_key(&self) -> String {
        format!("{}:{}", self.host, self.database)
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.endpoint(), self.database.clone())
    }
}

// ============================================================================
// Pool Key
// ============================================================================

/// Identity of a connection pool bucket: one server endpoint plus one
/// database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    endpoint: String,
    database: String,
}

impl PoolKey {
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            database: database.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.database)
    }
}
