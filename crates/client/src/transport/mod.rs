//! Transport seam between a [`Connection`](crate::Connection) and a socket.
//!
//! A [`Connector`] performs the WebSocket upgrade and hands back a split
//! sink/stream pair. The sink exposes separate text and binary send paths so
//! that frame-type discipline is observable in tests.

mod native;

pub use native::TungsteniteConnector;

use async_trait::async_trait;
use thiserror::Error;

/// WebSocket close code for a normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for a protocol error
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Parameters of one upgrade attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub url: String,
    /// `Sec-WebSocket-Protocol` value to request
    pub subprotocol: &'static str,
    /// Bearer token for the `Authorization` header
    pub bearer: Option<String>,
}

impl std::fmt::Debug for HandshakeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeRequest")
            .field("url", &self.url)
            .field("subprotocol", &self.subprotocol)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The server answered the upgrade with a plain HTTP response
    #[error("upgrade rejected with HTTP {status}")]
    Http { status: u16, body: Option<String> },

    /// Upgrade completed but violated the WebSocket protocol
    #[error("handshake protocol error: {0}")]
    Protocol(String),

    #[error("handshake I/O error: {0}")]
    Io(String),
}

/// Inbound frame, control frames included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close frame with its code, if any
    Close(Option<u16>),
}

#[async_trait]
pub trait TransportSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Start the close handshake with `code` and an empty reason
    async fn close(&mut self, code: u16) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportStream: Send {
    /// Next frame, `None` once the stream has ended
    async fn next(&mut self) -> Option<Result<Incoming, TransportError>>;
}

/// An upgraded socket.
pub struct Handshake {
    pub sink: Box<dyn TransportSink>,
    pub stream: Box<dyn TransportStream>,
    /// Sub-protocol confirmed by the server
    pub negotiated_protocol: Option<String>,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("negotiated_protocol", &self.negotiated_protocol)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, request: HandshakeRequest) -> Result<Handshake, HandshakeError>;
}
