//! Native transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{
    Connector, Handshake, HandshakeError, HandshakeRequest, Incoming, TransportError,
    TransportSink, TransportStream,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens real WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(&self, request: HandshakeRequest) -> Result<Handshake, HandshakeError> {
        url::Url::parse(&request.url)
            .map_err(|e| HandshakeError::Io(format!("invalid url {}: {e}", request.url)))?;

        let mut upgrade = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| HandshakeError::Io(e.to_string()))?;
        upgrade.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(request.subprotocol),
        );
        if let Some(token) = &request.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| HandshakeError::Io(format!("invalid bearer token: {e}")))?;
            upgrade.headers_mut().insert(AUTHORIZATION, value);
        }

        match connect_async(upgrade).await {
            Ok((socket, response)) => {
                let negotiated_protocol = response
                    .headers()
                    .get(SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                tracing::debug!(
                    url = %request.url,
                    protocol = ?negotiated_protocol,
                    "WebSocket upgrade complete"
                );

                let (sink, stream) = socket.split();
                Ok(Handshake {
                    sink: Box::new(TungsteniteSink { sink }),
                    stream: Box::new(TungsteniteStream { stream }),
                    negotiated_protocol,
                })
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned());
                Err(HandshakeError::Http { status, body })
            }
            Err(tungstenite::Error::Protocol(e)) => Err(HandshakeError::Protocol(e.to_string())),
            Err(e) => Err(HandshakeError::Io(e.to_string())),
        }
    }
}

struct TungsteniteSink {
    sink: SplitSink<Socket, Message>,
}

impl TungsteniteSink {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::new(e.to_string()))
    }
}

#[async_trait]
impl TransportSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text)).await
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.send(Message::Binary(bytes)).await
    }

    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(Message::Ping(payload)).await
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.send(Message::Close(Some(frame))).await
    }
}

struct TungsteniteStream {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl TransportStream for TungsteniteStream {
    async fn next(&mut self) -> Option<Result<Incoming, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::new(e.to_string()))),
            };
            let incoming = match message {
                Message::Text(text) => Incoming::Text(text),
                Message::Binary(bytes) => Incoming::Binary(bytes),
                Message::Ping(payload) => Incoming::Ping(payload),
                Message::Pong(payload) => Incoming::Pong(payload),
                Message::Close(frame) => Incoming::Close(frame.map(|f| u16::from(f.code))),
                // raw frames never surface from a read
                Message::Frame(_) => continue,
            };
            return Some(Ok(incoming));
        }
    }
}
