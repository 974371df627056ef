//! In-memory transport for tests.
//!
//! [`MemoryConnector`] plays the server side of the protocol according to a
//! [`ServerScript`] and records every handshake and every frame the client
//! sends, so tests can assert which send path (text or binary) was used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use spacelink_domain::{Credentials, WireProtocol};
use spacelink_shared::{
    table_from_query, ClientMessage, DatabaseUpdate, IdentityToken, InitialSubscription,
    OneOffQueryResponse, OneOffTable, ReducerCallInfo, Serializer, ServerMessage,
    SubscriptionError, TableUpdate, TransactionUpdate, UpdateStatus, WirePayload,
};
use tokio::sync::mpsc;

use crate::transport::{
    Connector, Handshake, HandshakeError, HandshakeRequest, Incoming, TransportError,
    TransportSink, TransportStream,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A frame the client handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Close(u16),
}

impl SentFrame {
    pub fn is_data(&self) -> bool {
        matches!(self, SentFrame::Text(_) | SentFrame::Binary(_))
    }
}

/// How the scripted server answers `Subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionReply {
    /// Send an `InitialSubscription` with the scripted rows
    Ack,
    /// Send a `SubscriptionError` with this message
    Reject(String),
    /// Never answer
    Silent,
}

/// Behaviour of the scripted server.
#[derive(Debug, Clone)]
pub struct ServerScript {
    pub protocol: WireProtocol,
    /// Delay before each upgrade completes
    pub connect_latency: Duration,
    /// Answer unauthenticated upgrades with HTTP 400 carrying this pair
    pub challenge: Option<Credentials>,
    /// Reject every upgrade with this HTTP status
    pub reject_status: Option<u16>,
    /// Fail this many upgrades with an I/O error before succeeding
    pub fail_first: usize,
    /// Sub-protocol to confirm instead of the requested one
    pub negotiated_override: Option<String>,
    pub subscription_reply: SubscriptionReply,
    /// Commit every reducer call with an empty update
    pub ack_reducers: bool,
    /// Echo the client's close frame
    pub ack_close: bool,
    pub answer_pings: bool,
    /// Send `IdentityToken` right after the upgrade
    pub send_identity: Option<Credentials>,
    /// Server-native rows per table name, returned by subscriptions and queries
    pub rows: HashMap<String, Vec<Value>>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Json,
            connect_latency: Duration::ZERO,
            challenge: None,
            reject_status: None,
            fail_first: 0,
            negotiated_override: None,
            subscription_reply: SubscriptionReply::Ack,
            ack_reducers: true,
            ack_close: true,
            answer_pings: true,
            send_identity: None,
            rows: HashMap::new(),
        }
    }
}

impl ServerScript {
    pub fn new(protocol: WireProtocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    pub fn with_rows(mut self, table: impl Into<String>, rows: Vec<Value>) -> Self {
        self.rows.insert(table.into(), rows);
        self
    }
}

/// Server end of one accepted socket.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Result<Incoming, TransportError>>,
    serializer: Serializer,
}

impl ServerHandle {
    /// Push an envelope using the connection's format
    pub fn send(&self, message: &ServerMessage) -> bool {
        match self.serializer.encode_server(message) {
            Ok(payload) => self.send_payload(payload),
            Err(_) => false,
        }
    }

    pub fn send_payload(&self, payload: WirePayload) -> bool {
        let incoming = match payload {
            WirePayload::Text(text) => Incoming::Text(text),
            WirePayload::Binary(bytes) => Incoming::Binary(bytes),
        };
        self.send_raw(incoming)
    }

    pub fn send_raw(&self, incoming: Incoming) -> bool {
        self.tx.send(Ok(incoming)).is_ok()
    }

    /// Simulate a reset socket
    pub fn fail(&self, reason: &str) -> bool {
        self.tx.send(Err(TransportError::new(reason))).is_ok()
    }
}

#[derive(Debug, Default)]
struct Log {
    handshakes: Vec<HandshakeRequest>,
    frames: Vec<Vec<SentFrame>>,
    servers: Vec<ServerHandle>,
    challenges: usize,
    failures_left: Option<usize>,
}

#[derive(Debug, Default)]
struct Gauges {
    open: AtomicUsize,
    peak: AtomicUsize,
}

/// Scripted in-memory [`Connector`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    script: Arc<Mutex<ServerScript>>,
    log: Arc<Mutex<Log>>,
    gauges: Arc<Gauges>,
}

impl MemoryConnector {
    pub fn new(script: ServerScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            log: Arc::new(Mutex::new(Log::default())),
            gauges: Arc::new(Gauges::default()),
        }
    }

    /// Change the script for subsequent upgrades and frames
    pub fn update_script(&self, f: impl FnOnce(&mut ServerScript)) {
        f(&mut lock(&self.script));
    }

    pub fn handshakes(&self) -> Vec<HandshakeRequest> {
        lock(&self.log).handshakes.clone()
    }

    /// Upgrades answered with an auth challenge
    pub fn challenges(&self) -> usize {
        lock(&self.log).challenges
    }

    /// Sockets accepted so far
    pub fn accepted(&self) -> usize {
        lock(&self.log).frames.len()
    }

    /// Frames sent on the `index`-th accepted socket
    pub fn frames(&self, index: usize) -> Vec<SentFrame> {
        lock(&self.log).frames.get(index).cloned().unwrap_or_default()
    }

    /// Frames sent on every socket, in acceptance order
    pub fn all_frames(&self) -> Vec<SentFrame> {
        lock(&self.log).frames.iter().flatten().cloned().collect()
    }

    pub fn server(&self, index: usize) -> Option<ServerHandle> {
        lock(&self.log).servers.get(index).cloned()
    }

    /// Sockets currently open
    pub fn open_sockets(&self) -> usize {
        self.gauges.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sockets
    pub fn peak_sockets(&self) -> usize {
        self.gauges.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, request: HandshakeRequest) -> Result<Handshake, HandshakeError> {
        let script = lock(&self.script).clone();
        if !script.connect_latency.is_zero() {
            tokio::time::sleep(script.connect_latency).await;
        }

        let index = {
            let mut log = lock(&self.log);
            log.handshakes.push(request.clone());

            let failures_left = log.failures_left.get_or_insert(script.fail_first);
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(HandshakeError::Io("connection refused".into()));
            }

            if let Some(status) = script.reject_status {
                return Err(HandshakeError::Http { status, body: None });
            }

            if let Some(expected) = &script.challenge {
                match &request.bearer {
                    None => {
                        log.challenges += 1;
                        let body = serde_json::json!({
                            "identity": expected.identity,
                            "token": expected.auth_token,
                        });
                        return Err(HandshakeError::Http {
                            status: 400,
                            body: Some(body.to_string()),
                        });
                    }
                    Some(token) if *token != expected.auth_token => {
                        return Err(HandshakeError::Http {
                            status: 401,
                            body: None,
                        });
                    }
                    Some(_) => {}
                }
            }

            log.frames.push(Vec::new());
            log.frames.len() - 1
        };

        let serializer = Serializer::new(script.protocol.format());
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerHandle { tx, serializer };
        lock(&self.log).servers.push(server.clone());

        if let Some(identity) = &script.send_identity {
            server.send(&ServerMessage::IdentityToken(IdentityToken {
                identity: identity.identity.clone(),
                token: identity.auth_token.clone(),
                connection_id: format!("conn-{index}"),
            }));
        }

        let open = self.gauges.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauges.peak.fetch_max(open, Ordering::SeqCst);

        let negotiated_protocol = Some(
            script
                .negotiated_override
                .clone()
                .unwrap_or_else(|| request.subprotocol.to_string()),
        );

        Ok(Handshake {
            sink: Box::new(MemorySink {
                index,
                server,
                script: Arc::clone(&self.script),
                log: Arc::clone(&self.log),
                gauges: Arc::clone(&self.gauges),
            }),
            stream: Box::new(MemoryStream { rx }),
            negotiated_protocol,
        })
    }
}

struct MemorySink {
    index: usize,
    server: ServerHandle,
    script: Arc<Mutex<ServerScript>>,
    log: Arc<Mutex<Log>>,
    gauges: Arc<Gauges>,
}

impl MemorySink {
    fn record(&self, frame: SentFrame) {
        if let Some(frames) = lock(&self.log).frames.get_mut(self.index) {
            frames.push(frame);
        }
    }

    fn respond(&self, payload: WirePayload) {
        let script = lock(&self.script).clone();
        let Ok(message) = self.server.serializer.decode_client(&payload) else {
            return;
        };

        match message {
            ClientMessage::Subscribe(sub) => match &script.subscription_reply {
                SubscriptionReply::Ack => {
                    let tables = sub
                        .query_strings
                        .iter()
                        .filter_map(|q| table_from_query(q))
                        .enumerate()
                        .map(|(i, table)| {
                            let inserts = script.rows.get(table).cloned().unwrap_or_default();
                            TableUpdate {
                                table_id: i as u32,
                                table_name: table.to_string(),
                                num_rows: inserts.len() as u64,
                                deletes: Vec::new(),
                                inserts,
                            }
                        })
                        .collect();
                    self.server
                        .send(&ServerMessage::InitialSubscription(InitialSubscription {
                            database_update: DatabaseUpdate { tables },
                            request_id: sub.request_id,
                            total_host_execution_duration_micros: 0,
                        }));
                }
                SubscriptionReply::Reject(reason) => {
                    self.server
                        .send(&ServerMessage::SubscriptionError(SubscriptionError {
                            request_id: Some(sub.request_id),
                            table_id: None,
                            error: reason.clone(),
                        }));
                }
                SubscriptionReply::Silent => {}
            },
            ClientMessage::CallReducer(call) if script.ack_reducers => {
                self.server
                    .send(&ServerMessage::TransactionUpdate(TransactionUpdate {
                        status: UpdateStatus::Committed(DatabaseUpdate::default()),
                        timestamp: 0,
                        caller_identity: String::new(),
                        reducer_call: ReducerCallInfo {
                            reducer_name: call.reducer,
                            reducer_id: 0,
                            args: call.args,
                            request_id: call.request_id,
                        },
                        energy_quanta_used: 0,
                    }));
            }
            ClientMessage::CallReducer(_) => {}
            ClientMessage::OneOffQuery(query) => {
                let tables = table_from_query(&query.query_string)
                    .map(|table| {
                        vec![OneOffTable {
                            table_name: table.to_string(),
                            rows: script.rows.get(table).cloned().unwrap_or_default(),
                        }]
                    })
                    .unwrap_or_default();
                self.server
                    .send(&ServerMessage::OneOffQueryResponse(OneOffQueryResponse {
                        message_id: query.message_id,
                        error: None,
                        tables,
                        total_host_execution_duration_micros: 0,
                    }));
            }
        }
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.gauges.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.record(SentFrame::Text(text.clone()));
        self.respond(WirePayload::Text(text));
        Ok(())
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.record(SentFrame::Binary(bytes.clone()));
        self.respond(WirePayload::Binary(bytes));
        Ok(())
    }

    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.record(SentFrame::Ping);
        if lock(&self.script).answer_pings {
            self.server.send_raw(Incoming::Pong(payload));
        }
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        self.record(SentFrame::Close(code));
        if lock(&self.script).ack_close {
            self.server.send_raw(Incoming::Close(Some(code)));
        }
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<Incoming, TransportError>>,
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Incoming, TransportError>> {
        self.rx.recv().await
    }
}
