//! One logical session to one server.
//!
//! A [`Connection`] owns the socket through a background session, keeps
//! the frame type in line with the negotiated sub-protocol, tracks
//! acknowledged subscriptions and publishes lifecycle and table events.
//! It never reconnects on its own; retries belong to the pool.

mod pending;
mod session;
mod subscriptions;

pub use pending::{QueryTable, ReducerOutcome};
pub use subscriptions::SubscriptionSet;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use spacelink_domain::{ConnectionId, ConnectionState, Credentials, EntityKind, ServerConfig};
use spacelink_shared::{table_query, CallReducer, ClientMessage, OneOffQuery, Subscribe, WirePayload};
use tokio::sync::{oneshot, watch, Mutex};

use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::events::EventDispatcher;
use crate::pipeline::{DataPipeline, PipelineConfiguration};
use crate::settings::{ConnectionSettings, PipelineSettings};
use crate::transport::{
    Connector, Handshake, HandshakeError, HandshakeRequest, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};

use pending::PendingSubscribe;
use session::{Outbound, ReaderContext, Session, SessionTimings, Shared};

/// Optional collaborators and tuning for a [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub settings: ConnectionSettings,
    pub pipeline: PipelineSettings,
    pub events: Option<EventDispatcher>,
}

pub struct Connection {
    config: ServerConfig,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    pipeline: DataPipeline,
    shared: Arc<Shared>,
    /// Held for the whole of connect and disconnect
    session: Mutex<Option<Session>>,
    /// Serializes subscription requests
    subscribe_lock: Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("url", &self.config.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resets a half-finished connect to `Disconnected`, including when the
/// connect future is dropped.
struct ConnectGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.force_state(
                ConnectionState::Disconnected,
                Some("connect aborted".to_string()),
            );
        }
    }
}

impl Connection {
    pub fn new(
        config: ServerConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        options: ConnectionOptions,
    ) -> Self {
        let pipeline = DataPipeline::new(PipelineConfiguration::for_server(&config, &options.pipeline));
        Self {
            config,
            settings: options.settings,
            connector,
            credentials,
            pipeline,
            shared: Arc::new(Shared::new(ConnectionId::new(), options.events)),
            session: Mutex::new(None),
            subscribe_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &DataPipeline {
        &self.pipeline
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.watch()
    }

    /// Open and not silent for longer than the heartbeat timeout
    pub fn is_healthy(&self) -> bool {
        self.state().is_open() && self.shared.idle_for() <= self.settings.heartbeat_timeout()
    }

    pub async fn subscriptions(&self) -> SubscriptionSet {
        self.shared.subscriptions.read().await.clone()
    }

    /// Identity announced by the server, once known
    pub async fn identity(&self) -> Option<String> {
        self.shared.identity.read().await.clone()
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Open the socket, authenticate and start the background tasks.
    ///
    /// Returns immediately if already open. On any error, or if the future
    /// is dropped, the socket is closed and the state is `Disconnected`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if self.state().is_open() && !session.is_finished() {
                return Ok(());
            }
        }
        // Leftover from a lost socket
        slot.take();

        self.shared.transition(ConnectionState::Connecting)?;
        let mut guard = ConnectGuard {
            shared: &self.shared,
            armed: true,
        };
        tracing::info!(connection_id = %self.id(), url = %self.config.url(), "Connecting");

        let timeout = self.settings.connect_timeout();
        let mut handshake = tokio::time::timeout(timeout, self.establish())
            .await
            .map_err(|_| ClientError::timeout("connect", timeout))??;

        let expected = self.config.protocol().subprotocol();
        if handshake.negotiated_protocol.as_deref() != Some(expected) {
            if let Err(e) = handshake.sink.close(CLOSE_PROTOCOL_ERROR).await {
                tracing::debug!(connection_id = %self.id(), "Close after bad negotiation failed: {}", e);
            }
            return Err(ClientError::protocol(format!(
                "server negotiated {:?}, expected {expected}",
                handshake.negotiated_protocol
            )));
        }

        self.shared.transition(ConnectionState::Connected)?;
        guard.armed = false;

        let ctx = ReaderContext {
            shared: Arc::clone(&self.shared),
            protocol: self.config.protocol(),
            serializer: self.pipeline.serializer(),
            pipeline: self.pipeline.clone(),
            credentials: Arc::clone(&self.credentials),
            credential_key: self.config.credential_key(),
        };
        let timings = SessionTimings {
            outbound_buffer: self.settings.outbound_buffer,
            heartbeat_interval: self.settings.heartbeat_interval(),
            heartbeat_timeout: self.settings.heartbeat_timeout(),
        };
        *slot = Some(Session::spawn(ctx, handshake.sink, handshake.stream, timings));

        tracing::info!(
            connection_id = %self.id(),
            protocol = %self.config.protocol(),
            "Connected"
        );
        Ok(())
    }

    /// Upgrade with cached credentials, or via the auth challenge.
    async fn establish(&self) -> Result<Handshake, ClientError> {
        let key = self.config.credential_key();

        if let Some(cached) = self.credentials.load(&key).await? {
            match self.upgrade(Some(cached.auth_token)).await {
                Ok(handshake) => return Ok(handshake),
                Err(HandshakeError::Http {
                    status: 401 | 403, ..
                }) => {
                    tracing::warn!(key = %key, "Cached credentials rejected; re-authenticating");
                    self.credentials.remove(&key).await?;
                }
                Err(e) => return Err(handshake_error(e)),
            }
        }

        self.shared.transition(ConnectionState::Authenticating)?;
        match self.upgrade(None).await {
            Ok(handshake) => Ok(handshake),
            Err(HandshakeError::Http { status: 400, body }) => {
                let credentials = parse_challenge(body.as_deref()).ok_or_else(|| {
                    ClientError::authentication("HTTP 400 without an identity/token pair")
                })?;
                self.credentials.store(&key, &credentials).await?;
                tracing::info!(key = %key, identity = %credentials.identity, "Received credentials");
                self.upgrade(Some(credentials.auth_token))
                    .await
                    .map_err(handshake_error)
            }
            Err(e) => Err(handshake_error(e)),
        }
    }

    async fn upgrade(&self, bearer: Option<String>) -> Result<Handshake, HandshakeError> {
        self.connector
            .open(HandshakeRequest {
                url: self.config.url(),
                subprotocol: self.config.protocol().subprotocol(),
                bearer,
            })
            .await
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    /// Close handshake with code 1000, bounded by the close timeout.
    ///
    /// Idempotent. Errors from the close itself are logged, not returned.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        let Some(mut session) = slot.take() else {
            if self.state() == ConnectionState::Error {
                self.shared.force_state(ConnectionState::Disconnected, None);
            }
            return;
        };

        match self.shared.transition(ConnectionState::Closing) {
            Ok(_) => {
                tracing::info!(connection_id = %self.id(), "Closing");
                if session
                    .outbound
                    .send(Outbound::Close { code: CLOSE_NORMAL })
                    .await
                    .is_err()
                {
                    tracing::debug!(connection_id = %self.id(), "Writer already stopped");
                }
                let timeout = self.settings.close_timeout();
                if tokio::time::timeout(timeout, &mut session.reader).await.is_err() {
                    tracing::warn!(
                        connection_id = %self.id(),
                        "Close not acknowledged within {:?}; forcing",
                        timeout
                    );
                }
            }
            Err(_) => {
                tracing::debug!(connection_id = %self.id(), state = %self.state(), "Cleaning up closed socket");
            }
        }
        drop(session);

        let failed = self
            .shared
            .pending
            .lock()
            .await
            .fail_all(|| ClientError::lost("connection closed"));
        if failed > 0 {
            tracing::debug!(connection_id = %self.id(), "Cancelled {} pending requests", failed);
        }
        self.shared.subscriptions.write().await.clear();
        self.shared.force_state(ConnectionState::Disconnected, None);
        tracing::info!(connection_id = %self.id(), "Disconnected");
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.state().is_open() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Send one encoded envelope, in call order.
    ///
    /// The payload's frame type must match the negotiated protocol: text for
    /// JSON, binary for the binary protocol. A mismatch is a client bug and
    /// is rejected without touching the socket.
    pub async fn send_message(&self, payload: WirePayload) -> Result<(), ClientError> {
        let protocol = self.config.protocol();
        if payload.is_text() != protocol.is_text() {
            tracing::error!(
                connection_id = %self.id(),
                protocol = %protocol,
                "Refusing to send a {} frame",
                if payload.is_text() { "text" } else { "binary" }
            );
            return Err(ClientError::protocol(format!(
                "{} frame on a {protocol} connection",
                if payload.is_text() { "text" } else { "binary" }
            )));
        }
        self.ensure_open()?;

        let outbound = {
            let slot = self.session.lock().await;
            slot.as_ref()
                .map(|s| s.outbound.clone())
                .ok_or(ClientError::NotConnected)?
        };

        let (ack, done) = oneshot::channel();
        outbound
            .send(Outbound::Frame { payload, ack })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        done.await
            .map_err(|_| ClientError::lost("socket closed before the frame was written"))?
    }

    async fn send_envelope(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let payload = self.pipeline.serializer().encode_client(message)?;
        tracing::debug!(connection_id = %self.id(), kind = message.kind(), "Sending");
        self.send_message(payload).await
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Subscribe to tables. Tables already subscribed are a no-op.
    ///
    /// Sends one `Subscribe` carrying the full table set and returns once
    /// the server's snapshot acknowledges it. The set only grows on that
    /// acknowledgement.
    pub async fn subscribe<I, S>(&self, tables: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: Vec<String> = tables
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if requested.is_empty() {
            return Err(ClientError::validation("no tables to subscribe"));
        }

        let _serial = self.subscribe_lock.lock().await;
        self.ensure_open()?;

        let desired = {
            let current = self.shared.subscriptions.read().await;
            let missing = current.missing(&requested);
            if missing.is_empty() {
                tracing::debug!(connection_id = %self.id(), "Already subscribed to {:?}", requested);
                return Ok(());
            }
            let mut desired = current.tables();
            desired.extend(missing.into_iter().map(str::to_string));
            desired
        };

        let request_id = self.shared.next_request_id();
        let (reply, settled) = oneshot::channel();
        self.shared.pending.lock().await.insert_subscribe(
            request_id,
            PendingSubscribe {
                tables: desired.clone(),
                reply,
            },
        );

        let message =
            ClientMessage::Subscribe(Subscribe::for_tables(desired.iter().map(String::as_str), request_id));
        if let Err(e) = self.send_envelope(&message).await {
            self.shared.pending.lock().await.remove_subscribe(request_id);
            return Err(e);
        }

        let timeout = self.settings.subscribe_timeout();
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::lost("connection closed before the subscription was applied")),
            Err(_) => {
                self.shared.pending.lock().await.remove_subscribe(request_id);
                Err(ClientError::timeout("subscribe", timeout))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reducers and queries
    // ------------------------------------------------------------------------

    /// Queue a reducer call and return its request id.
    ///
    /// Completes once the frame is written (bounded by the reducer timeout);
    /// effects arrive later as table events.
    pub async fn call_reducer<A>(&self, reducer: &str, args: &A) -> Result<u32, ClientError>
    where
        A: Serialize + ?Sized,
    {
        self.queue_reducer(reducer, args, None).await
    }

    /// Call a reducer and wait for the transaction that settles it.
    pub async fn call_reducer_confirmed<A>(
        &self,
        reducer: &str,
        args: &A,
    ) -> Result<ReducerOutcome, ClientError>
    where
        A: Serialize + ?Sized,
    {
        let (reply, settled) = oneshot::channel();
        let request_id = self.queue_reducer(reducer, args, Some(reply)).await?;

        let timeout = self.settings.reducer_timeout();
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::lost("connection closed before the reducer settled")),
            Err(_) => {
                self.shared.pending.lock().await.remove_reducer(request_id);
                Err(ClientError::timeout("reducer", timeout))
            }
        }
    }

    async fn queue_reducer<A>(
        &self,
        reducer: &str,
        args: &A,
        reply: Option<pending::Reply<ReducerOutcome>>,
    ) -> Result<u32, ClientError>
    where
        A: Serialize + ?Sized,
    {
        if reducer.trim().is_empty() {
            return Err(ClientError::validation("reducer name is empty"));
        }
        self.ensure_open()?;

        let canonical = serde_json::to_value(args)?;
        let args = self.pipeline.adapt_outbound(&canonical, EntityKind::Generic);
        let request_id = self.shared.next_request_id();
        let tracked = reply.is_some();
        if let Some(reply) = reply {
            self.shared.pending.lock().await.insert_reducer(request_id, reply);
        }

        let message = ClientMessage::CallReducer(CallReducer {
            reducer: reducer.to_string(),
            args,
            request_id,
            flags: 0,
        });

        let timeout = self.settings.reducer_timeout();
        let sent = match tokio::time::timeout(timeout, self.send_envelope(&message)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::timeout("reducer", timeout)),
        };
        if let Err(e) = sent {
            if tracked {
                self.shared.pending.lock().await.remove_reducer(request_id);
            }
            return Err(e);
        }
        Ok(request_id)
    }

    /// Run a SQL query once without subscribing. Rows come back canonical.
    pub async fn one_off_query(&self, sql: &str) -> Result<Vec<QueryTable>, ClientError> {
        if sql.trim().is_empty() {
            return Err(ClientError::validation("query is empty"));
        }
        self.ensure_open()?;

        let message_id = uuid::Uuid::new_v4().simple().to_string();
        let (reply, settled) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert_query(message_id.clone(), reply);

        let message = ClientMessage::OneOffQuery(OneOffQuery {
            message_id: message_id.clone(),
            query_string: sql.to_string(),
        });
        if let Err(e) = self.send_envelope(&message).await {
            self.shared.pending.lock().await.remove_query(&message_id);
            return Err(e);
        }

        let timeout = self.settings.reducer_timeout();
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::lost("connection closed before the query returned")),
            Err(_) => {
                self.shared.pending.lock().await.remove_query(&message_id);
                Err(ClientError::timeout("one-off query", timeout))
            }
        }
    }

    /// All rows of one table.
    pub async fn query_table(&self, table: &str) -> Result<Vec<Value>, ClientError> {
        let tables = self.one_off_query(&table_query(table)).await?;
        Ok(tables.into_iter().flat_map(|t| t.rows).collect())
    }
}

fn handshake_error(err: HandshakeError) -> ClientError {
    match err {
        HandshakeError::Http {
            status: 400 | 401 | 403,
            ..
        } => ClientError::authentication(err.to_string()),
        HandshakeError::Http { .. } | HandshakeError::Io(_) => ClientError::connection(err.to_string()),
        HandshakeError::Protocol(msg) => ClientError::protocol(msg),
    }
}

/// Identity/token pair from an auth challenge body.
fn parse_challenge(body: Option<&str>) -> Option<Credentials> {
    let value: Value = serde_json::from_str(body?).ok()?;
    let identity = value.get("identity")?.as_str()?;
    let token = value
        .get("token")
        .or_else(|| value.get("auth_token"))?
        .as_str()?;
    if identity.is_empty() || token.is_empty() {
        return None;
    }
    Some(Credentials::new(identity, token))
}

/// Wait until `connection` reaches `state`. False if the timeout elapses first.
pub async fn wait_for_state(
    connection: &Connection,
    state: ConnectionState,
    timeout: Duration,
) -> bool {
    let mut rx = connection.watch_state();
    tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests;
