//! Per-socket background tasks and the state they share with the
//! [`Connection`](super::Connection).
//!
//! One session owns three tasks: a writer that drains the outbound queue
//! into the transport sink, a reader that decodes inbound frames, and a
//! heartbeat that pings through the transport and watches for silence.
//! All three stop on the session's cancellation token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use spacelink_domain::{ConnectionId, ConnectionState, Credentials, EntityKind, WireProtocol};
use spacelink_shared::{
    DatabaseUpdate, InitialSubscription, OneOffQueryResponse, Serializer, ServerMessage,
    SubscriptionError, TableUpdate, TransactionUpdate, UpdateStatus, WirePayload,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pending::{PendingRequests, QueryTable, ReducerOutcome};
use super::subscriptions::SubscriptionSet;
use crate::credentials::CredentialStore;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventDispatcher, EventPayload, RowEvent, RowUpdate};
use crate::pipeline::DataPipeline;
use crate::transport::{Incoming, TransportSink, TransportStream};

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Shared {
    pub id: ConnectionId,
    state: AtomicU8,
    state_tx: watch::Sender<ConnectionState>,
    events: Option<EventDispatcher>,
    pub subscriptions: RwLock<SubscriptionSet>,
    pub pending: Mutex<PendingRequests>,
    pub identity: RwLock<Option<String>>,
    next_request_id: AtomicU32,
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl Shared {
    pub fn new(id: ConnectionId, events: Option<EventDispatcher>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            state_tx,
            events,
            subscriptions: RwLock::new(SubscriptionSet::default()),
            pending: Mutex::new(PendingRequests::default()),
            identity: RwLock::new(None),
            next_request_id: AtomicU32::new(1),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }

    pub fn publish(&self, payload: EventPayload) {
        if let Some(events) = &self.events {
            events.publish(ClientEvent::new(self.id, payload));
        }
    }

    fn announce(&self, previous: ConnectionState, current: ConnectionState, reason: Option<String>) {
        self.state_tx.send_replace(current);
        tracing::debug!(
            connection_id = %self.id,
            "State {} -> {}",
            previous,
            current
        );
        if let Some(events) = &self.events {
            events.publish(ClientEvent::lifecycle(self.id, previous, current, reason));
        }
    }

    /// Validated transition. Returns the previous state.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, ClientError> {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            let current = ConnectionState::from_u8(raw);
            current.transition(next)?;
            match self
                .state
                .compare_exchange(raw, next.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.announce(current, next, None);
                    return Ok(current);
                }
                Err(actual) => raw = actual,
            }
        }
    }

    /// Move from `from` to `next` only if the state is still `from`.
    pub fn transition_from(&self, from: ConnectionState, next: ConnectionState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.to_u8(), next.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            self.announce(from, next, None);
        }
        swapped
    }

    /// Unconditional reset used by cleanup paths.
    pub fn force_state(&self, next: ConnectionState, reason: Option<String>) {
        let previous = ConnectionState::from_u8(self.state.swap(next.to_u8(), Ordering::SeqCst));
        if previous != next {
            self.announce(previous, next, reason);
        }
    }

    /// Unexpected loss of an open socket: `Error`, fail waiters, `Disconnected`.
    ///
    /// No-op if the owner is already closing, so an intentional disconnect
    /// never reports a loss.
    pub async fn lose(&self, reason: String) {
        let mut raw = self.state.load(Ordering::SeqCst);
        let previous = loop {
            let current = ConnectionState::from_u8(raw);
            if !current.is_open() {
                return;
            }
            match self.state.compare_exchange(
                raw,
                ConnectionState::Error.to_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break current,
                Err(actual) => raw = actual,
            }
        };

        tracing::warn!(connection_id = %self.id, "Connection lost: {}", reason);
        self.announce(previous, ConnectionState::Error, Some(reason.clone()));

        let failed = self
            .pending
            .lock()
            .await
            .fail_all(|| ClientError::lost(reason.clone()));
        if failed > 0 {
            tracing::debug!(connection_id = %self.id, "Failed {} pending requests", failed);
        }
        self.subscriptions.write().await.clear();

        self.transition_from(ConnectionState::Error, ConnectionState::Disconnected);
    }
}

// ============================================================================
// Session
// ============================================================================

pub(crate) enum Outbound {
    Frame {
        payload: WirePayload,
        ack: oneshot::Sender<Result<(), ClientError>>,
    },
    Ping,
    Close {
        code: u16,
    },
}

/// Live socket plus its tasks. Dropping it stops the tasks.
pub(crate) struct Session {
    pub outbound: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,
    pub reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Everything the reader needs besides the stream.
pub(crate) struct ReaderContext {
    pub shared: Arc<Shared>,
    pub protocol: WireProtocol,
    pub serializer: Serializer,
    pub pipeline: DataPipeline,
    pub credentials: Arc<dyn CredentialStore>,
    pub credential_key: String,
}

pub(crate) struct SessionTimings {
    pub outbound_buffer: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Session {
    pub fn spawn(
        ctx: ReaderContext,
        sink: Box<dyn TransportSink>,
        stream: Box<dyn TransportStream>,
        timings: SessionTimings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (outbound, rx) = mpsc::channel(timings.outbound_buffer.max(1));
        let shared = Arc::clone(&ctx.shared);
        shared.touch();

        let writer = tokio::spawn(run_writer(Arc::clone(&shared), sink, rx, cancel.clone()));
        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&shared),
            outbound.clone(),
            timings.heartbeat_interval,
            timings.heartbeat_timeout,
            cancel.clone(),
        ));
        let reader = tokio::spawn(run_reader(ctx, stream, cancel.clone()));

        Self {
            outbound,
            cancel,
            reader,
            writer,
            heartbeat,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.writer.abort();
        self.heartbeat.abort();
        self.reader.abort();
    }
}

// ============================================================================
// Writer
// ============================================================================

async fn run_writer(
    shared: Arc<Shared>,
    mut sink: Box<dyn TransportSink>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(outbound) = next else { break };

        match outbound {
            Outbound::Frame { payload, ack } => {
                let result = match payload {
                    WirePayload::Text(text) => sink.send_text(text).await,
                    WirePayload::Binary(bytes) => sink.send_binary(bytes).await,
                };
                match result {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = ack.send(Err(ClientError::lost(e.to_string())));
                        shared.lose(format!("write failed: {e}")).await;
                        cancel.cancel();
                        break;
                    }
                }
            }
            Outbound::Ping => {
                if let Err(e) = sink.send_ping(Vec::new()).await {
                    shared.lose(format!("ping failed: {e}")).await;
                    cancel.cancel();
                    break;
                }
            }
            Outbound::Close { code } => {
                if let Err(e) = sink.close(code).await {
                    tracing::debug!(connection_id = %shared.id, "Close frame not sent: {}", e);
                }
                break;
            }
        }
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

async fn run_heartbeat(
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let idle = shared.idle_for();
                if idle > timeout {
                    shared.lose(format!("no traffic for {idle:?}")).await;
                    cancel.cancel();
                    break;
                }
                if outbound.send(Outbound::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

async fn run_reader(
    ctx: ReaderContext,
    mut stream: Box<dyn TransportStream>,
    cancel: CancellationToken,
) {
    let shared = Arc::clone(&ctx.shared);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(incoming)) => {
                shared.touch();
                match incoming {
                    Incoming::Text(text) if ctx.protocol.is_text() => {
                        ctx.handle(WirePayload::Text(text)).await;
                    }
                    Incoming::Binary(bytes) if !ctx.protocol.is_text() => {
                        ctx.handle(WirePayload::Binary(bytes)).await;
                    }
                    Incoming::Text(_) | Incoming::Binary(_) => {
                        tracing::warn!(
                            connection_id = %shared.id,
                            protocol = %ctx.protocol,
                            "Dropping frame of the wrong type"
                        );
                    }
                    Incoming::Ping(_) | Incoming::Pong(_) => {}
                    Incoming::Close(code) => {
                        if shared.state() == ConnectionState::Closing {
                            tracing::debug!(connection_id = %shared.id, "Close acknowledged");
                        } else {
                            shared
                                .lose(format!("server closed the connection (code {code:?})"))
                                .await;
                        }
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                shared.lose(format!("read failed: {e}")).await;
                break;
            }
            None => {
                shared.lose("stream ended".to_string()).await;
                break;
            }
        }
    }
    cancel.cancel();
}

impl ReaderContext {
    async fn handle(&self, payload: WirePayload) {
        let message = match self.serializer.decode_server(&payload) {
            Ok(message) => message,
            Err(e) if e.is_unknown_variant() => {
                tracing::warn!(
                    connection_id = %self.shared.id,
                    "Dropping envelope outside the protocol: {}",
                    e
                );
                return;
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.shared.id, "Undecodable frame: {}", e);
                return;
            }
        };

        tracing::debug!(connection_id = %self.shared.id, kind = message.kind(), "Received");
        match message {
            ServerMessage::IdentityToken(token) => {
                self.on_identity(token.identity, token.token).await;
            }
            ServerMessage::InitialSubscription(initial) => self.on_initial_subscription(initial).await,
            ServerMessage::TransactionUpdate(update) => self.on_transaction(update).await,
            ServerMessage::SubscriptionError(error) => self.on_subscription_error(error).await,
            ServerMessage::OneOffQueryResponse(response) => self.on_query_response(response).await,
        }
    }

    async fn on_identity(&self, identity: String, token: String) {
        *self.shared.identity.write().await = Some(identity.clone());

        let current = match self.credentials.load(&self.credential_key).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(key = %self.credential_key, "Cannot read credentials: {}", e);
                None
            }
        };
        if current.as_ref().map(|c| c.auth_token.as_str()) == Some(token.as_str()) {
            return;
        }

        let credentials = Credentials::new(identity, token);
        match self.credentials.store(&self.credential_key, &credentials).await {
            Ok(()) => tracing::info!(key = %self.credential_key, "Refreshed credentials"),
            Err(e) => tracing::warn!(key = %self.credential_key, "Cannot store credentials: {}", e),
        }
    }

    async fn on_initial_subscription(&self, initial: InitialSubscription) {
        let pending = self
            .shared
            .pending
            .lock()
            .await
            .take_subscribe(Some(initial.request_id));
        if pending.is_none() && initial.request_id != 0 {
            tracing::debug!(
                connection_id = %self.shared.id,
                request_id = initial.request_id,
                "Ignoring subscription reply with no waiting request"
            );
            return;
        }

        {
            let mut subscriptions = self.shared.subscriptions.write().await;
            match &pending {
                Some(pending) => subscriptions.extend(pending.tables.iter().cloned()),
                None => subscriptions.extend(
                    initial
                        .database_update
                        .tables
                        .iter()
                        .map(|t| t.table_name.clone()),
                ),
            }
        }
        self.shared
            .transition_from(ConnectionState::Connected, ConnectionState::Subscribed);

        tracing::info!(
            connection_id = %self.shared.id,
            tables = initial.database_update.tables.len(),
            "Subscription applied"
        );
        self.publish_update(&initial.database_update);

        if let Some(pending) = pending {
            let _ = pending.reply.send(Ok(()));
        }
    }

    async fn on_transaction(&self, update: TransactionUpdate) {
        let outcome = match &update.status {
            UpdateStatus::Committed(database_update) => {
                self.publish_update(database_update);
                ReducerOutcome::Committed
            }
            UpdateStatus::Failed(reason) => ReducerOutcome::Failed(reason.clone()),
            UpdateStatus::OutOfEnergy => ReducerOutcome::OutOfEnergy,
        };

        if !self.is_own_call(&update.caller_identity).await {
            return;
        }
        let request_id = update.reducer_call.request_id;
        if self
            .shared
            .pending
            .lock()
            .await
            .resolve_reducer(request_id, outcome)
        {
            tracing::debug!(
                connection_id = %self.shared.id,
                reducer = %update.reducer_call.reducer_name,
                request_id,
                "Reducer settled"
            );
        }
    }

    async fn is_own_call(&self, caller: &str) -> bool {
        if caller.is_empty() {
            return true;
        }
        match self.shared.identity.read().await.as_deref() {
            Some(own) => own == caller,
            None => true,
        }
    }

    async fn on_subscription_error(&self, error: SubscriptionError) {
        let pending = self.shared.pending.lock().await.take_subscribe(error.request_id);
        match pending {
            Some(pending) => {
                tracing::warn!(connection_id = %self.shared.id, "Subscription rejected: {}", error.error);
                let _ = pending.reply.send(Err(ClientError::Rejected {
                    operation: "subscribe",
                    reason: error.error,
                }));
            }
            None => {
                tracing::error!(
                    connection_id = %self.shared.id,
                    table_id = ?error.table_id,
                    "Subscription error: {}",
                    error.error
                );
            }
        }
    }

    async fn on_query_response(&self, response: OneOffQueryResponse) {
        let result = match response.error {
            Some(reason) => Err(ClientError::Rejected {
                operation: "one-off query",
                reason,
            }),
            None => Ok(response
                .tables
                .into_iter()
                .map(|table| {
                    let kind = EntityKind::from_table_name(&table.table_name);
                    QueryTable {
                        rows: table
                            .rows
                            .iter()
                            .map(|row| self.pipeline.adapt_inbound(row, kind))
                            .collect(),
                        table: table.table_name,
                    }
                })
                .collect()),
        };

        if !self
            .shared
            .pending
            .lock()
            .await
            .resolve_query(&response.message_id, result)
        {
            tracing::debug!(
                connection_id = %self.shared.id,
                message_id = %response.message_id,
                "Query response without a waiter"
            );
        }
    }

    fn publish_update(&self, update: &DatabaseUpdate) {
        for table in &update.tables {
            for payload in table_events(table, &self.pipeline) {
                self.shared.publish(payload);
            }
        }
    }
}

/// Canonical row events for one table update. A delete and an insert sharing
/// a primary key become a single `TableUpdate`.
pub(crate) fn table_events(table: &TableUpdate, pipeline: &DataPipeline) -> Vec<EventPayload> {
    let kind = EntityKind::from_table_name(&table.table_name);
    let canonical = |row: &Value| pipeline.adapt_inbound(row, kind);
    let key_of = |row: &Value| -> Option<String> {
        kind.primary_key()
            .and_then(|pk| row.get(pk))
            .map(Value::to_string)
    };

    let mut deletes: Vec<Option<Value>> = table.deletes.iter().map(|r| Some(canonical(r))).collect();
    let mut delete_index: HashMap<String, usize> = HashMap::new();
    for (i, row) in deletes.iter().enumerate() {
        if let Some(key) = row.as_ref().and_then(key_of) {
            delete_index.entry(key).or_insert(i);
        }
    }

    let mut changes = Vec::new();
    for row in &table.inserts {
        let new = canonical(row);
        let old = key_of(&new)
            .and_then(|key| delete_index.remove(&key))
            .and_then(|i| deletes[i].take());

        changes.push(match old {
            Some(old) => EventPayload::TableUpdate(RowUpdate {
                table: table.table_name.clone(),
                kind,
                old,
                new,
            }),
            None => EventPayload::TableInsert(RowEvent {
                table: table.table_name.clone(),
                kind,
                row: new,
            }),
        });
    }

    let mut events: Vec<EventPayload> = deletes
        .into_iter()
        .flatten()
        .map(|row| {
            EventPayload::TableDelete(RowEvent {
                table: table.table_name.clone(),
                kind,
                row,
            })
        })
        .collect();
    events.extend(changes);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfiguration;
    use serde_json::json;
    use spacelink_domain::{SerializationFormat, ServerLanguage};

    #[test]
    fn delete_and_insert_with_same_key_coalesce() {
        let pipeline = DataPipeline::new(PipelineConfiguration::new(
            ServerLanguage::CSharp,
            SerializationFormat::Json,
        ));
        let table = TableUpdate {
            table_id: 1,
            table_name: "circle".into(),
            num_rows: 3,
            deletes: vec![json!({"EntityId": 1, "Speed": 1.0}), json!({"EntityId": 2})],
            inserts: vec![json!({"EntityId": 1, "Speed": 2.0}), json!({"EntityId": 3})],
        };

        let events = table_events(&table, &pipeline);

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], EventPayload::TableDelete(row) if row.row["entity_id"] == 2));
        match &events[1] {
            EventPayload::TableUpdate(update) => {
                assert_eq!(update.old["speed"], 1.0);
                assert_eq!(update.new["speed"], 2.0);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert!(matches!(&events[2], EventPayload::TableInsert(row) if row.row["entity_id"] == 3));
    }

    #[test]
    fn generic_tables_never_coalesce() {
        let pipeline = DataPipeline::new(PipelineConfiguration::new(
            ServerLanguage::Rust,
            SerializationFormat::Json,
        ));
        let table = TableUpdate {
            table_id: 1,
            table_name: "leaderboard".into(),
            num_rows: 2,
            deletes: vec![json!({"id": 1})],
            inserts: vec![json!({"id": 1})],
        };

        let events = table_events(&table, &pipeline);
        assert!(matches!(events[0], EventPayload::TableDelete(_)));
        assert!(matches!(events[1], EventPayload::TableInsert(_)));
    }
}
