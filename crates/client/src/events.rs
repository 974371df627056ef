//! In-process event dispatch.
//!
//! Connections publish lifecycle and table events into an [`EventDispatcher`];
//! a single worker task drains a priority queue and hands each event to the
//! subscribers registered for its [`EventKind`]. Within a priority, events are
//! delivered in publish order. A failing or panicking subscriber is logged
//! and skipped; it never stops delivery to others or blocks the publisher.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use spacelink_domain::{ConnectionId, ConnectionState, EntityKind, EventId};
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::ClientError;

// ============================================================================
// Event Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum EventPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    ConnectionLifecycle,
    TableInsert,
    TableUpdate,
    TableDelete,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::ConnectionLifecycle,
        EventKind::TableInsert,
        EventKind::TableUpdate,
        EventKind::TableDelete,
    ];

    pub const TABLE: [EventKind; 3] = [
        EventKind::TableInsert,
        EventKind::TableUpdate,
        EventKind::TableDelete,
    ];
}

/// A single canonical row from a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowEvent {
    pub table: String,
    pub kind: EntityKind,
    pub row: Value,
}

impl RowEvent {
    /// Typed view of the row
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, ClientError> {
        Ok(serde_json::from_value(self.row.clone())?)
    }
}

/// A row replaced within one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowUpdate {
    pub table: String,
    pub kind: EntityKind,
    pub old: Value,
    pub new: Value,
}

impl RowUpdate {
    pub fn decode_old<E: DeserializeOwned>(&self) -> Result<E, ClientError> {
        Ok(serde_json::from_value(self.old.clone())?)
    }

    pub fn decode_new<E: DeserializeOwned>(&self) -> Result<E, ClientError> {
        Ok(serde_json::from_value(self.new.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventPayload {
    ConnectionLifecycle {
        previous: ConnectionState,
        current: ConnectionState,
        reason: Option<String>,
    },
    TableInsert(RowEvent),
    TableUpdate(RowUpdate),
    TableDelete(RowEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ConnectionLifecycle { .. } => EventKind::ConnectionLifecycle,
            EventPayload::TableInsert(_) => EventKind::TableInsert,
            EventPayload::TableUpdate(_) => EventKind::TableUpdate,
            EventPayload::TableDelete(_) => EventKind::TableDelete,
        }
    }
}

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEvent {
    pub id: EventId,
    pub source: ConnectionId,
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl ClientEvent {
    pub fn new(source: ConnectionId, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            source,
            priority: EventPriority::Normal,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Lifecycle change; transitions into `Error` are high priority.
    pub fn lifecycle(
        source: ConnectionId,
        previous: ConnectionState,
        current: ConnectionState,
        reason: Option<String>,
    ) -> Self {
        let priority = if current == ConnectionState::Error {
            EventPriority::High
        } else {
            EventPriority::Normal
        };
        Self::new(
            source,
            EventPayload::ConnectionLifecycle {
                previous,
                current,
                reason,
            },
        )
        .with_priority(priority)
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// ============================================================================
// Subscribers
// ============================================================================

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &ClientEvent) -> anyhow::Result<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        "subscriber"
    }
}

struct FnSubscriber<F> {
    name: String,
    f: F,
}

impl<F> EventSubscriber for FnSubscriber<F>
where
    F: Fn(&ClientEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &ClientEvent) -> anyhow::Result<()> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Registration {
    kinds: Vec<EventKind>,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Removes its subscription when dropped.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    id: u64,
    inner: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.remove(&self.id);
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct Queued {
    priority: EventPriority,
    seq: u64,
    event: ClientEvent,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherMetrics {
    pub published: u64,
    pub delivered: u64,
    pub failures: u64,
    pub pending: u64,
    pub subscribers: usize,
}

struct Inner {
    queue: Mutex<BinaryHeap<Queued>>,
    wake: Notify,
    drained: Notify,
    subscribers: DashMap<u64, Registration>,
    next_seq: AtomicU64,
    next_subscriber: AtomicU64,
    pending: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl Inner {
    fn pop(&self) -> Option<Queued> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn deliver(&self, event: &ClientEvent) {
        let kind = event.kind();
        let mut targets: Vec<(u64, Arc<dyn EventSubscriber>)> = self
            .subscribers
            .iter()
            .filter(|entry| entry.kinds.contains(&kind))
            .map(|entry| (*entry.key(), Arc::clone(&entry.subscriber)))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        for (_, subscriber) in targets {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event))) {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        event_id = %event.id,
                        "Event subscriber failed: {:#}",
                        e
                    );
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        subscriber = subscriber.name(),
                        event_id = %event.id,
                        "Event subscriber panicked"
                    );
                }
            }
        }
    }
}

/// Cloneable handle; the worker stops when the last clone is dropped.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
    _shutdown: Arc<DropGuard>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl EventDispatcher {
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            drained: Notify::new(),
            subscribers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            next_subscriber: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(run_worker(Arc::clone(&inner), shutdown.clone()));

        Self {
            inner,
            _shutdown: Arc::new(shutdown.drop_guard()),
        }
    }

    pub fn subscribe(
        &self,
        kinds: &[EventKind],
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionHandle {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.insert(
            id,
            Registration {
                kinds: kinds.to_vec(),
                subscriber,
            },
        );
        SubscriptionHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscribe_fn<F>(&self, name: &str, kinds: &[EventKind], f: F) -> SubscriptionHandle
    where
        F: Fn(&ClientEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(
            kinds,
            Arc::new(FnSubscriber {
                name: name.to_string(),
                f,
            }),
        )
    }

    /// Queue an event. Never blocks on subscribers.
    pub fn publish(&self, event: ClientEvent) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Queued {
                priority: event.priority,
                seq,
                event,
            });
        self.inner.wake.notify_one();
    }

    /// Wait until every queued event has been delivered.
    pub async fn flush(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        DispatcherMetrics {
            published: self.inner.next_seq.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            pending: self.inner.pending.load(Ordering::Relaxed),
            subscribers: self.inner.subscribers.len(),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(inner: Arc<Inner>, shutdown: CancellationToken) {
    loop {
        match inner.pop() {
            Some(queued) => {
                inner.deliver(&queued.event);
                if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    inner.drained.notify_waiters();
                }
            }
            None => {
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }
    tracing::debug!("Event dispatcher stopped");
}
