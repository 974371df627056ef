//! Data pipeline: validation, protocol adaptation and serialization as one
//! configured unit.
//!
//! Outbound: validate → adapt to server → serialize.
//! Inbound: deserialize → adapt from server → validate.
//!
//! Batches never fail as a whole. Every item is processed independently and
//! the outcome lists successes and itemized failures separately.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spacelink_domain::{CanonicalEntity, EntityKind, SerializationFormat, ServerConfig, ServerLanguage};
use spacelink_shared::{adapter_for, ProtocolAdapter, Serializer, WirePayload};
use tokio::task::JoinSet;
use validator::Validate;

use crate::error::ClientError;
use crate::settings::PipelineSettings;

/// Immutable pipeline behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    pub language: ServerLanguage,
    pub format: SerializationFormat,
    pub enable_validation: bool,
    pub enable_protocol_adaptation: bool,
    /// Gzip binary payloads; ignored for JSON
    pub enable_compression: bool,
    /// Deadline for a concurrent batch
    pub timeout_ms: u64,
}

impl PipelineConfiguration {
    pub fn new(language: ServerLanguage, format: SerializationFormat) -> Self {
        Self::from_settings(language, format, &PipelineSettings::default())
    }

    pub fn from_settings(
        language: ServerLanguage,
        format: SerializationFormat,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            language,
            format,
            enable_validation: settings.enable_validation,
            enable_protocol_adaptation: settings.enable_protocol_adaptation,
            enable_compression: settings.enable_compression,
            timeout_ms: settings.timeout_ms,
        }
    }

    /// Language and format taken from the server, switches from `settings`
    pub fn for_server(config: &ServerConfig, settings: &PipelineSettings) -> Self {
        Self::from_settings(config.language(), config.format(), settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Batch Outcome
// ============================================================================

/// Failure of one batch item.
#[derive(Debug)]
pub struct ItemError {
    pub index: usize,
    pub error: ClientError,
}

/// Result of a batch: successes and failures keyed by input position.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub successes: Vec<(usize, T)>,
    pub failures: Vec<ItemError>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    fn push(&mut self, index: usize, result: Result<T, ClientError>) {
        match result {
            Ok(value) => self.successes.push((index, value)),
            Err(error) => self.failures.push(ItemError { index, error }),
        }
    }

    fn sort(&mut self) {
        self.successes.sort_by_key(|(i, _)| *i);
        self.failures.sort_by_key(|e| e.index);
    }

    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful values in input order
    pub fn into_values(self) -> Vec<T> {
        self.successes.into_iter().map(|(_, v)| v).collect()
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    latency_micros: AtomicU64,
}

/// Point-in-time pipeline statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub total_processed: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub average_latency: Duration,
}

// ============================================================================
// Pipeline
// ============================================================================

struct Inner {
    config: PipelineConfiguration,
    adapter: &'static dyn ProtocolAdapter,
    serializer: Serializer,
    counters: Counters,
    compression_warned: AtomicBool,
}

/// Cheaply cloneable handle; clones share metrics.
#[derive(Clone)]
pub struct DataPipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPipeline")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl DataPipeline {
    pub fn new(config: PipelineConfiguration) -> Self {
        let serializer = Serializer::new(config.format).with_compression(config.enable_compression);
        Self {
            inner: Arc::new(Inner {
                adapter: adapter_for(config.language),
                serializer,
                config,
                counters: Counters::default(),
                compression_warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfiguration {
        &self.inner.config
    }

    pub fn serializer(&self) -> Serializer {
        self.warn_compression_once();
        self.inner.serializer
    }

    pub fn adapter(&self) -> &'static dyn ProtocolAdapter {
        self.inner.adapter
    }

    fn warn_compression_once(&self) {
        let config = &self.inner.config;
        if config.enable_compression
            && config.format == SerializationFormat::Json
            && !self.inner.compression_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                language = %config.language,
                "Compression requested for a JSON pipeline; sending plain text"
            );
        }
    }

    fn record<T>(&self, started: Instant, result: &Result<T, ClientError>) {
        let counters = &self.inner.counters;
        counters.processed.fetch_add(1, Ordering::Relaxed);
        counters
            .latency_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if result.is_err() {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------------
    // Value-level stages
    // ------------------------------------------------------------------------

    /// Canonical value → server-native value.
    pub fn adapt_outbound(&self, canonical: &Value, kind: EntityKind) -> Value {
        if self.inner.config.enable_protocol_adaptation {
            self.inner.adapter.adapt_to_server(canonical, kind)
        } else {
            canonical.clone()
        }
    }

    /// Server-native value → canonical value.
    pub fn adapt_inbound(&self, native: &Value, kind: EntityKind) -> Value {
        if self.inner.config.enable_protocol_adaptation {
            self.inner.adapter.adapt_from_server(native, kind)
        } else {
            native.clone()
        }
    }

    fn validate<E: CanonicalEntity>(&self, entity: &E) -> Result<(), ClientError> {
        if self.inner.config.enable_validation {
            entity.validate()?;
        }
        Ok(())
    }

    fn to_native<E: CanonicalEntity>(&self, entity: &E) -> Result<Value, ClientError> {
        self.validate(entity)?;
        let canonical = serde_json::to_value(entity)?;
        Ok(self.adapt_outbound(&canonical, E::KIND))
    }

    fn from_native<E: CanonicalEntity>(&self, native: &Value) -> Result<E, ClientError> {
        let canonical = self.adapt_inbound(native, E::KIND);
        let entity: E = serde_json::from_value(canonical)?;
        self.validate(&entity)?;
        Ok(entity)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    pub fn process_outbound<E: CanonicalEntity>(&self, entity: &E) -> Result<WirePayload, ClientError> {
        let started = Instant::now();
        let result = self
            .to_native(entity)
            .and_then(|native| Ok(self.serializer().encode_value(&native)?));
        self.record(started, &result);
        result
    }

    /// Encode each item as its own payload.
    pub fn process_outbound_batch<E: CanonicalEntity>(&self, items: &[E]) -> BatchOutcome<WirePayload> {
        let mut outcome = BatchOutcome::default();
        for (index, item) in items.iter().enumerate() {
            outcome.push(index, self.process_outbound(item));
        }
        outcome
    }

    /// Encode items on the blocking pool. Items still running when the
    /// configured timeout elapses are reported as timeouts, and an item whose
    /// encoding panics is reported as [`ClientError::Panicked`].
    pub async fn process_outbound_concurrent<E: CanonicalEntity>(
        &self,
        items: Vec<E>,
    ) -> BatchOutcome<WirePayload> {
        let total = items.len();
        let mut tasks = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let pipeline = self.clone();
            tasks.spawn_blocking(move || {
                let result = catch_unwind(AssertUnwindSafe(|| pipeline.process_outbound(&item)))
                    .unwrap_or_else(|panic| {
                        Err(ClientError::panicked("pipeline item", panic.as_ref()))
                    });
                (index, result)
            });
        }

        let timeout = self.inner.config.timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut outcome = BatchOutcome::default();
        let mut finished = vec![false; total];

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, result)))) => {
                    finished[index] = true;
                    outcome.push(index, result);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!("Pipeline task failed: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        pending = tasks.len(),
                        "Pipeline batch deadline elapsed after {:?}",
                        timeout
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        for (index, done) in finished.into_iter().enumerate() {
            if !done {
                outcome.push(index, Err(ClientError::timeout("pipeline batch", timeout)));
            }
        }
        outcome.sort();
        outcome
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub fn process_inbound<E: CanonicalEntity>(&self, payload: &WirePayload) -> Result<E, ClientError> {
        let started = Instant::now();
        let result = self
            .inner
            .serializer
            .decode_value(payload)
            .map_err(ClientError::from)
            .and_then(|native| self.from_native(&native));
        self.record(started, &result);
        result
    }

    /// Decode a payload holding an array of rows, item by item.
    pub fn process_inbound_batch<E: CanonicalEntity>(
        &self,
        payload: &WirePayload,
    ) -> Result<BatchOutcome<E>, ClientError> {
        let value = self.inner.serializer.decode_value(payload)?;
        let Value::Array(rows) = value else {
            return Err(ClientError::Serialization(
                "expected an array of rows".to_string(),
            ));
        };
        Ok(self.decode_rows(&rows))
    }

    /// Typed decode of server-native rows, e.g. from a table event.
    pub fn decode_rows<E: CanonicalEntity>(&self, rows: &[Value]) -> BatchOutcome<E> {
        let mut outcome = BatchOutcome::default();
        for (index, row) in rows.iter().enumerate() {
            let started = Instant::now();
            let result = self.from_native(row);
            self.record(started, &result);
            outcome.push(index, result);
        }
        outcome
    }

    // ------------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------------

    pub fn metrics(&self) -> PipelineMetrics {
        let counters = &self.inner.counters;
        let processed = counters.processed.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        let latency = counters.latency_micros.load(Ordering::Relaxed);

        PipelineMetrics {
            total_processed: processed,
            total_failed: failed,
            success_rate: if processed == 0 {
                1.0
            } else {
                (processed - failed) as f64 / processed as f64
            },
            average_latency: if processed == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(latency / processed)
            },
        }
    }
}
