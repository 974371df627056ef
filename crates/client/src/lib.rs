//! Spacelink client runtime.
//!
//! Connects to game servers over WebSocket, keeps each [`Connection`] in a
//! valid lifecycle state, pools connections per server and database, and
//! turns server pushes into typed [`ClientEvent`]s.
//!
//! Typical use goes through [`ConnectionPool`]:
//!
//! ```no_run
//! # async fn run() -> Result<(), spacelink_client::ClientError> {
//! use std::sync::Arc;
//! use spacelink_client::{
//!     ConnectionOptions, ConnectionPool, DefaultConnectionFactory, MemoryCredentialStore,
//!     PoolSettings, TungsteniteConnector,
//! };
//! use spacelink_domain::{ServerConfig, ServerLanguage};
//!
//! let factory = DefaultConnectionFactory::new(
//!     Arc::new(TungsteniteConnector),
//!     Arc::new(MemoryCredentialStore::new()),
//!     ConnectionOptions::default(),
//! );
//! let pool = ConnectionPool::new(PoolSettings::default(), Arc::new(factory))?;
//! let key = pool.register(ServerConfig::new(ServerLanguage::Rust, "localhost", 3000, "arena"))?;
//!
//! let conn = pool.acquire(&key).await?;
//! conn.subscribe(["players", "entities"]).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod pool;
pub mod settings;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use connection::{
    wait_for_state, Connection, ConnectionOptions, QueryTable, ReducerOutcome, SubscriptionSet,
};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::ClientError;
pub use events::{
    ClientEvent, DispatcherMetrics, EventDispatcher, EventKind, EventPayload, EventPriority,
    EventSubscriber, RowEvent, RowUpdate, SubscriptionHandle,
};
pub use pipeline::{BatchOutcome, DataPipeline, ItemError, PipelineConfiguration, PipelineMetrics};
pub use pool::{
    CircuitState, ConnectionFactory, ConnectionPool, DefaultConnectionFactory, KeyMetrics,
    PoolMetrics, PooledConnection,
};
pub use settings::{
    BreakerSettings, ClientSettings, ConnectionSettings, PipelineSettings, PoolSettings,
    RetrySettings,
};
pub use transport::TungsteniteConnector;
