//! Spacelink wire protocol.
//!
//! This crate contains everything that touches bytes on the wire but not the
//! socket itself:
//! - Envelope types ([`ClientMessage`], [`ServerMessage`])
//! - The [`Serializer`] for JSON text and binary tuple payloads
//! - One [`ProtocolAdapter`] per server language
//!
//! # Design Principles
//!
//! 1. **Closed envelope set** - no variant exists that the server does not define
//! 2. **No I/O** - pure data types and transforms
//! 3. **Language-independent serializer** - naming conventions belong to adapters

pub mod adapter;
pub mod casing;
pub mod codec;
pub mod error;
pub mod messages;
pub mod serializer;

pub use adapter::{
    adapter_for, CSharpAdapter, GoAdapter, ProtocolAdapter, RustAdapter, TypeScriptAdapter,
    CREATED_AT,
};
pub use error::ProtocolError;
pub use messages::{
    table_from_query, table_query, CallReducer, ClientMessage, DatabaseUpdate, IdentityToken,
    InitialSubscription, OneOffQuery, OneOffQueryResponse, OneOffTable, ReducerCallInfo,
    ServerMessage, Subscribe, SubscriptionError, TableUpdate, TransactionUpdate, UpdateStatus,
};
pub use serializer::{Serializer, WirePayload};
