//! Spacelink domain vocabulary.
//!
//! Pure types shared by the wire protocol and the client runtime: which server
//! we talk to and how ([`ServerConfig`]), where a connection is in its
//! lifecycle ([`ConnectionState`]), what it authenticated as
//! ([`Credentials`]), and the canonical game entities that every server
//! implementation must be able to round-trip.

pub mod connection_state;
pub mod credentials;
pub mod entities;
pub mod error;
pub mod ids;
pub mod server;

pub use connection_state::ConnectionState;
pub use credentials::Credentials;
pub use entities::{
    CanonicalEntity, Circle, EntityKind, Food, GameEntity, Player, PlayerStatus, Vector2,
    WorldConfig,
};
pub use error::DomainError;
pub use ids::{ConnectionId, EventId};
pub use server::{PoolKey, SerializationFormat, ServerConfig, ServerLanguage, WireProtocol};
