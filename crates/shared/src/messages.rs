//! WebSocket envelope types.
//!
//! Both enums are closed: the server rejects any envelope kind it does not
//! define, so the client never invents one. There is deliberately no
//! `Heartbeat` or `Close` variant; liveness and shutdown live in the
//! transport (ping/pong and the close handshake).
//!
//! JSON uses serde's externally tagged form: `{"Subscribe": {...}}`. There is
//! no `type` discriminator field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Client Messages (client → server)
// =============================================================================

/// Messages from the client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Replace the subscribed query set
    Subscribe(Subscribe),
    /// Invoke a reducer
    CallReducer(CallReducer),
    /// Run a query once without subscribing
    OneOffQuery(OneOffQuery),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe(_) => "Subscribe",
            ClientMessage::CallReducer(_) => "CallReducer",
            ClientMessage::OneOffQuery(_) => "OneOffQuery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    /// Full desired query set; a new subscription replaces the previous one
    pub query_strings: Vec<String>,
    pub request_id: u32,
}

impl Subscribe {
    /// Build a subscription selecting every row of each table
    pub fn for_tables<'a>(tables: impl IntoIterator<Item = &'a str>, request_id: u32) -> Self {
        Self {
            query_strings: tables.into_iter().map(table_query).collect(),
            request_id,
        }
    }
}

/// `SELECT * FROM {table}`
pub fn table_query(table: &str) -> String {
    format!("SELECT * FROM {table}")
}

/// Recover the table name from a query built by [`table_query`].
pub fn table_from_query(query: &str) -> Option<&str> {
    let rest = query.trim().strip_prefix("SELECT * FROM ")?;
    let table = rest.split_whitespace().next()?;
    Some(table)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReducer {
    pub reducer: String,
    /// Arguments, already adapted to the server's conventions
    pub args: Value,
    pub request_id: u32,
    /// 0 = full update, 1 = no success notification
    #[serde(default)]
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOffQuery {
    pub message_id: String,
    pub query_string: String,
}

// =============================================================================
// Server Messages (server → client)
// =============================================================================

/// Messages from the server to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Identity and token assigned to this connection
    IdentityToken(IdentityToken),
    /// Snapshot of every subscribed table; acknowledges a `Subscribe`
    InitialSubscription(InitialSubscription),
    /// Result of a reducer call, carrying the rows it changed
    TransactionUpdate(TransactionUpdate),
    /// A `Subscribe` was rejected
    SubscriptionError(SubscriptionError),
    OneOffQueryResponse(OneOffQueryResponse),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::IdentityToken(_) => "IdentityToken",
            ServerMessage::InitialSubscription(_) => "InitialSubscription",
            ServerMessage::TransactionUpdate(_) => "TransactionUpdate",
            ServerMessage::SubscriptionError(_) => "SubscriptionError",
            ServerMessage::OneOffQueryResponse(_) => "OneOffQueryResponse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityToken {
    pub identity: String,
    pub token: String,
    #[serde(default)]
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSubscription {
    pub database_update: DatabaseUpdate,
    pub request_id: u32,
    #[serde(default)]
    pub total_host_execution_duration_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatabaseUpdate {
    pub tables: Vec<TableUpdate>,
}

/// Rows changed in one table. Rows are in the server's native conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableUpdate {
    pub table_id: u32,
    pub table_name: String,
    #[serde(default)]
    pub num_rows: u64,
    #[serde(default)]
    pub deletes: Vec<Value>,
    #[serde(default)]
    pub inserts: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub status: UpdateStatus,
    /// Unix micros
    pub timestamp: i64,
    pub caller_identity: String,
    pub reducer_call: ReducerCallInfo,
    #[serde(default)]
    pub energy_quanta_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateStatus {
    Committed(DatabaseUpdate),
    Failed(String),
    OutOfEnergy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerCallInfo {
    pub reducer_name: String,
    #[serde(default)]
    pub reducer_id: u32,
    #[serde(default)]
    pub args: Value,
    pub request_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionError {
    #[serde(default)]
    pub request_id: Option<u32>,
    #[serde(default)]
    pub table_id: Option<u32>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOffQueryResponse {
    pub message_id: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tables: Vec<OneOffTable>,
    #[serde(default)]
    pub total_host_execution_duration_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOffTable {
    pub table_name: String,
    pub rows: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_has_no_type_field() {
        let msg = ClientMessage::Subscribe(Subscribe::for_tables(["player", "circle"], 7));
        let value = serde_json::to_value(&msg).unwrap();

        assert!(value.get("type").is_none());
        assert_eq!(
            value,
            json!({"Subscribe": {
                "query_strings": ["SELECT * FROM player", "SELECT * FROM circle"],
                "request_id": 7
            }})
        );
    }

    #[test]
    fn invented_envelope_kinds_are_rejected() {
        let result: Result<ClientMessage, _> = serde_json::from_value(json!({"Heartbeat": {}}));
        assert!(result.is_err());

        let result: Result<ServerMessage, _> =
            serde_json::from_value(json!({"type": "heartbeat"}));
        assert!(result.is_err());
    }

    #[test]
    fn transaction_status_uses_tagged_variants() {
        let raw = json!({"TransactionUpdate": {
            "status": "OutOfEnergy",
            "timestamp": 1,
            "caller_identity": "abc",
            "reducer_call": {"reducer_name": "split", "request_id": 4}
        }});
        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ServerMessage::TransactionUpdate(update) => {
                assert_eq!(update.status, UpdateStatus::OutOfEnergy);
                assert_eq!(update.reducer_call.request_id, 4);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn table_name_recovers_from_query() {
        assert_eq!(table_from_query(&table_query("food")), Some("food"));
        assert_eq!(table_from_query("DELETE FROM food"), None);
    }
}
