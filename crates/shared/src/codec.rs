//! Binary tuple codec.
//!
//! # Layout
//!
//! Little-endian throughout. An envelope is a variant tag byte followed by
//! its fields in declaration order. Strings and sequences carry a `u32`
//! length prefix. Options are a `0`/`1` byte followed by the value when
//! present.
//!
//! Row and argument values are dynamic, so they use a self-describing
//! tagged encoding:
//!
//! ```text
//! 0 null | 1 bool(u8) | 2 i64 | 3 u64 | 4 f64 | 5 string
//! 6 array(u32 count, values...) | 7 object(u32 count, (string, value)...)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde_json::{Map, Number, Value};

use crate::error::ProtocolError;
use crate::messages::{
    CallReducer, ClientMessage, DatabaseUpdate, IdentityToken, InitialSubscription, OneOffQuery,
    OneOffQueryResponse, OneOffTable, ReducerCallInfo, ServerMessage, Subscribe,
    SubscriptionError, TableUpdate, TransactionUpdate, UpdateStatus,
};

const VALUE_NULL: u8 = 0;
const VALUE_BOOL: u8 = 1;
const VALUE_I64: u8 = 2;
const VALUE_U64: u8 = 3;
const VALUE_F64: u8 = 4;
const VALUE_STRING: u8 = 5;
const VALUE_ARRAY: u8 = 6;
const VALUE_OBJECT: u8 = 7;

/// Nesting limit for decoded values
const MAX_DEPTH: usize = 64;

// =============================================================================
// Writer
// =============================================================================

struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    fn u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    fn i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    fn len(&mut self, len: usize, field: &'static str) -> Result<(), ProtocolError> {
        let len = u32::try_from(len)
            .map_err(|_| ProtocolError::serialization(format!("{field} exceeds u32 length")))?;
        self.u32(len);
        Ok(())
    }

    fn str(&mut self, s: &str) -> Result<(), ProtocolError> {
        self.len(s.len(), "string")?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn opt_u32(&mut self, v: Option<u32>) {
        match v {
            Some(v) => {
                self.u8(1);
                self.u32(v);
            }
            None => self.u8(0),
        }
    }

    fn opt_str(&mut self, v: Option<&str>) -> Result<(), ProtocolError> {
        match v {
            Some(v) => {
                self.u8(1);
                self.str(v)
            }
            None => {
                self.u8(0);
                Ok(())
            }
        }
    }

    fn value(&mut self, value: &Value) -> Result<(), ProtocolError> {
        match value {
            Value::Null => self.u8(VALUE_NULL),
            Value::Bool(b) => {
                self.u8(VALUE_BOOL);
                self.u8(u8::from(*b));
            }
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    self.u8(VALUE_U64);
                    self.u64(u);
                } else if let Some(i) = n.as_i64() {
                    self.u8(VALUE_I64);
                    self.i64(i);
                } else if let Some(f) = n.as_f64() {
                    self.u8(VALUE_F64);
                    self.buf.put_f64_le(f);
                } else {
                    return Err(ProtocolError::serialization(format!(
                        "unrepresentable number {n}"
                    )));
                }
            }
            Value::String(s) => {
                self.u8(VALUE_STRING);
                self.str(s)?;
            }
            Value::Array(items) => {
                self.u8(VALUE_ARRAY);
                self.len(items.len(), "array")?;
                for item in items {
                    self.value(item)?;
                }
            }
            Value::Object(map) => {
                self.u8(VALUE_OBJECT);
                self.len(map.len(), "object")?;
                for (key, item) in map {
                    self.str(key)?;
                    self.value(item)?;
                }
            }
        }
        Ok(())
    }

    fn values(&mut self, values: &[Value]) -> Result<(), ProtocolError> {
        self.len(values.len(), "rows")?;
        for value in values {
            self.value(value)?;
        }
        Ok(())
    }

    fn database_update(&mut self, update: &DatabaseUpdate) -> Result<(), ProtocolError> {
        self.len(update.tables.len(), "tables")?;
        for table in &update.tables {
            self.u32(table.table_id);
            self.str(&table.table_name)?;
            self.u64(table.num_rows);
            self.values(&table.deletes)?;
            self.values(&table.inserts)?;
        }
        Ok(())
    }
}

// =============================================================================
// Reader
// =============================================================================

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, field: &'static str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated {
                field,
                needed: n - self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
        self.need(8, field)?;
        Ok(self.buf.get_i64_le())
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, ProtocolError> {
        self.need(8, field)?;
        Ok(self.buf.get_f64_le())
    }

    fn len(&mut self, field: &'static str) -> Result<usize, ProtocolError> {
        let len = self.u32(field)? as usize;
        // every element takes at least one byte
        self.need(len, field)?;
        Ok(len)
    }

    fn str(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.len(field)?;
        let bytes = &self.buf[..len];
        let s = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::deserialization(format!("{field}: {e}")))?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    fn opt_u32(&mut self, field: &'static str) -> Result<Option<u32>, ProtocolError> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => Ok(Some(self.u32(field)?)),
            tag => Err(ProtocolError::unknown_variant("option", tag)),
        }
    }

    fn opt_str(&mut self, field: &'static str) -> Result<Option<String>, ProtocolError> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => Ok(Some(self.str(field)?)),
            tag => Err(ProtocolError::unknown_variant("option", tag)),
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::deserialization("value nesting too deep"));
        }
        let tag = self.u8("value tag")?;
        let value = match tag {
            VALUE_NULL => Value::Null,
            VALUE_BOOL => Value::Bool(self.u8("bool")? != 0),
            VALUE_I64 => Value::from(self.i64("i64")?),
            VALUE_U64 => Value::from(self.u64("u64")?),
            VALUE_F64 => {
                let f = self.f64("f64")?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| ProtocolError::deserialization("non-finite float"))?
            }
            VALUE_STRING => Value::String(self.str("string")?),
            VALUE_ARRAY => {
                let len = self.len("array")?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.value(depth + 1)?);
                }
                Value::Array(items)
            }
            VALUE_OBJECT => {
                let len = self.len("object")?;
                let mut map = Map::new();
                for _ in 0..len {
                    let key = self.str("object key")?;
                    let item = self.value(depth + 1)?;
                    map.insert(key, item);
                }
                Value::Object(map)
            }
            other => return Err(ProtocolError::unknown_variant("value", other)),
        };
        Ok(value)
    }

    fn values(&mut self) -> Result<Vec<Value>, ProtocolError> {
        let len = self.len("rows")?;
        let mut rows = Vec::with_capacity(len);
        for _ in 0..len {
            rows.push(self.value(0)?);
        }
        Ok(rows)
    }

    fn database_update(&mut self) -> Result<DatabaseUpdate, ProtocolError> {
        let len = self.len("tables")?;
        let mut tables = Vec::with_capacity(len);
        for _ in 0..len {
            tables.push(TableUpdate {
                table_id: self.u32("table_id")?,
                table_name: self.str("table_name")?,
                num_rows: self.u64("num_rows")?,
                deletes: self.values()?,
                inserts: self.values()?,
            });
        }
        Ok(DatabaseUpdate { tables })
    }

    fn finish(self, context: &'static str) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::deserialization(format!(
                "{} trailing bytes after {context}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Values
// =============================================================================

pub fn encode_value(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut w = Writer::new();
    w.value(value)?;
    Ok(w.finish())
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, ProtocolError> {
    let mut r = Reader::new(bytes);
    let value = r.value(0)?;
    r.finish("value")?;
    Ok(value)
}

// =============================================================================
// Envelopes
// =============================================================================

pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut w = Writer::new();
    match msg {
        ClientMessage::Subscribe(sub) => {
            w.u8(0);
            w.len(sub.query_strings.len(), "query_strings")?;
            for query in &sub.query_strings {
                w.str(query)?;
            }
            w.u32(sub.request_id);
        }
        ClientMessage::CallReducer(call) => {
            w.u8(1);
            w.str(&call.reducer)?;
            w.value(&call.args)?;
            w.u32(call.request_id);
            w.u8(call.flags);
        }
        ClientMessage::OneOffQuery(query) => {
            w.u8(2);
            w.str(&query.message_id)?;
            w.str(&query.query_string)?;
        }
    }
    Ok(w.finish())
}

pub fn decode_client_message(bytes: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let mut r = Reader::new(bytes);
    let msg = match r.u8("client tag")? {
        0 => {
            let len = r.len("query_strings")?;
            let mut query_strings = Vec::with_capacity(len);
            for _ in 0..len {
                query_strings.push(r.str("query_string")?);
            }
            ClientMessage::Subscribe(Subscribe {
                query_strings,
                request_id: r.u32("request_id")?,
            })
        }
        1 => ClientMessage::CallReducer(CallReducer {
            reducer: r.str("reducer")?,
            args: r.value(0)?,
            request_id: r.u32("request_id")?,
            flags: r.u8("flags")?,
        }),
        2 => ClientMessage::OneOffQuery(OneOffQuery {
            message_id: r.str("message_id")?,
            query_string: r.str("query_string")?,
        }),
        other => return Err(ProtocolError::unknown_variant("client envelope", other)),
    };
    r.finish("client envelope")?;
    Ok(msg)
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut w = Writer::new();
    match msg {
        ServerMessage::IdentityToken(id) => {
            w.u8(0);
            w.str(&id.identity)?;
            w.str(&id.token)?;
            w.str(&id.connection_id)?;
        }
        ServerMessage::InitialSubscription(init) => {
            w.u8(1);
            w.database_update(&init.database_update)?;
            w.u32(init.request_id);
            w.u64(init.total_host_execution_duration_micros);
        }
        ServerMessage::TransactionUpdate(tx) => {
            w.u8(2);
            match &tx.status {
                UpdateStatus::Committed(update) => {
                    w.u8(0);
                    w.database_update(update)?;
                }
                UpdateStatus::Failed(reason) => {
                    w.u8(1);
                    w.str(reason)?;
                }
                UpdateStatus::OutOfEnergy => w.u8(2),
            }
            w.i64(tx.timestamp);
            w.str(&tx.caller_identity)?;
            w.str(&tx.reducer_call.reducer_name)?;
            w.u32(tx.reducer_call.reducer_id);
            w.value(&tx.reducer_call.args)?;
            w.u32(tx.reducer_call.request_id);
            w.u64(tx.energy_quanta_used);
        }
        ServerMessage::SubscriptionError(err) => {
            w.u8(3);
            w.opt_u32(err.request_id);
            w.opt_u32(err.table_id);
            w.str(&err.error)?;
        }
        ServerMessage::OneOffQueryResponse(resp) => {
            w.u8(4);
            w.str(&resp.message_id)?;
            w.opt_str(resp.error.as_deref())?;
            w.len(resp.tables.len(), "tables")?;
            for table in &resp.tables {
                w.str(&table.table_name)?;
                w.values(&table.rows)?;
            }
            w.u64(resp.total_host_execution_duration_micros);
        }
    }
    Ok(w.finish())
}

pub fn decode_server_message(bytes: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let mut r = Reader::new(bytes);
    let msg = match r.u8("server tag")? {
        0 => ServerMessage::IdentityToken(IdentityToken {
            identity: r.str("identity")?,
            token: r.str("token")?,
            connection_id: r.str("connection_id")?,
        }),
        1 => ServerMessage::InitialSubscription(InitialSubscription {
            database_update: r.database_update()?,
            request_id: r.u32("request_id")?,
            total_host_execution_duration_micros: r.u64("duration")?,
        }),
        2 => {
            let status = match r.u8("status tag")? {
                0 => UpdateStatus::Committed(r.database_update()?),
                1 => UpdateStatus::Failed(r.str("failure")?),
                2 => UpdateStatus::OutOfEnergy,
                other => return Err(ProtocolError::unknown_variant("update status", other)),
            };
            ServerMessage::TransactionUpdate(TransactionUpdate {
                status,
                timestamp: r.i64("timestamp")?,
                caller_identity: r.str("caller_identity")?,
                reducer_call: ReducerCallInfo {
                    reducer_name: r.str("reducer_name")?,
                    reducer_id: r.u32("reducer_id")?,
                    args: r.value(0)?,
                    request_id: r.u32("request_id")?,
                },
                energy_quanta_used: r.u64("energy")?,
            })
        }
        3 => ServerMessage::SubscriptionError(SubscriptionError {
            request_id: r.opt_u32("request_id")?,
            table_id: r.opt_u32("table_id")?,
            error: r.str("error")?,
        }),
        4 => {
            let message_id = r.str("message_id")?;
            let error = r.opt_str("error")?;
            let len = r.len("tables")?;
            let mut tables = Vec::with_capacity(len);
            for _ in 0..len {
                tables.push(OneOffTable {
                    table_name: r.str("table_name")?,
                    rows: r.values()?,
                });
            }
            ServerMessage::OneOffQueryResponse(OneOffQueryResponse {
                message_id,
                error,
                tables,
                total_host_execution_duration_micros: r.u64("duration")?,
            })
        }
        other => return Err(ProtocolError::unknown_variant("server envelope", other)),
    };
    r.finish("server envelope")?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_keep_integer_signedness_and_floats() {
        let value = json!({
            "entity_id": 7,
            "delta": -3,
            "position": {"x": 1.5, "y": -0.25},
            "tags": ["a", null, true]
        });
        let decoded = decode_value(&encode_value(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
        assert!(decoded["delta"].is_i64());
        assert!(decoded["entity_id"].is_u64());
    }

    #[test]
    fn subscribe_layout_is_tag_then_fields() {
        let msg = ClientMessage::Subscribe(Subscribe {
            query_strings: vec!["SELECT * FROM food".into()],
            request_id: 9,
        });
        let bytes = encode_client_message(&msg).unwrap();

        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..5], &1u32.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 4..], &9u32.to_le_bytes());
        assert_eq!(decode_client_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn transaction_update_survives_the_codec() {
        let msg = ServerMessage::TransactionUpdate(TransactionUpdate {
            status: UpdateStatus::Committed(DatabaseUpdate {
                tables: vec![TableUpdate {
                    table_id: 3,
                    table_name: "circle".into(),
                    num_rows: 1,
                    deletes: vec![],
                    inserts: vec![json!({"entity_id": 1, "speed": 2.5})],
                }],
            }),
            timestamp: -5,
            caller_identity: "abc".into(),
            reducer_call: ReducerCallInfo {
                reducer_name: "update_player_input".into(),
                reducer_id: 2,
                args: json!([{"x": 1.0, "y": 0.0}]),
                request_id: 11,
            },
            energy_quanta_used: 40,
        });
        let bytes = encode_server_message(&msg).unwrap();
        assert_eq!(decode_server_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_tags_and_truncation_are_reported() {
        let err = decode_server_message(&[9]).unwrap_err();
        assert!(err.is_unknown_variant());

        let msg = ServerMessage::SubscriptionError(SubscriptionError {
            request_id: Some(1),
            table_id: None,
            error: "no such table".into(),
        });
        let bytes = encode_server_message(&msg).unwrap();
        let err = decode_server_message(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_value(&json!(1)).unwrap();
        bytes.push(0);
        assert!(decode_value(&bytes).is_err());
    }
}
