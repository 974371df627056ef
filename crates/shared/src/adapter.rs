//! Protocol adapters.
//!
//! One stateless adapter per [`ServerLanguage`]. An adapter rewrites the
//! canonical (snake_case) form of a row into the server's native keys, enum
//! values and injected metadata, and back.
//!
//! Round-trip law: for every field present in a canonical value `x`,
//! `adapt_from_server(adapt_to_server(x))` yields the same field and value.
//! Metadata injected on the way out (`created_at`) is dropped on the way in
//! unless the entity schema declares it.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use spacelink_domain::{EntityKind, ServerLanguage};

use crate::casing::{to_camel_case, to_go_case, to_pascal_case, to_snake_case};

/// Canonical name of the creation timestamp some servers require
pub const CREATED_AT: &str = "created_at";

pub trait ProtocolAdapter: Send + Sync + fmt::Debug {
    fn language(&self) -> ServerLanguage;

    /// Rewrite one canonical key into the server's convention
    fn key_to_server(&self, key: &str) -> String;

    /// Rewrite one server key back to canonical snake_case
    fn key_from_server(&self, key: &str) -> String {
        to_snake_case(key)
    }

    fn enum_to_server(&self, value: &str) -> String;

    fn enum_from_server(&self, value: &str) -> String {
        to_snake_case(value)
    }

    /// Creation timestamp in this server's representation, if it wants one
    fn created_at(&self, now: DateTime<Utc>) -> Option<Value>;

    fn adapt_to_server(&self, canonical: &Value, kind: EntityKind) -> Value {
        self.adapt_to_server_at(canonical, kind, Utc::now())
    }

    /// [`ProtocolAdapter::adapt_to_server`] with an explicit clock.
    fn adapt_to_server_at(&self, canonical: &Value, kind: EntityKind, now: DateTime<Utc>) -> Value {
        match canonical {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len() + 1);
                for (key, value) in map {
                    let value = if kind.enum_fields().contains(&key.as_str()) {
                        match value {
                            Value::String(s) => Value::String(self.enum_to_server(s)),
                            other => other.clone(),
                        }
                    } else {
                        recase_keys(value, &|k| self.key_to_server(k))
                    };
                    out.insert(self.key_to_server(key), value);
                }

                if kind.requires_created_at() && !map.contains_key(CREATED_AT) {
                    if let Some(stamp) = self.created_at(now) {
                        out.insert(self.key_to_server(CREATED_AT), stamp);
                    }
                }
                Value::Object(out)
            }
            Value::Array(rows) => Value::Array(
                rows.iter()
                    .map(|row| self.adapt_to_server_at(row, kind, now))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn adapt_from_server(&self, native: &Value, kind: EntityKind) -> Value {
        match native {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let key = self.key_from_server(key);
                    if key == CREATED_AT && kind.requires_created_at() && !kind.declares(&key) {
                        continue;
                    }
                    let value = if kind.enum_fields().contains(&key.as_str()) {
                        match value {
                            Value::String(s) => Value::String(self.enum_from_server(s)),
                            other => other.clone(),
                        }
                    } else {
                        recase_keys(value, &|k| self.key_from_server(k))
                    };
                    out.insert(key, value);
                }
                Value::Object(out)
            }
            Value::Array(rows) => Value::Array(
                rows.iter()
                    .map(|row| self.adapt_from_server(row, kind))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Recase every key of nested objects, leaving values alone.
fn recase_keys(value: &Value, recase: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (recase(k), recase_keys(v, recase)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| recase_keys(v, recase)).collect()),
        other => other.clone(),
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// snake_case everywhere; nothing injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustAdapter;

impl ProtocolAdapter for RustAdapter {
    fn language(&self) -> ServerLanguage {
        ServerLanguage::Rust
    }

    fn key_to_server(&self, key: &str) -> String {
        to_snake_case(key)
    }

    fn enum_to_server(&self, value: &str) -> String {
        to_snake_case(value)
    }

    fn created_at(&self, _now: DateTime<Utc>) -> Option<Value> {
        None
    }
}

/// PascalCase keys and enums, RFC 3339 `CreatedAt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CSharpAdapter;

impl ProtocolAdapter for CSharpAdapter {
    fn language(&self) -> ServerLanguage {
        ServerLanguage::CSharp
    }

    fn key_to_server(&self, key: &str) -> String {
        to_pascal_case(key)
    }

    fn enum_to_server(&self, value: &str) -> String {
        to_pascal_case(value)
    }

    fn created_at(&self, now: DateTime<Utc>) -> Option<Value> {
        Some(Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)))
    }
}

/// camelCase keys and enums, `createdAt` in unix millis.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeScriptAdapter;

impl ProtocolAdapter for TypeScriptAdapter {
    fn language(&self) -> ServerLanguage {
        ServerLanguage::TypeScript
    }

    fn key_to_server(&self, key: &str) -> String {
        to_camel_case(key)
    }

    fn enum_to_server(&self, value: &str) -> String {
        to_camel_case(value)
    }

    fn created_at(&self, now: DateTime<Utc>) -> Option<Value> {
        Some(Value::from(now.timestamp_millis()))
    }
}

/// Exported Go field names: PascalCase with initialisms, `CreatedAt` in
/// unix seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoAdapter;

impl ProtocolAdapter for GoAdapter {
    fn language(&self) -> ServerLanguage {
        ServerLanguage::Go
    }

    fn key_to_server(&self, key: &str) -> String {
        to_go_case(key)
    }

    fn enum_to_server(&self, value: &str) -> String {
        to_pascal_case(value)
    }

    fn created_at(&self, now: DateTime<Utc>) -> Option<Value> {
        Some(Value::from(now.timestamp()))
    }
}

static RUST: RustAdapter = RustAdapter;
static CSHARP: CSharpAdapter = CSharpAdapter;
static TYPESCRIPT: TypeScriptAdapter = TypeScriptAdapter;
static GO: GoAdapter = GoAdapter;

/// Resolve the adapter for a server language.
pub fn adapter_for(language: ServerLanguage) -> &'static dyn ProtocolAdapter {
    match language {
        ServerLanguage::Rust => &RUST,
        ServerLanguage::CSharp => &CSHARP,
        ServerLanguage::TypeScript => &TYPESCRIPT,
        ServerLanguage::Go => &GO,
    }
}
