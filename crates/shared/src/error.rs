//! Errors raised while encoding or decoding wire payloads.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Encoding a value failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A payload could not be decoded into the expected shape
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Envelope or value tag outside the closed set
    #[error("unknown {context} variant: {tag}")]
    UnknownVariant { context: &'static str, tag: String },

    /// Binary payload ended before a field was complete
    #[error("payload truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("compression failed: {0}")]
    Compression(String),
}

impl ProtocolError {
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn deserialization(msg: impl Into<String>) -> Self {
        Self::Deserialization(msg.into())
    }

    pub fn unknown_variant(context: &'static str, tag: impl ToString) -> Self {
        Self::UnknownVariant {
            context,
            tag: tag.to_string(),
        }
    }

    pub fn is_unknown_variant(&self) -> bool {
        matches!(self, Self::UnknownVariant { .. })
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            // serde reports unknown enum tags as data errors
            let msg = err.to_string();
            if msg.starts_with("unknown variant") {
                let tag = msg
                    .split('`')
                    .nth(1)
                    .unwrap_or("<unknown>")
                    .to_string();
                return Self::UnknownVariant {
                    context: "envelope",
                    tag,
                };
            }
            Self::Deserialization(msg)
        } else {
            Self::Serialization(err.to_string())
        }
    }
}
