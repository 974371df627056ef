//! Language-independent payload serializer.
//!
//! Text payloads are JSON. Binary payloads are the tuple codec from
//! [`crate::codec`] behind a one-byte compression marker.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use spacelink_domain::SerializationFormat;

use crate::codec;
use crate::error::ProtocolError;
use crate::messages::{ClientMessage, ServerMessage};

/// Binary frame marker: payload follows uncompressed
pub const COMPRESSION_NONE: u8 = 0x00;
/// Binary frame marker: payload follows gzip-compressed
pub const COMPRESSION_GZIP: u8 = 0x01;

/// Largest binary payload accepted after decompression
pub const MAX_INFLATED_LEN: usize = 16 * 1024 * 1024;

/// One WebSocket data frame's worth of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    Text(String),
    Binary(Vec<u8>),
}

impl WirePayload {
    pub fn is_text(&self) -> bool {
        matches!(self, WirePayload::Text(_))
    }

    pub fn len(&self) -> usize {
        match self {
            WirePayload::Text(s) => s.len(),
            WirePayload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SerializationFormat {
        match self {
            WirePayload::Text(_) => SerializationFormat::Json,
            WirePayload::Binary(_) => SerializationFormat::Binary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serializer {
    format: SerializationFormat,
    compress: bool,
}

impl Serializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self {
            format,
            compress: false,
        }
    }

    /// Gzip binary payloads. Has no effect on JSON.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn compresses(&self) -> bool {
        self.compress && self.format == SerializationFormat::Binary
    }

    pub fn encode_value(&self, value: &Value) -> Result<WirePayload, ProtocolError> {
        match self.format {
            SerializationFormat::Json => Ok(WirePayload::Text(serde_json::to_string(value)?)),
            SerializationFormat::Binary => self.frame(codec::encode_value(value)?),
        }
    }

    pub fn decode_value(&self, payload: &WirePayload) -> Result<Value, ProtocolError> {
        match payload {
            WirePayload::Text(text) => Ok(serde_json::from_str(text)?),
            WirePayload::Binary(bytes) => codec::decode_value(&unframe(bytes)?),
        }
    }

    pub fn encode_client(&self, msg: &ClientMessage) -> Result<WirePayload, ProtocolError> {
        match self.format {
            SerializationFormat::Json => Ok(WirePayload::Text(serde_json::to_string(msg)?)),
            SerializationFormat::Binary => self.frame(codec::encode_client_message(msg)?),
        }
    }

    pub fn decode_client(&self, payload: &WirePayload) -> Result<ClientMessage, ProtocolError> {
        match payload {
            WirePayload::Text(text) => Ok(serde_json::from_str(text)?),
            WirePayload::Binary(bytes) => codec::decode_client_message(&unframe(bytes)?),
        }
    }

    pub fn encode_server(&self, msg: &ServerMessage) -> Result<WirePayload, ProtocolError> {
        match self.format {
            SerializationFormat::Json => Ok(WirePayload::Text(serde_json::to_string(msg)?)),
            SerializationFormat::Binary => self.frame(codec::encode_server_message(msg)?),
        }
    }

    pub fn decode_server(&self, payload: &WirePayload) -> Result<ServerMessage, ProtocolError> {
        match payload {
            WirePayload::Text(text) => Ok(serde_json::from_str(text)?),
            WirePayload::Binary(bytes) => codec::decode_server_message(&unframe(bytes)?),
        }
    }

    fn frame(&self, body: Vec<u8>) -> Result<WirePayload, ProtocolError> {
        let mut out = Vec::with_capacity(body.len() + 1);
        if self.compress {
            out.push(COMPRESSION_GZIP);
            let mut encoder = GzEncoder::new(out, Compression::fast());
            encoder
                .write_all(&body)
                .map_err(|e| ProtocolError::Compression(format!("gzip write failed: {e}")))?;
            out = encoder
                .finish()
                .map_err(|e| ProtocolError::Compression(format!("gzip finish failed: {e}")))?;
        } else {
            out.push(COMPRESSION_NONE);
            out.extend_from_slice(&body);
        }
        Ok(WirePayload::Binary(out))
    }
}

fn unframe(bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let Some((&marker, body)) = bytes.split_first() else {
        return Err(ProtocolError::Truncated {
            field: "compression marker",
            needed: 1,
        });
    };
    match marker {
        COMPRESSION_NONE => Ok(body.to_vec()),
        COMPRESSION_GZIP => inflate(body, MAX_INFLATED_LEN),
        other => Err(ProtocolError::unknown_variant("compression", other)),
    }
}

fn inflate(body: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    GzDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(format!("gzip read failed: {e}")))?;
    if out.len() > limit {
        return Err(ProtocolError::Compression(format!(
            "inflated payload exceeds {limit} bytes"
        )));
    }
    Ok(out)
}
