//! Log entries handed to the publish gate
//!
//! An entry is opaque to the shipper apart from its origin token, which
//! scopes the publish topic. Encoding is deferred to the moment of publish so
//! the sender can write straight into a pooled buffer.

use crate::error::EncodeError;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of observability data that can be shipped
pub trait LogEntry: Send + Sync {
    /// Identifier of the emitting process or component
    fn origin(&self) -> &str;

    /// Append the wire form of this entry to `buf`
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl<E: LogEntry + ?Sized> LogEntry for Box<E> {
    fn origin(&self) -> &str {
        (**self).origin()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        (**self).encode(buf)
    }
}

/// Entry whose payload was serialized by the producer
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogEntry {
    origin: String,
    payload: Bytes,
}

impl RawLogEntry {
    pub fn new(origin: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            origin: origin.into(),
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl LogEntry for RawLogEntry {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Severity of a structured entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parse a level name, accepting common aliases
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" | "information" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "fatal" | "critical" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// Entry built by the shipper itself, serialized as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Shape accepted for JSON input lines; everything but `text` is optional
#[derive(Debug, Deserialize)]
struct InputRecord {
    origin: Option<String>,
    level: Option<String>,
    #[serde(alias = "message", alias = "msg")]
    text: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl StructuredLogEntry {
    pub fn new(origin: impl Into<String>, level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            timestamp: Utc::now(),
            level,
            text: text.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Build an entry from one line of input
    ///
    /// JSON objects with a `text` (or `message`/`msg`) field are unpacked;
    /// anything else is shipped verbatim at info level.
    pub fn from_line(default_origin: &str, line: &str) -> Self {
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if trimmed.trim_start().starts_with('{') {
            if let Ok(record) = serde_json::from_str::<InputRecord>(trimmed) {
                let level = record
                    .level
                    .as_deref()
                    .and_then(LogLevel::parse)
                    .unwrap_or(LogLevel::Info);
                let origin = record
                    .origin
                    .filter(|o| !o.is_empty())
                    .unwrap_or_else(|| default_origin.to_string());
                return Self::new(origin, level, record.text).with_tags(record.tags);
            }
        }

        Self::new(default_origin, LogLevel::Info, trimmed)
    }
}

impl LogEntry for StructuredLogEntry {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        serde_json::to_writer((&mut *buf).writer(), self)?;
        Ok(())
    }
}
