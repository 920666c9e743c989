// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::PipelineError;

/// Raw inbound record as produced by an external framer, before journaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub message_id: Bytes,
    pub payload: Bytes,
}

impl RawEntry {
    /// Creates an entry with a freshly generated message id
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: Bytes::from(uuid::Uuid::new_v4().to_string()),
            payload: payload.into(),
        }
    }

    pub fn with_id(message_id: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: message_id.into(),
            payload: payload.into(),
        }
    }
}

/// A raw entry read back from the journal together with its offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub offset: u64,
    pub message_id: Bytes,
    pub payload: Bytes,
}

impl JournalEntry {
    pub fn message_id_lossy(&self) -> String {
        String::from_utf8_lossy(&self.message_id).into_owned()
    }
}

/// Message in flight through the stages; mutated in place by processors
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
    pub source_input_id: Option<String>,
    /// Journal offset, carried for acknowledgement
    pub offset: u64,
}

impl DecodedMessage {
    pub fn message(&self) -> Option<&str> {
        self.fields.get("message").and_then(Value::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }
}

/// Anything a stage carries must say where it came from in the journal
pub trait Tracked {
    fn message_id(&self) -> &str;
    fn journal_offset(&self) -> u64;
}

impl Tracked for DecodedMessage {
    fn message_id(&self) -> &str {
        &self.id
    }

    fn journal_offset(&self) -> u64 {
        self.offset
    }
}

/// Result of decoding one journal entry
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(DecodedMessage),
    /// Well-formed but missing required content; dropped and acknowledged
    Incomplete { reason: String },
}

/// Turns a journaled payload into a message.
///
/// Returning `Err(PipelineError::CorruptEntry)` makes the reader skip the entry.
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, entry: &JournalEntry) -> Result<Decoded, PipelineError>;
}

/// Decodes JSON object payloads.
///
/// `message` is required, `timestamp` is optional epoch seconds and `source_input`
/// optionally names the input. Everything else lands in `fields`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl MessageDecoder for JsonDecoder {
    fn decode(&self, entry: &JournalEntry) -> Result<Decoded, PipelineError> {
        let corrupt = |reason: String| PipelineError::CorruptEntry {
            offset: entry.offset,
            reason,
        };

        let value: Value = serde_json::from_slice(&entry.payload)
            .map_err(|e| corrupt(format!("invalid JSON payload: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(corrupt("payload is not a JSON object".to_string()));
        };

        match fields.get("message") {
            Some(Value::String(_)) => {}
            Some(_) => {
                return Ok(Decoded::Incomplete {
                    reason: "message field is not a string".to_string(),
                })
            }
            None => {
                return Ok(Decoded::Incomplete {
                    reason: "missing message field".to_string(),
                })
            }
        }

        let timestamp = fields
            .remove("timestamp")
            .and_then(|ts| ts.as_f64())
            .and_then(epoch_seconds)
            .unwrap_or_else(Utc::now);

        let source_input_id = match fields.remove("source_input") {
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
            None => None,
        };

        Ok(Decoded::Message(DecodedMessage {
            id: entry.message_id_lossy(),
            timestamp,
            fields,
            source_input_id,
            offset: entry.offset,
        }))
    }
}

fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos).single()
}
