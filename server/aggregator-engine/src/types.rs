//! Core types for the aggregator engine (internal models + JSON contracts).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Well-known header names
// ---------------------------------------------------------------------------

pub const CORRELATION_ID_HEADER: &str = "correlationId";
pub const SEQUENCE_SIZE_HEADER: &str = "sequenceSize";
pub const SEQUENCE_NUMBER_HEADER: &str = "sequenceNumber";
/// Marker header used by the file-splitter policy (`START` / `END`).
pub const MARKER_HEADER: &str = "marker";
pub const LINE_COUNT_HEADER: &str = "lineCount";
pub const MARKER_START: &str = "START";
pub const MARKER_END: &str = "END";

/// Header map. Ordered so serialized output is deterministic.
pub type Headers = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An immutable payload + header pair. Builders consume `self`, so a message
/// cannot change once it has been handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
  id: Uuid,
  timestamp: DateTime<Utc>,
  payload: Value,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  headers: Headers,
}

impl Message {
  pub fn new(payload: impl Into<Value>) -> Self {
    Self {
      id: Uuid::new_v4(),
      timestamp: Utc::now(),
      payload: payload.into(),
      headers: Headers::new(),
    }
  }

  pub fn from_parts(id: Uuid, timestamp: DateTime<Utc>, payload: Value, headers: Headers) -> Self {
    Self {
      id,
      timestamp,
      payload,
      headers,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.headers.extend(headers);
    self
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }

  pub fn payload(&self) -> &Value {
    &self.payload
  }

  pub fn headers(&self) -> &Headers {
    &self.headers
  }

  pub fn header(&self, name: &str) -> Option<&Value> {
    self.headers.get(name)
  }

  pub fn header_str(&self, name: &str) -> Option<&str> {
    self.header(name).and_then(Value::as_str)
  }

  /// Header read as an unsigned integer; numeric strings are accepted.
  pub fn header_u64(&self, name: &str) -> Option<u64> {
    match self.header(name)? {
      Value::Number(n) => n.as_u64(),
      Value::String(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  /// True for START/END sentinel messages.
  pub fn is_marker(&self) -> bool {
    matches!(self.header_str(MARKER_HEADER), Some(MARKER_START) | Some(MARKER_END))
  }

  pub fn into_payload(self) -> Value {
    self.payload
  }
}

// ---------------------------------------------------------------------------
// Correlation key
// ---------------------------------------------------------------------------

/// Opaque value grouping related messages together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationKey(pub String);

impl CorrelationKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CorrelationKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CorrelationKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for CorrelationKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

// ---------------------------------------------------------------------------
// Message group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
  Pending,
  Releasing,
  Complete,
  Expired,
}

/// The mutable accumulation of messages sharing a correlation key.
///
/// Messages are append-only while the group is pending; only the store and
/// the engine (holding the key's lock) can mutate it.
#[derive(Debug, Clone, Serialize)]
pub struct MessageGroup {
  key: CorrelationKey,
  messages: Vec<Message>,
  condition: Option<String>,
  created_at: DateTime<Utc>,
  last_updated_at: DateTime<Utc>,
  state: GroupState,
}

impl MessageGroup {
  pub fn new(key: CorrelationKey, now: DateTime<Utc>) -> Self {
    Self {
      key,
      messages: Vec::new(),
      condition: None,
      created_at: now,
      last_updated_at: now,
      state: GroupState::Pending,
    }
  }

  /// Build a pending group from already-admitted messages (store backends, strategy tests).
  pub fn from_messages(
    key: CorrelationKey,
    messages: Vec<Message>,
    condition: Option<String>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      messages,
      condition,
      ..Self::new(key, now)
    }
  }

  pub fn key(&self) -> &CorrelationKey {
    &self.key
  }

  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn size(&self) -> usize {
    self.messages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.messages.is_empty()
  }

  pub fn first(&self) -> Option<&Message> {
    self.messages.first()
  }

  pub fn condition(&self) -> Option<&str> {
    self.condition.as_deref()
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  pub fn last_updated_at(&self) -> DateTime<Utc> {
    self.last_updated_at
  }

  pub fn state(&self) -> GroupState {
    self.state
  }

  pub fn into_messages(self) -> Vec<Message> {
    self.messages
  }

  pub(crate) fn push(&mut self, message: Message, now: DateTime<Utc>) {
    self.messages.push(message);
    self.last_updated_at = now;
  }

  pub(crate) fn set_condition(&mut self, condition: Option<String>) {
    self.condition = condition;
  }

  pub(crate) fn set_state(&mut self, state: GroupState) {
    self.state = state;
  }
}

// ---------------------------------------------------------------------------
// Inbound types (JSON contract: what the caller sends)
// ---------------------------------------------------------------------------

/// One inbound message line from stdin. Unknown fields are silently ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub timestamp: Option<String>,
  #[serde(default)]
  pub payload: Value,
  #[serde(default)]
  pub headers: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Output types (JSON contract: what we emit)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputRecord {
  Released {
    message: Message,
  },
  Discarded {
    correlation_key: CorrelationKey,
    messages: Vec<Message>,
  },
  Rejected {
    message: Message,
    error: String,
  },
}

/// Structured error output for invalid input lines.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
  pub error: bool,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl ErrorOutput {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      error: true,
      message: message.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}
