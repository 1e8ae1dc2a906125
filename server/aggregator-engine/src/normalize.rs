//! Normalize inbound JSON lines into immutable Message values.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::*;

/// Validate an InboundMessage and build a Message.
///
/// Missing `id` / `timestamp` are generated; present ones must parse.
pub fn normalize(raw: &InboundMessage) -> Result<Message, EngineError> {
  let id = match &raw.id {
    Some(s) => Uuid::parse_str(s.trim())
      .map_err(|e| EngineError::validation("id", &format!("invalid uuid: {}", e)))?,
    None => Uuid::new_v4(),
  };

  let timestamp: DateTime<Utc> = match &raw.timestamp {
    Some(t) => DateTime::parse_from_rfc3339(t)
      .map_err(|e| EngineError::validation("timestamp", &format!("invalid RFC3339: {}", e)))?
      .with_timezone(&Utc),
    None => Utc::now(),
  };

  if raw.headers.keys().any(|k| k.trim().is_empty()) {
    return Err(EngineError::validation("headers", "header names must not be empty"));
  }

  let headers: Headers = raw
    .headers
    .iter()
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();

  Ok(Message::from_parts(id, timestamp, raw.payload.clone(), headers))
}
