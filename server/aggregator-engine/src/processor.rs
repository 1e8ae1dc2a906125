//! Group processors: reduce a complete group into a single output payload.

use serde_json::Value;

use crate::error::ProcessorError;
use crate::types::{
  Headers, Message, MessageGroup, CORRELATION_ID_HEADER, LINE_COUNT_HEADER,
  MARKER_HEADER, SEQUENCE_NUMBER_HEADER,
};

/// Reduces a releasable group. Called at most once per successful release and
/// must not rely on side effects: a failed call may be repeated on the same snapshot.
pub trait MessageGroupProcessor: Send + Sync {
  fn process_group(&self, group: &MessageGroup) -> Result<Value, ProcessorError>;
}

impl<F> MessageGroupProcessor for F
where
  F: Fn(&MessageGroup) -> Result<Value, ProcessorError> + Send + Sync,
{
  fn process_group(&self, group: &MessageGroup) -> Result<Value, ProcessorError> {
    self(group)
  }
}

/// Collects every non-marker payload in arrival order.
///
/// A group made only of markers yields an empty array, not null.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentPayloadProcessor;

impl MessageGroupProcessor for ContentPayloadProcessor {
  fn process_group(&self, group: &MessageGroup) -> Result<Value, ProcessorError> {
    let payloads: Vec<Value> = group
      .messages()
      .iter()
      .filter(|m| !m.is_marker())
      .map(|m| m.payload().clone())
      .collect();
    Ok(Value::Array(payloads))
  }
}

/// Per-message headers that never survive aggregation.
const PER_MESSAGE_HEADERS: [&str; 3] = [MARKER_HEADER, LINE_COUNT_HEADER, SEQUENCE_NUMBER_HEADER];

/// Headers whose value is identical on every member message; conflicting ones are dropped.
pub fn merge_headers(group: &MessageGroup) -> Headers {
  let mut messages = group.messages().iter();
  let mut merged: Headers = match messages.next() {
    Some(first) => first.headers().clone(),
    None => return Headers::new(),
  };
  for message in messages {
    merged.retain(|name, value| message.header(name) == Some(&*value));
  }
  for name in PER_MESSAGE_HEADERS {
    merged.remove(name);
  }
  merged
}

/// Wrap a reduced payload into the message handed to the output sink.
///
/// The key header keeps its merged value (and JSON type) when every member
/// agrees on it; otherwise it carries the correlation key as a string.
pub fn build_output(group: &MessageGroup, payload: Value, key_header: Option<&str>) -> Message {
  let mut headers = merge_headers(group);
  headers
    .entry(key_header.unwrap_or(CORRELATION_ID_HEADER).to_string())
    .or_insert_with(|| Value::String(group.key().0.clone()));
  Message::new(payload).with_headers(headers)
}
