//! Correlation strategies: derive the grouping key for a message.
//!
//! A strategy is a total, deterministic, side-effect-free function of the
//! message. Missing data is an error, never a default key.

use serde_json::Value;

use crate::error::EngineError;
use crate::fingerprint;
use crate::types::{CorrelationKey, Message, CORRELATION_ID_HEADER};

pub trait CorrelationStrategy: Send + Sync {
  fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError>;
}

impl<F> CorrelationStrategy for F
where
  F: Fn(&Message) -> Result<CorrelationKey, EngineError> + Send + Sync,
{
  fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError> {
    self(message)
  }
}

fn required_header<'m>(message: &'m Message, name: &str) -> Result<&'m Value, EngineError> {
  match message.header(name) {
    None | Some(Value::Null) => Err(EngineError::correlation(format!(
      "missing header '{}' on message {}",
      name,
      message.id()
    ))),
    Some(v) => Ok(v),
  }
}

/// Key taken from a single header value, rendered by [`fingerprint::key_text`]
/// (so `"17"` and `17` name the same group).
#[derive(Debug, Clone)]
pub struct HeaderCorrelationStrategy {
  header: String,
}

impl HeaderCorrelationStrategy {
  pub fn new(header: impl Into<String>) -> Self {
    Self {
      header: header.into(),
    }
  }

  pub fn header(&self) -> &str {
    &self.header
  }
}

impl Default for HeaderCorrelationStrategy {
  fn default() -> Self {
    Self::new(CORRELATION_ID_HEADER)
  }
}

impl CorrelationStrategy for HeaderCorrelationStrategy {
  fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError> {
    let value = required_header(message, &self.header)?;
    Ok(CorrelationKey(fingerprint::key_text(value)))
  }
}

/// Key is a blake3 fingerprint over several headers, in the configured order.
#[derive(Debug, Clone)]
pub struct CompositeHeaderCorrelationStrategy {
  headers: Vec<String>,
}

impl CompositeHeaderCorrelationStrategy {
  pub fn new<I, S>(headers: I) -> Result<Self, EngineError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let headers: Vec<String> = headers.into_iter().map(Into::into).collect();
    if headers.is_empty() {
      return Err(EngineError::config("headers", "at least one header is required"));
    }
    Ok(Self { headers })
  }
}

impl CorrelationStrategy for CompositeHeaderCorrelationStrategy {
  fn correlation_key(&self, message: &Message) -> Result<CorrelationKey, EngineError> {
    let mut parts = Vec::with_capacity(self.headers.len());
    for name in &self.headers {
      parts.push((name.as_str(), required_header(message, name)?));
    }
    Ok(fingerprint::compute(parts))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn header_strategy_uses_string_verbatim() {
    let s = HeaderCorrelationStrategy::new("file_name");
    let m = Message::new("l1").with_header("file_name", "a.txt");
    assert_eq!(s.correlation_key(&m).unwrap(), CorrelationKey::from("a.txt"));
  }

  #[test]
  fn header_strategy_renders_numbers() {
    let s = HeaderCorrelationStrategy::default();
    let m = Message::new("x").with_header(CORRELATION_ID_HEADER, 17);
    assert_eq!(s.correlation_key(&m).unwrap(), CorrelationKey::from("17"));
    let text = Message::new("y").with_header(CORRELATION_ID_HEADER, "17");
    assert_eq!(s.correlation_key(&text).unwrap(), s.correlation_key(&m).unwrap());
  }

  #[test]
  fn missing_or_null_header_fails() {
    let s = HeaderCorrelationStrategy::default();
    let err = s.correlation_key(&Message::new("x")).unwrap_err();
    assert!(matches!(err, EngineError::Correlation { .. }));
    let null = Message::new("x").with_header(CORRELATION_ID_HEADER, json!(null));
    assert!(s.correlation_key(&null).is_err());
  }

  #[test]
  fn composite_strategy_is_deterministic() {
    let s = CompositeHeaderCorrelationStrategy::new(["tenant", "order"]).unwrap();
    let a = Message::new(1).with_header("tenant", "acme").with_header("order", 7);
    let b = Message::new(2).with_header("order", 7).with_header("tenant", "acme");
    assert_eq!(s.correlation_key(&a).unwrap(), s.correlation_key(&b).unwrap());

    let c = Message::new(3).with_header("tenant", "acme").with_header("order", 8);
    assert_ne!(s.correlation_key(&a).unwrap(), s.correlation_key(&c).unwrap());
  }

  #[test]
  fn composite_strategy_requires_every_header() {
    let s = CompositeHeaderCorrelationStrategy::new(["tenant", "order"]).unwrap();
    let m = Message::new(1).with_header("tenant", "acme");
    let err = s.correlation_key(&m).unwrap_err();
    assert!(err.to_string().contains("order"));
  }

  #[test]
  fn composite_strategy_needs_headers() {
    assert!(CompositeHeaderCorrelationStrategy::new(Vec::<String>::new()).is_err());
  }

  #[test]
  fn closures_are_strategies() {
    let s = |m: &Message| -> Result<CorrelationKey, EngineError> {
      Ok(CorrelationKey(m.payload().to_string()))
    };
    assert_eq!(s.correlation_key(&Message::new(5)).unwrap(), CorrelationKey::from("5"));
  }
}
