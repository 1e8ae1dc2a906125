//! Structured error types for the aggregator engine.

use std::time::Duration;

use thiserror::Error;

use crate::types::CorrelationKey;

#[derive(Debug, Error)]
pub enum EngineError {
  /// No correlation key could be derived; the message is rejected and no group is touched.
  #[error("correlation: {reason}")]
  Correlation { reason: String },

  /// The per-key lock could not be acquired in time. The whole admit may be retried.
  #[error("lock timeout: group {key} still locked after {waited:?}")]
  LockTimeout { key: CorrelationKey, waited: Duration },

  /// Group reduction failed; the group stays pending in the store.
  #[error("processor: group {key}: {reason}")]
  Processor {
    key: CorrelationKey,
    reason: String,
    retryable: bool,
  },

  #[error("store: {0}")]
  Store(String),

  #[error("config: {field}: {reason}")]
  Config { field: String, reason: String },

  #[error("validation: {field}: {reason}")]
  Validation { field: String, reason: String },

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),
}

impl EngineError {
  pub fn correlation(reason: impl Into<String>) -> Self {
    Self::Correlation {
      reason: reason.into(),
    }
  }

  pub fn validation(field: &str, reason: &str) -> Self {
    Self::Validation {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn config(field: &str, reason: &str) -> Self {
    Self::Config {
      field: field.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn store(msg: impl Into<String>) -> Self {
    Self::Store(msg.into())
  }

  /// Transient failures the caller may retry as-is.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::LockTimeout { .. } => true,
      Self::Processor { retryable, .. } => *retryable,
      _ => false,
    }
  }
}

/// Failure raised by a [`MessageGroupProcessor`](crate::processor::MessageGroupProcessor).
///
/// The engine attaches the correlation key when converting it into [`EngineError::Processor`].
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ProcessorError {
  pub reason: String,
  pub retryable: bool,
}

impl ProcessorError {
  pub fn retryable(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
      retryable: true,
    }
  }

  pub fn fatal(reason: impl Into<String>) -> Self {
    Self {
      reason: reason.into(),
      retryable: false,
    }
  }

  pub fn into_engine_error(self, key: &CorrelationKey) -> EngineError {
    EngineError::Processor {
      key: key.clone(),
      reason: self.reason,
      retryable: self.retryable,
    }
  }
}
