//! Outbound collaborators: where released, expired and rejected messages go.

use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use crate::error::EngineError;
use crate::types::{CorrelationKey, Message, OutputRecord};

pub trait MessageSink: Send + Sync {
  /// One reduced message per completed group.
  fn emit(&self, message: Message);
  /// The accumulated messages of an expired group.
  fn discard(&self, key: &CorrelationKey, messages: Vec<Message>);
  /// A message that could not be correlated, or whose group failed fatally.
  fn reject(&self, message: Message, error: &EngineError);
}

/// Keeps every outbound record in memory, in delivery order.
#[derive(Debug, Default)]
pub struct CollectingSink {
  records: Mutex<Vec<OutputRecord>>,
}

impl CollectingSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn records(&self) -> Vec<OutputRecord> {
    self.records.lock().clone()
  }

  pub fn take(&self) -> Vec<OutputRecord> {
    std::mem::take(&mut *self.records.lock())
  }

  pub fn released(&self) -> Vec<Message> {
    self
      .records
      .lock()
      .iter()
      .filter_map(|r| match r {
        OutputRecord::Released { message } => Some(message.clone()),
        _ => None,
      })
      .collect()
  }

  pub fn discarded(&self) -> Vec<(CorrelationKey, Vec<Message>)> {
    self
      .records
      .lock()
      .iter()
      .filter_map(|r| match r {
        OutputRecord::Discarded {
          correlation_key,
          messages,
        } => Some((correlation_key.clone(), messages.clone())),
        _ => None,
      })
      .collect()
  }

  pub fn rejected(&self) -> Vec<(Message, String)> {
    self
      .records
      .lock()
      .iter()
      .filter_map(|r| match r {
        OutputRecord::Rejected { message, error } => Some((message.clone(), error.clone())),
        _ => None,
      })
      .collect()
  }
}

impl MessageSink for CollectingSink {
  fn emit(&self, message: Message) {
    self.records.lock().push(OutputRecord::Released { message });
  }

  fn discard(&self, key: &CorrelationKey, messages: Vec<Message>) {
    self.records.lock().push(OutputRecord::Discarded {
      correlation_key: key.clone(),
      messages,
    });
  }

  fn reject(&self, message: Message, error: &EngineError) {
    self.records.lock().push(OutputRecord::Rejected {
      message,
      error: error.to_string(),
    });
  }
}

/// Writes each record as one JSON line. Write failures are logged, not propagated:
/// the engine has already committed the group transition.
pub struct JsonLinesSink<W: Write + Send> {
  out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
  pub fn new(out: W) -> Self {
    Self {
      out: Mutex::new(out),
    }
  }

  pub fn flush(&self) -> std::io::Result<()> {
    self.out.lock().flush()
  }

  pub fn into_inner(self) -> W {
    self.out.into_inner()
  }

  /// Write any serializable value as one line (records, error lines).
  pub fn write_value<T: Serialize>(&self, value: &T) {
    let mut out = self.out.lock();
    let result = serde_json::to_writer(&mut *out, value)
      .map_err(std::io::Error::from)
      .and_then(|_| writeln!(out));
    if let Err(e) = result {
      error!(error = %e, "failed to write output line");
    }
  }

  fn write(&self, record: &OutputRecord) {
    self.write_value(record);
  }
}

impl<W: Write + Send> MessageSink for JsonLinesSink<W> {
  fn emit(&self, message: Message) {
    self.write(&OutputRecord::Released { message });
  }

  fn discard(&self, key: &CorrelationKey, messages: Vec<Message>) {
    self.write(&OutputRecord::Discarded {
      correlation_key: key.clone(),
      messages,
    });
  }

  fn reject(&self, message: Message, error: &EngineError) {
    self.write(&OutputRecord::Rejected {
      message,
      error: error.to_string(),
    });
  }
}
