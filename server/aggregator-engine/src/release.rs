//! Release strategies: decide whether a group is complete.
//!
//! Every strategy is a pure function of the group snapshot plus fixed
//! configuration, so the engine may call it repeatedly (admit, retry, expiry).

use crate::error::EngineError;
use crate::types::{Message, MessageGroup, SEQUENCE_NUMBER_HEADER, SEQUENCE_SIZE_HEADER};

pub trait ReleaseStrategy: Send + Sync {
  fn can_release(&self, group: &MessageGroup) -> bool;

  /// Whether `message` may join `group` at all. A refused message goes to the
  /// discard sink and the group is left untouched.
  fn can_add(&self, _group: &MessageGroup, _message: &Message) -> bool {
    true
  }
}

impl<F> ReleaseStrategy for F
where
  F: Fn(&MessageGroup) -> bool + Send + Sync,
{
  fn can_release(&self, group: &MessageGroup) -> bool {
    self(group)
  }
}

/// File-splitter policy: one START, N content lines, one END carrying N.
///
/// Releases when `size > 1` and the condition parses to `size - 2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerCountReleaseStrategy;

impl ReleaseStrategy for MarkerCountReleaseStrategy {
  fn can_release(&self, group: &MessageGroup) -> bool {
    let size = group.size();
    if size <= 1 {
      return false;
    }
    match group.condition().and_then(|c| c.trim().parse::<usize>().ok()) {
      Some(expected) => expected == size - 2,
      None => false,
    }
  }
}

/// Releases once the group holds as many messages as the first message's
/// `sequenceSize` header announces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceSizeReleaseStrategy;

impl ReleaseStrategy for SequenceSizeReleaseStrategy {
  fn can_release(&self, group: &MessageGroup) -> bool {
    match group.first().and_then(|m| m.header_u64(SEQUENCE_SIZE_HEADER)) {
      Some(expected) if expected > 0 => group.size() as u64 >= expected,
      _ => false,
    }
  }

  /// Refuses a numbered message whose sequence number is already in the group
  /// or whose sequence size disagrees with the group's. Unnumbered messages pass.
  fn can_add(&self, group: &MessageGroup, message: &Message) -> bool {
    let first = match group.first() {
      Some(m) => m,
      None => return true,
    };
    let number = match message.header_u64(SEQUENCE_NUMBER_HEADER) {
      Some(n) if n > 0 => n,
      _ => return true,
    };
    if message.header_u64(SEQUENCE_SIZE_HEADER) != first.header_u64(SEQUENCE_SIZE_HEADER) {
      return false;
    }
    !group
      .messages()
      .iter()
      .any(|m| m.header_u64(SEQUENCE_NUMBER_HEADER) == Some(number))
  }
}

/// Releases once the group holds `threshold` messages.
#[derive(Debug, Clone, Copy)]
pub struct MessageCountReleaseStrategy {
  threshold: usize,
}

impl MessageCountReleaseStrategy {
  pub fn new(threshold: usize) -> Result<Self, EngineError> {
    if threshold == 0 {
      return Err(EngineError::config("threshold", "must be at least 1"));
    }
    Ok(Self { threshold })
  }
}

impl ReleaseStrategy for MessageCountReleaseStrategy {
  fn can_release(&self, group: &MessageGroup) -> bool {
    group.size() >= self.threshold
  }
}
