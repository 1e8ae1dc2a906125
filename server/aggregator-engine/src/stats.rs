//! Per-engine counters. Owned by one engine instance, never process-wide.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EngineStats {
  submitted: AtomicU64,
  rejected: AtomicU64,
  released: AtomicU64,
  expired: AtomicU64,
  discarded_messages: AtomicU64,
  processor_failures: AtomicU64,
  lock_timeouts: AtomicU64,
  refused: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub submitted: u64,
  pub rejected: u64,
  pub released: u64,
  pub expired: u64,
  pub discarded_messages: u64,
  pub processor_failures: u64,
  pub lock_timeouts: u64,
  /// Messages refused by the group they correlated to (duplicate sequence numbers).
  pub refused: u64,
}

impl EngineStats {
  pub fn record_submitted(&self) {
    self.submitted.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_rejected(&self) {
    self.rejected.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_released(&self) {
    self.released.fetch_add(1, Ordering::Relaxed);
  }

  /// One expired group whose `messages` went to the discard sink.
  pub fn record_expired(&self, messages: usize) {
    self.expired.fetch_add(1, Ordering::Relaxed);
    self
      .discarded_messages
      .fetch_add(messages as u64, Ordering::Relaxed);
  }

  pub fn record_processor_failure(&self) {
    self.processor_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_lock_timeout(&self) {
    self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_refused(&self) {
    self.refused.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      submitted: self.submitted.load(Ordering::Relaxed),
      rejected: self.rejected.load(Ordering::Relaxed),
      released: self.released.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
      discarded_messages: self.discarded_messages.load(Ordering::Relaxed),
      processor_failures: self.processor_failures.load(Ordering::Relaxed),
      lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
      refused: self.refused.load(Ordering::Relaxed),
    }
  }
}
