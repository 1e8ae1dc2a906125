//! Group condition providers: a compact summary carried by each group,
//! recomputed from `(incoming message, previous condition)` on every admit.

use crate::types::{Message, LINE_COUNT_HEADER, MARKER_END, MARKER_HEADER};

pub trait GroupConditionProvider: Send + Sync {
  fn condition(&self, message: &Message, existing: Option<&str>) -> Option<String>;
}

impl<F> GroupConditionProvider for F
where
  F: Fn(&Message, Option<&str>) -> Option<String> + Send + Sync,
{
  fn condition(&self, message: &Message, existing: Option<&str>) -> Option<String> {
    self(message, existing)
  }
}

/// Leaves the condition untouched. Used when the release strategy ignores it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCondition;

impl GroupConditionProvider for NoCondition {
  fn condition(&self, _message: &Message, existing: Option<&str>) -> Option<String> {
    existing.map(str::to_string)
  }
}

/// File-splitter policy: an END marker carrying `lineCount` sets the condition
/// to that count. Anything else keeps the previous condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerLineCountCondition;

impl GroupConditionProvider for MarkerLineCountCondition {
  fn condition(&self, message: &Message, existing: Option<&str>) -> Option<String> {
    if message.header_str(MARKER_HEADER) == Some(MARKER_END) {
      if let Some(count) = message.header_u64(LINE_COUNT_HEADER) {
        return Some(count.to_string());
      }
    }
    existing.map(str::to_string)
  }
}
