//! Core engine: correlates inbound messages into groups, releases complete
//! groups exactly once, expires the ones that never complete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::condition::{GroupConditionProvider, MarkerLineCountCondition, NoCondition};
use crate::config::Config;
use crate::correlation::{CorrelationStrategy, HeaderCorrelationStrategy};
use crate::error::EngineError;
use crate::processor::{self, ContentPayloadProcessor, MessageGroupProcessor};
use crate::release::{MarkerCountReleaseStrategy, ReleaseStrategy, SequenceSizeReleaseStrategy};
use crate::sink::MessageSink;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{InMemoryGroupStore, LockedGroup, MessageGroupStore};
use crate::types::*;

/// The four pluggable policies of an engine.
pub struct Strategies {
  pub correlation: Box<dyn CorrelationStrategy>,
  pub condition: Box<dyn GroupConditionProvider>,
  pub release: Box<dyn ReleaseStrategy>,
  pub processor: Box<dyn MessageGroupProcessor>,
  /// Header that carries the correlation key on released messages.
  pub output_key_header: Option<String>,
}

impl Default for Strategies {
  /// `correlationId` header, no condition, sequence-size release, content payloads.
  fn default() -> Self {
    Self {
      correlation: Box::new(HeaderCorrelationStrategy::default()),
      condition: Box::new(NoCondition),
      release: Box::new(SequenceSizeReleaseStrategy),
      processor: Box::new(ContentPayloadProcessor),
      output_key_header: None,
    }
  }
}

impl Strategies {
  /// START / lines / END{lineCount} groups keyed by `key_header` (e.g. the file name).
  pub fn file_splitter(key_header: &str) -> Self {
    Self {
      correlation: Box::new(HeaderCorrelationStrategy::new(key_header)),
      condition: Box::new(MarkerLineCountCondition),
      release: Box::new(MarkerCountReleaseStrategy),
      processor: Box::new(ContentPayloadProcessor),
      output_key_header: Some(key_header.to_string()),
    }
  }
}

/// Outcome of one admit-or-release step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
  /// Group is still waiting for more messages.
  Pending { key: CorrelationKey, size: usize },
  /// Group was reduced, emitted and removed.
  Released { key: CorrelationKey, size: usize },
  /// Nothing stored under the key (retry only).
  NoGroup { key: CorrelationKey },
  /// The group refused the message (e.g. a duplicate sequence number); it went to `discard`.
  Refused { key: CorrelationKey, size: usize },
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
  pub discarded: usize,
  pub partially_released: usize,
  pub empty_dropped: usize,
  /// Groups a flush could not lock in time; they are still live.
  pub busy: usize,
}

/// The correlating engine. Share it across worker threads behind an `Arc`.
pub struct CorrelatingEngine {
  config: Config,
  group_ttl: chrono::Duration,
  strategies: Strategies,
  store: Box<dyn MessageGroupStore>,
  sink: Arc<dyn MessageSink>,
  stats: EngineStats,
}

impl CorrelatingEngine {
  pub fn new(
    config: Config,
    strategies: Strategies,
    sink: Arc<dyn MessageSink>,
  ) -> Result<Self, EngineError> {
    Self::with_store(config, strategies, Box::new(InMemoryGroupStore::new()), sink)
  }

  pub fn with_store(
    config: Config,
    strategies: Strategies,
    store: Box<dyn MessageGroupStore>,
    sink: Arc<dyn MessageSink>,
  ) -> Result<Self, EngineError> {
    config.validate()?;
    let group_ttl = config.group_ttl_chrono()?;
    Ok(Self {
      config,
      group_ttl,
      strategies,
      store,
      sink,
      stats: EngineStats::default(),
    })
  }

  pub fn with_defaults(sink: Arc<dyn MessageSink>) -> Result<Self, EngineError> {
    Self::new(Config::default(), Strategies::default(), sink)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Admit one inbound message.
  ///
  /// Correlation failures reject the message without touching any group.
  /// Lock timeouts leave the group untouched and may be retried as a whole.
  /// Processor failures keep the group pending.
  pub fn submit(&self, message: Message) -> Result<Admission, EngineError> {
    self.stats.record_submitted();

    let key = match self.strategies.correlation.correlation_key(&message) {
      Ok(k) => k,
      Err(e) => {
        warn!(message_id = %message.id(), error = %e, "rejecting uncorrelatable message");
        self.stats.record_rejected();
        self.sink.reject(message, &e);
        return Err(e);
      }
    };

    let now = Utc::now();
    let mut locked = self
      .store
      .fetch_or_create(&key, now, self.config.lock_timeout)
      .map_err(|e| self.note_lock_error(e))?;

    if !self.strategies.release.can_add(locked.group(), &message) {
      let size = locked.group().size();
      drop(locked);
      warn!(key = %key, message_id = %message.id(), "group refused message, discarding it");
      self.stats.record_refused();
      self.sink.discard(&key, vec![message]);
      return Ok(Admission::Refused { key, size });
    }

    // Pure in (message, previous condition); computed first so a failed append changes nothing.
    let condition = self
      .strategies
      .condition
      .condition(&message, locked.group().condition());
    let message_id = message.id();
    self.store.append(&mut locked, message, now)?;
    locked.group_mut().set_condition(condition);

    debug!(
      key = %key,
      message_id = %message_id,
      size = locked.group().size(),
      condition = ?locked.group().condition(),
      "admitted message"
    );

    self.try_release(locked)
  }

  /// Re-evaluate an existing group and, if releasable, attempt processing again.
  ///
  /// This is the retry path after a [`EngineError::Processor`] failure.
  pub fn retry(&self, key: &CorrelationKey) -> Result<Admission, EngineError> {
    match self
      .store
      .lock_existing(key, self.config.lock_timeout)
      .map_err(|e| self.note_lock_error(e))?
    {
      Some(locked) => self.try_release(locked),
      None => Ok(Admission::NoGroup { key: key.clone() }),
    }
  }

  /// Expire every group idle for longer than the group TTL as of `now`.
  pub fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport, EngineError> {
    let expired = self.store.sweep_expired(self.group_ttl, now)?;
    let mut report = ReapReport::default();
    for group in expired {
      self.expire(group, &mut report);
    }
    if report != ReapReport::default() {
      info!(
        discarded = report.discarded,
        partially_released = report.partially_released,
        empty_dropped = report.empty_dropped,
        "reaper pass"
      );
    }
    Ok(report)
  }

  /// Expire every group regardless of age (shutdown).
  ///
  /// Groups still locked after the lock timeout are left live and counted in
  /// [`ReapReport::busy`]; call again once their admits finish.
  pub fn flush(&self) -> Result<ReapReport, EngineError> {
    let drained = self.store.drain(self.config.lock_timeout)?;
    let mut report = ReapReport {
      busy: drained.busy.len(),
      ..ReapReport::default()
    };
    for group in drained.groups {
      self.expire(group, &mut report);
    }
    if report.busy > 0 {
      warn!(busy = report.busy, "flush left locked groups in the store");
    }
    Ok(report)
  }

  /// Defensive copy of the group for `key`, if one is live.
  pub fn group_snapshot(&self, key: &CorrelationKey) -> Option<MessageGroup> {
    self.store.snapshot(key)
  }

  /// Live groups.
  pub fn group_count(&self) -> usize {
    self.store.len()
  }

  /// Live per-key lock entries. Drops back to zero once every group is released or expired.
  pub fn lock_count(&self) -> usize {
    self.store.lock_count()
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  // -------------------------------------------------------------------------
  // internals
  // -------------------------------------------------------------------------

  fn note_lock_error(&self, e: EngineError) -> EngineError {
    if let EngineError::LockTimeout { key, waited } = &e {
      warn!(key = %key, waited_ms = waited.as_millis() as u64, "group lock timeout");
      self.stats.record_lock_timeout();
    }
    e
  }

  /// Steps 5-7 of the admit algorithm. The lock is released when `locked` drops.
  fn try_release(&self, mut locked: LockedGroup) -> Result<Admission, EngineError> {
    let key = locked.key().clone();
    let size = locked.group().size();

    if !self.strategies.release.can_release(locked.group()) {
      return Ok(Admission::Pending { key, size });
    }

    locked.group_mut().set_state(GroupState::Releasing);
    match self.strategies.processor.process_group(locked.group()) {
      Ok(payload) => {
        let output = processor::build_output(
          locked.group(),
          payload,
          self.strategies.output_key_header.as_deref(),
        );
        self.sink.emit(output);
        self.store.remove(locked, GroupState::Complete);
        self.stats.record_released();
        info!(key = %key, size, "released group");
        Ok(Admission::Released { key, size })
      }
      Err(e) => {
        locked.group_mut().set_state(GroupState::Pending);
        self.stats.record_processor_failure();
        let err = e.into_engine_error(&key);
        warn!(key = %key, size, error = %err, retryable = err.is_retryable(), "group processing failed");
        if !err.is_retryable() {
          if let Some(last) = locked.group().messages().last().cloned() {
            self.stats.record_rejected();
            self.sink.reject(last, &err);
          }
        }
        Err(err)
      }
    }
  }

  /// Hand an already-removed group to the discard sink (or, if configured,
  /// reduce and emit it as a partial result).
  fn expire(&self, group: MessageGroup, report: &mut ReapReport) {
    let key = group.key().clone();

    if group.is_empty() {
      debug!(key = %key, "dropping empty group");
      report.empty_dropped += 1;
      return;
    }

    if self.config.send_partial_result_on_expiry {
      match self.strategies.processor.process_group(&group) {
        Ok(payload) => {
          let output = processor::build_output(
            &group,
            payload,
            self.strategies.output_key_header.as_deref(),
          );
          info!(key = %key, size = group.size(), "releasing partial group on expiry");
          self.sink.emit(output);
          self.stats.record_released();
          report.partially_released += 1;
          return;
        }
        Err(e) => {
          self.stats.record_processor_failure();
          warn!(key = %key, error = %e, "partial release failed, discarding group");
        }
      }
    }

    let size = group.size();
    info!(key = %key, size, "discarding expired group");
    self.stats.record_expired(size);
    self.sink.discard(&key, group.into_messages());
    report.discarded += 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ProcessorError;
  use crate::sink::CollectingSink;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn start(file: &str) -> Message {
    Message::new(Value::Null)
      .with_header("file_name", file)
      .with_header(MARKER_HEADER, MARKER_START)
  }

  fn line(file: &str, text: &str) -> Message {
    Message::new(text).with_header("file_name", file)
  }

  fn end(file: &str, lines: u64) -> Message {
    Message::new(Value::Null)
      .with_header("file_name", file)
      .with_header(MARKER_HEADER, MARKER_END)
      .with_header(LINE_COUNT_HEADER, lines)
  }

  fn file_engine() -> (CorrelatingEngine, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let engine =
      CorrelatingEngine::new(Config::default(), Strategies::file_splitter("file_name"), sink.clone())
        .unwrap();
    (engine, sink)
  }

  #[test]
  fn marker_count_scenario_releases_on_fifth_admit() {
    let (engine, sink) = file_engine();
    let key = CorrelationKey::from("K");

    for m in [start("K"), line("K", "L1"), line("K", "L2"), line("K", "L3")] {
      let admission = engine.submit(m).unwrap();
      assert!(matches!(admission, Admission::Pending { .. }));
    }
    assert!(sink.released().is_empty());

    let admission = engine.submit(end("K", 3)).unwrap();
    assert_eq!(admission, Admission::Released { key: key.clone(), size: 5 });

    let released = sink.released();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload(), &json!(["L1", "L2", "L3"]));
    assert_eq!(released[0].header_str("file_name"), Some("K"));
    assert!(engine.group_snapshot(&key).is_none());
    assert_eq!(engine.group_count(), 0);
  }

  #[test]
  fn markers_only_release_empty_sequence() {
    let (engine, sink) = file_engine();
    engine.submit(start("K")).unwrap();
    engine.submit(end("K", 0)).unwrap();
    assert_eq!(sink.released()[0].payload(), &json!([]));
  }

  #[test]
  fn resubmitting_after_release_starts_new_group() {
    let (engine, _sink) = file_engine();
    engine.submit(start("K")).unwrap();
    engine.submit(end("K", 0)).unwrap();

    let admission = engine.submit(start("K")).unwrap();
    assert_eq!(admission, Admission::Pending { key: CorrelationKey::from("K"), size: 1 });
  }

  #[test]
  fn uncorrelatable_message_is_rejected() {
    let (engine, sink) = file_engine();
    let err = engine.submit(Message::new("orphan")).unwrap_err();
    assert!(matches!(err, EngineError::Correlation { .. }));
    assert_eq!(sink.rejected().len(), 1);
    assert_eq!(engine.group_count(), 0);
    assert_eq!(engine.stats().rejected, 1);
  }

  #[test]
  fn condition_tracks_end_marker() {
    let (engine, _sink) = file_engine();
    engine.submit(start("K")).unwrap();
    engine.submit(end("K", 2)).unwrap();
    let snap = engine.group_snapshot(&CorrelationKey::from("K")).unwrap();
    assert_eq!(snap.condition(), Some("2"));
    assert_eq!(snap.state(), GroupState::Pending);
  }

  #[test]
  fn processor_failure_keeps_group_then_retry_releases_once() {
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = move |g: &MessageGroup| -> Result<Value, ProcessorError> {
      if counter.fetch_add(1, Ordering::SeqCst) == 0 {
        return Err(ProcessorError::retryable("downstream busy"));
      }
      ContentPayloadProcessor.process_group(g)
    };
    let strategies = Strategies {
      processor: Box::new(flaky),
      ..Strategies::file_splitter("file_name")
    };
    let engine = CorrelatingEngine::new(Config::default(), strategies, sink.clone()).unwrap();
    let key = CorrelationKey::from("K");

    engine.submit(start("K")).unwrap();
    engine.submit(line("K", "L1")).unwrap();
    let err = engine.submit(end("K", 1)).unwrap_err();
    assert!(err.is_retryable());
    assert!(sink.released().is_empty());

    let snap = engine.group_snapshot(&key).unwrap();
    assert_eq!(snap.size(), 3);
    assert_eq!(snap.state(), GroupState::Pending);

    let admission = engine.retry(&key).unwrap();
    assert_eq!(admission, Admission::Released { key: key.clone(), size: 3 });
    assert_eq!(sink.released().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.retry(&key).unwrap(), Admission::NoGroup { key });
    assert_eq!(engine.stats().processor_failures, 1);
    assert_eq!(engine.stats().released, 1);
  }

  #[test]
  fn fatal_processor_error_rejects_trigger_but_keeps_group() {
    let sink = Arc::new(CollectingSink::new());
    let strategies = Strategies {
      processor: Box::new(|_: &MessageGroup| -> Result<Value, ProcessorError> {
        Err(ProcessorError::fatal("cannot reduce"))
      }),
      ..Strategies::file_splitter("file_name")
    };
    let engine = CorrelatingEngine::new(Config::default(), strategies, sink.clone()).unwrap();

    engine.submit(start("K")).unwrap();
    let err = engine.submit(end("K", 0)).unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(sink.rejected().len(), 1);
    assert_eq!(engine.group_snapshot(&CorrelationKey::from("K")).unwrap().size(), 2);
  }

  #[test]
  fn expired_group_is_discarded_not_processed() {
    let sink = Arc::new(CollectingSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let strategies = Strategies {
      processor: Box::new(move |g: &MessageGroup| -> Result<Value, ProcessorError> {
        counter.fetch_add(1, Ordering::SeqCst);
        ContentPayloadProcessor.process_group(g)
      }),
      ..Strategies::file_splitter("file_name")
    };
    let engine = CorrelatingEngine::new(Config::default(), strategies, sink.clone()).unwrap();

    engine.submit(start("K")).unwrap();
    let later = Utc::now() + chrono::Duration::seconds(61);
    let report = engine.reap(later).unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let discarded = sink.discarded();
    assert_eq!(discarded[0].0, CorrelationKey::from("K"));
    assert_eq!(discarded[0].1.len(), 1);
    assert_eq!(engine.group_count(), 0);
    assert_eq!(engine.stats().expired, 1);
  }

  #[test]
  fn fresh_groups_survive_reaping() {
    let (engine, sink) = file_engine();
    engine.submit(start("K")).unwrap();
    let report = engine.reap(Utc::now()).unwrap();
    assert_eq!(report, ReapReport::default());
    assert!(sink.records().is_empty());
    assert_eq!(engine.group_count(), 1);
  }

  #[test]
  fn partial_result_on_expiry_when_enabled() {
    let sink = Arc::new(CollectingSink::new());
    let config = Config {
      send_partial_result_on_expiry: true,
      ..Config::default()
    };
    let engine =
      CorrelatingEngine::new(config, Strategies::file_splitter("file_name"), sink.clone()).unwrap();
    engine.submit(start("K")).unwrap();
    engine.submit(line("K", "L1")).unwrap();

    let report = engine.reap(Utc::now() + chrono::Duration::seconds(120)).unwrap();
    assert_eq!(report.partially_released, 1);
    assert_eq!(sink.released()[0].payload(), &json!(["L1"]));
    assert!(sink.discarded().is_empty());
  }

  #[test]
  fn flush_discards_everything() {
    let (engine, sink) = file_engine();
    engine.submit(start("A")).unwrap();
    engine.submit(start("B")).unwrap();
    let report = engine.flush().unwrap();
    assert_eq!(report.discarded, 2);
    assert_eq!(sink.discarded().len(), 2);
    assert_eq!(engine.group_count(), 0);
  }

  #[test]
  fn flush_with_a_busy_group_discards_everything_it_removed() {
    let sink = Arc::new(CollectingSink::new());
    let config = Config {
      lock_timeout: std::time::Duration::from_millis(20),
      ..Config::default()
    };
    let engine =
      CorrelatingEngine::new(config, Strategies::file_splitter("file_name"), sink.clone()).unwrap();
    for f in 0..20 {
      engine.submit(start(&format!("f{}", f))).unwrap();
    }
    let busy = CorrelationKey::from("busy");
    let held = engine
      .store
      .fetch_or_create(&busy, Utc::now(), engine.config.lock_timeout)
      .unwrap();

    let report = engine.flush().unwrap();
    assert_eq!(report.discarded, 20);
    assert_eq!(report.busy, 1);
    assert_eq!(sink.discarded().len(), 20);
    assert_eq!(engine.group_count(), 1);

    drop(held);
    let report = engine.flush().unwrap();
    assert_eq!(report.empty_dropped, 1);
    assert_eq!(report.busy, 0);
    assert_eq!(engine.lock_count(), 0);
  }

  #[test]
  fn locks_are_reclaimed_after_release_and_expiry() {
    let (engine, _sink) = file_engine();
    engine.submit(start("A")).unwrap();
    engine.submit(start("B")).unwrap();
    assert_eq!(engine.lock_count(), 2);

    engine.submit(end("A", 0)).unwrap();
    assert_eq!(engine.lock_count(), 1);

    engine.reap(Utc::now() + chrono::Duration::seconds(61)).unwrap();
    assert_eq!(engine.lock_count(), 0);
  }

  #[test]
  fn empty_group_expires_without_discard() {
    let (engine, sink) = file_engine();
    let key = CorrelationKey::from("K");
    // Creator never appended (e.g. it gave up after a lock timeout).
    drop(
      engine
        .store
        .fetch_or_create(&key, Utc::now(), engine.config.lock_timeout)
        .unwrap(),
    );
    assert_eq!(engine.lock_count(), 1);

    let report = engine.reap(Utc::now() + chrono::Duration::seconds(61)).unwrap();
    assert_eq!(report.empty_dropped, 1);
    assert_eq!(report.discarded, 0);
    assert!(sink.records().is_empty());
    assert_eq!(engine.lock_count(), 0);
    assert_eq!(engine.stats().expired, 0);
  }

  #[test]
  fn duplicate_sequence_number_is_refused_and_discarded() {
    let sink = Arc::new(CollectingSink::new());
    let engine = CorrelatingEngine::with_defaults(sink.clone()).unwrap();
    let m = |n: u64| {
      Message::new(n)
        .with_header(CORRELATION_ID_HEADER, "order-9")
        .with_header(SEQUENCE_SIZE_HEADER, 3)
        .with_header(SEQUENCE_NUMBER_HEADER, n)
    };
    let key = CorrelationKey::from("order-9");

    engine.submit(m(1)).unwrap();
    assert_eq!(engine.submit(m(1)).unwrap(), Admission::Refused { key: key.clone(), size: 1 });
    engine.submit(m(2)).unwrap();
    assert!(sink.released().is_empty());
    assert_eq!(engine.group_snapshot(&key).unwrap().size(), 2);

    engine.submit(m(3)).unwrap();
    let released = sink.released();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload(), &json!([1, 2, 3]));
    let discarded = sink.discarded();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].1[0].payload(), &json!(1));
    assert_eq!(engine.stats().refused, 1);
  }

  #[test]
  fn mismatched_sequence_size_is_refused() {
    let sink = Arc::new(CollectingSink::new());
    let engine = CorrelatingEngine::with_defaults(sink.clone()).unwrap();
    let m = |n: u64, size: u64| {
      Message::new(n)
        .with_header(CORRELATION_ID_HEADER, "k")
        .with_header(SEQUENCE_SIZE_HEADER, size)
        .with_header(SEQUENCE_NUMBER_HEADER, n)
    };
    engine.submit(m(1, 2)).unwrap();
    assert!(matches!(engine.submit(m(2, 5)).unwrap(), Admission::Refused { .. }));
    assert_eq!(sink.discarded().len(), 1);
  }

  #[test]
  fn default_strategies_use_sequence_size() {
    let sink = Arc::new(CollectingSink::new());
    let engine = CorrelatingEngine::with_defaults(sink.clone()).unwrap();
    for n in 1..=3 {
      let m = Message::new(n)
        .with_header(CORRELATION_ID_HEADER, "order-7")
        .with_header(SEQUENCE_SIZE_HEADER, 3)
        .with_header(SEQUENCE_NUMBER_HEADER, n);
      engine.submit(m).unwrap();
    }
    let released = sink.released();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].payload(), &json!([1, 2, 3]));
    assert_eq!(released[0].header_str(CORRELATION_ID_HEADER), Some("order-7"));
    assert_eq!(released[0].header_u64(SEQUENCE_SIZE_HEADER), Some(3));
    assert!(released[0].header(SEQUENCE_NUMBER_HEADER).is_none());
  }

  #[test]
  fn invalid_config_is_rejected() {
    let config = Config {
      reap_interval: std::time::Duration::ZERO,
      ..Config::default()
    };
    let sink = Arc::new(CollectingSink::new());
    assert!(CorrelatingEngine::new(config, Strategies::default(), sink).is_err());
  }
}
