//! Background reaper: a dedicated thread that expires stale groups on a fixed interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::engine::CorrelatingEngine;
use crate::error::EngineError;

#[derive(Default)]
struct StopSignal {
  stopped: Mutex<bool>,
  wake: Condvar,
}

/// Running reaper. Stops (and joins) on [`ReaperHandle::stop`] or drop.
pub struct ReaperHandle {
  signal: Arc<StopSignal>,
  thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
  pub fn spawn(engine: Arc<CorrelatingEngine>, interval: Duration) -> Result<Self, EngineError> {
    let signal = Arc::new(StopSignal::default());
    let thread_signal = Arc::clone(&signal);
    let thread = thread::Builder::new()
      .name("aggregator-reaper".into())
      .spawn(move || run(engine, interval, thread_signal))?;
    debug!(interval_ms = interval.as_millis() as u64, "reaper started");
    Ok(Self {
      signal,
      thread: Some(thread),
    })
  }

  pub fn is_running(&self) -> bool {
    self.thread.as_ref().is_some_and(|t| !t.is_finished())
  }

  pub fn stop(mut self) {
    self.shutdown();
  }

  fn shutdown(&mut self) {
    {
      let mut stopped = self.signal.stopped.lock();
      *stopped = true;
      self.signal.wake.notify_all();
    }
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error!("reaper thread panicked");
      }
    }
  }
}

impl Drop for ReaperHandle {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn run(engine: Arc<CorrelatingEngine>, interval: Duration, signal: Arc<StopSignal>) {
  loop {
    {
      let mut stopped = signal.stopped.lock();
      if !*stopped {
        signal.wake.wait_for(&mut stopped, interval);
      }
      if *stopped {
        break;
      }
    }
    if let Err(e) = engine.reap(Utc::now()) {
      error!(error = %e, "reaper pass failed");
    }
  }
  debug!("reaper stopped");
}

impl CorrelatingEngine {
  /// Start the background reaper at the configured `reap_interval`.
  pub fn start_reaper(self: &Arc<Self>) -> Result<ReaperHandle, EngineError> {
    ReaperHandle::spawn(Arc::clone(self), self.config().reap_interval)
  }
}
