//! Engine configuration with sane defaults.

use std::time::Duration;

use crate::error::EngineError;

pub const ENV_LOCK_TIMEOUT_MS: &str = "AGGREGATOR_LOCK_TIMEOUT_MS";
pub const ENV_GROUP_TTL_MS: &str = "AGGREGATOR_GROUP_TTL_MS";
pub const ENV_REAP_INTERVAL_MS: &str = "AGGREGATOR_REAP_INTERVAL_MS";
pub const ENV_PARTIAL_ON_EXPIRY: &str = "AGGREGATOR_PARTIAL_ON_EXPIRY";

/// Timing and expiry behavior for the correlating engine.
#[derive(Debug, Clone)]
pub struct Config {
  /// Max wait for a group's lock before an admit fails with a lock timeout.
  pub lock_timeout: Duration,
  /// Groups not updated for this long are expired by the reaper.
  pub group_ttl: Duration,
  /// How often the background reaper sweeps the store.
  pub reap_interval: Duration,
  /// Reduce and emit expired groups instead of discarding them.
  pub send_partial_result_on_expiry: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      lock_timeout: Duration::from_secs(5),
      group_ttl: Duration::from_secs(60),
      reap_interval: Duration::from_secs(1),
      send_partial_result_on_expiry: false,
    }
  }
}

impl Config {
  /// Reject settings the engine cannot run with.
  pub fn validate(&self) -> Result<(), EngineError> {
    for (field, value) in [
      ("lock_timeout", self.lock_timeout),
      ("group_ttl", self.group_ttl),
      ("reap_interval", self.reap_interval),
    ] {
      if value.is_zero() {
        return Err(EngineError::config(field, "must be greater than zero"));
      }
    }
    self.group_ttl_chrono()?;
    Ok(())
  }

  pub(crate) fn group_ttl_chrono(&self) -> Result<chrono::Duration, EngineError> {
    chrono::Duration::from_std(self.group_ttl)
      .map_err(|_| EngineError::config("group_ttl", "out of range"))
  }

  /// Defaults overridden by `AGGREGATOR_*` environment variables.
  pub fn from_env_with_defaults() -> Result<Self, EngineError> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Build a config from an arbitrary variable lookup (environment, test map).
  pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    if let Some(v) = lookup(ENV_LOCK_TIMEOUT_MS) {
      config.lock_timeout = parse_millis(ENV_LOCK_TIMEOUT_MS, &v)?;
    }
    if let Some(v) = lookup(ENV_GROUP_TTL_MS) {
      config.group_ttl = parse_millis(ENV_GROUP_TTL_MS, &v)?;
    }
    if let Some(v) = lookup(ENV_REAP_INTERVAL_MS) {
      config.reap_interval = parse_millis(ENV_REAP_INTERVAL_MS, &v)?;
    }
    if let Some(v) = lookup(ENV_PARTIAL_ON_EXPIRY) {
      config.send_partial_result_on_expiry = match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => true,
        "0" | "false" | "no" => false,
        _ => return Err(EngineError::config(ENV_PARTIAL_ON_EXPIRY, "expected true|false")),
      };
    }
    config.validate()?;
    Ok(config)
  }
}

fn parse_millis(field: &str, raw: &str) -> Result<Duration, EngineError> {
  raw
    .trim()
    .parse::<u64>()
    .map(Duration::from_millis)
    .map_err(|e| EngineError::config(field, &format!("invalid milliseconds: {}", e)))
}
