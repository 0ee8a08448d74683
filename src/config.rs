//! Engine configuration.
//!
//! Options follow a builder style and can also be loaded from JSON; every
//! field has a default so partial documents are accepted.

use crate::error::{EmberError, Result};
use crate::protocol::TapConnectFlags;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port used when a peer string carries none.
pub const DEFAULT_PEER_PORT: u16 = 11211;

/// Options for the SQLite-backed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
  /// Database file; `None` keeps the database in memory.
  pub path: Option<PathBuf>,
  /// SQLite `journal_mode` pragma.
  pub journal_mode: String,
  /// SQLite `synchronous` pragma.
  pub synchronous: String,
  /// How long SQLite waits on a locked database before reporting busy.
  pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      path: None,
      journal_mode: "WAL".to_string(),
      synchronous: "NORMAL".to_string(),
      busy_timeout_ms: 5_000,
    }
  }
}

impl StoreOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn path(mut self, path: impl AsRef<Path>) -> Self {
    self.path = Some(path.as_ref().to_path_buf());
    self
  }

  pub fn in_memory(mut self) -> Self {
    self.path = None;
    self
  }

  pub fn journal_mode(mut self, mode: impl Into<String>) -> Self {
    self.journal_mode = mode.into();
    self
  }

  pub fn synchronous(mut self, mode: impl Into<String>) -> Self {
    self.synchronous = mode.into();
    self
  }

  pub fn busy_timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.busy_timeout_ms = timeout_ms;
    self
  }

  pub fn busy_timeout(&self) -> Duration {
    Duration::from_millis(self.busy_timeout_ms)
  }

  pub fn validate(&self) -> Result<()> {
    const JOURNAL_MODES: [&str; 6] = ["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
    const SYNC_MODES: [&str; 4] = ["OFF", "NORMAL", "FULL", "EXTRA"];

    if !JOURNAL_MODES.contains(&self.journal_mode.to_ascii_uppercase().as_str()) {
      return Err(EmberError::Config(format!(
        "unknown journal_mode: {}",
        self.journal_mode
      )));
    }
    if !SYNC_MODES.contains(&self.synchronous.to_ascii_uppercase().as_str()) {
      return Err(EmberError::Config(format!(
        "unknown synchronous mode: {}",
        self.synchronous
      )));
    }
    Ok(())
  }
}

/// Reconnect policy for a replication connection.
///
/// Ticks are control-loop iterations, each bounded by the poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Reconnect attempts after a failure; `None` retries forever.
  pub max_retries: Option<u32>,
  /// Iterations to wait after a failure before reconnecting.
  pub backoff_ticks: u32,
  /// Write-readiness timeouts tolerated while a connect is in progress.
  pub connect_timeout_ticks: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: None,
      backoff_ticks: 5,
      connect_timeout_ticks: 10,
    }
  }
}

impl RetryPolicy {
  pub fn max_retries(mut self, retries: Option<u32>) -> Self {
    self.max_retries = retries;
    self
  }

  pub fn backoff_ticks(mut self, ticks: u32) -> Self {
    self.backoff_ticks = ticks;
    self
  }

  pub fn connect_timeout_ticks(mut self, ticks: u32) -> Self {
    self.connect_timeout_ticks = ticks;
    self
  }

  /// Whether another reconnect is allowed after `retries_used` attempts.
  pub fn allows(&self, retries_used: u32) -> bool {
    self.max_retries.map_or(true, |max| retries_used < max)
  }
}

/// Options for an outbound replication connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationOptions {
  /// `host[:port]` of the peer to stream from.
  pub peer: String,
  /// Identity announced in the connect handshake.
  pub name: String,
  /// Raw connect flags (see [`TapConnectFlags`]).
  pub connect_flags: u32,
  /// Backfill start position, sent only with the backfill flag.
  pub backfill_position: u64,
  /// Upper bound on each readiness wait.
  pub poll_interval_ms: u64,
  pub retry: RetryPolicy,
}

impl Default for ReplicationOptions {
  fn default() -> Self {
    Self {
      peer: String::new(),
      name: "emberkv".to_string(),
      connect_flags: 0,
      backfill_position: 0,
      poll_interval_ms: 1_000,
      retry: RetryPolicy::default(),
    }
  }
}

impl ReplicationOptions {
  pub fn new(peer: impl Into<String>) -> Self {
    Self {
      peer: peer.into(),
      ..Self::default()
    }
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn connect_flags(mut self, flags: TapConnectFlags) -> Self {
    self.connect_flags = flags.bits();
    self
  }

  pub fn backfill_from(mut self, position: u64) -> Self {
    self.connect_flags |= TapConnectFlags::BACKFILL.bits();
    self.backfill_position = position;
    self
  }

  pub fn poll_interval_ms(mut self, interval_ms: u64) -> Self {
    self.poll_interval_ms = interval_ms;
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn flags(&self) -> TapConnectFlags {
    TapConnectFlags::from_bits_truncate(self.connect_flags)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn validate(&self) -> Result<()> {
    if self.peer.trim().is_empty() {
      return Err(EmberError::Config("replication peer is empty".to_string()));
    }
    if self.name.is_empty() || self.name.len() > usize::from(u16::MAX) {
      return Err(EmberError::Config(
        "replication name must be 1..=65535 bytes".to_string(),
      ));
    }
    if self.poll_interval_ms == 0 {
      return Err(EmberError::Config(
        "poll_interval_ms must be positive".to_string(),
      ));
    }
    if self.retry.connect_timeout_ticks == 0 {
      return Err(EmberError::Config(
        "connect_timeout_ticks must be positive".to_string(),
      ));
    }
    Ok(())
  }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub store: StoreOptions,
  /// Peers to replicate from.
  pub replication: Vec<ReplicationOptions>,
  /// Number of partitions keys are hashed over.
  pub partitions: Option<u16>,
}

impl EngineConfig {
  pub fn from_json_str(raw: &str) -> Result<Self> {
    let config: EngineConfig = serde_json::from_str(raw)
      .map_err(|error| EmberError::Serialization(format!("decode engine config: {error}")))?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    Self::from_json_str(&raw)
  }

  pub fn partition_count(&self) -> u16 {
    self.partitions.unwrap_or(1024)
  }

  pub fn validate(&self) -> Result<()> {
    self.store.validate()?;
    for replication in &self.replication {
      replication.validate()?;
    }
    if self.partitions == Some(0) {
      return Err(EmberError::Config("partitions must be positive".to_string()));
    }
    Ok(())
  }
}
