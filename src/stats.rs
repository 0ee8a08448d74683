//! Engine-wide counters.
//!
//! Counters are increment-only (apart from warm-up bookkeeping) and are read
//! through [`EngineStats::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EngineStats {
  total_persisted: AtomicU64,
  commit_failed: AtomicU64,
  flush_failed: AtomicU64,
  warmed_up: AtomicU64,
  warmup_complete: AtomicBool,
  warmup_time_ms: AtomicU64,
  replication_fetched: AtomicU64,
  replication_ignored: AtomicU64,
  acks_received: AtomicU64,
  negative_acks: AtomicU64,
  reconnects: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub total_persisted: u64,
  pub commit_failed: u64,
  pub flush_failed: u64,
  pub warmed_up: u64,
  pub warmup_complete: bool,
  pub warmup_time_ms: u64,
  pub replication_fetched: u64,
  pub replication_ignored: u64,
  pub acks_received: u64,
  pub negative_acks: u64,
  pub reconnects: u64,
}

impl EngineStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_persisted(&self) {
    self.total_persisted.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_commit_failed(&self) {
    self.commit_failed.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_flush_failed(&self) {
    self.flush_failed.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_warmed_up(&self) {
    self.warmed_up.fetch_add(1, Ordering::Relaxed);
  }

  pub fn finish_warmup(&self, elapsed: Duration) {
    self
      .warmup_time_ms
      .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    self.warmup_complete.store(true, Ordering::Release);
  }

  pub fn record_replication_fetched(&self) {
    self.replication_fetched.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_replication_ignored(&self) {
    self.replication_ignored.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_ack(&self, positive: bool) {
    self.acks_received.fetch_add(1, Ordering::Relaxed);
    if !positive {
      self.negative_acks.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_reconnect(&self) {
    self.reconnects.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      total_persisted: self.total_persisted.load(Ordering::Relaxed),
      commit_failed: self.commit_failed.load(Ordering::Relaxed),
      flush_failed: self.flush_failed.load(Ordering::Relaxed),
      warmed_up: self.warmed_up.load(Ordering::Relaxed),
      warmup_complete: self.warmup_complete.load(Ordering::Acquire),
      warmup_time_ms: self.warmup_time_ms.load(Ordering::Relaxed),
      replication_fetched: self.replication_fetched.load(Ordering::Relaxed),
      replication_ignored: self.replication_ignored.load(Ordering::Relaxed),
      acks_received: self.acks_received.load(Ordering::Relaxed),
      negative_acks: self.negative_acks.load(Ordering::Relaxed),
      reconnects: self.reconnects.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::EngineStats;
  use std::time::Duration;

  #[test]
  fn counters_accumulate() {
    let stats = EngineStats::new();
    stats.record_persisted();
    stats.record_persisted();
    stats.record_ack(true);
    stats.record_ack(false);
    stats.finish_warmup(Duration::from_millis(15));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total_persisted, 2);
    assert_eq!(snapshot.acks_received, 2);
    assert_eq!(snapshot.negative_acks, 1);
    assert!(snapshot.warmup_complete);
    assert_eq!(snapshot.warmup_time_ms, 15);
  }
}
