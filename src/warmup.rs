//! Startup warm-up: reload persisted partition states and records.

use crate::callback::StorageResult;
use crate::error::Result;
use crate::item::Item;
use crate::partition::{PartitionId, PartitionState};
use crate::store::{KvStore, SqliteStore, StatementStrategy};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupReport {
  /// Records delivered to the sink.
  pub records: u64,
  /// Rows that could not be decoded.
  pub failed: u64,
  pub partitions: BTreeMap<PartitionId, PartitionState>,
  pub elapsed: Duration,
}

/// Load partition states, then stream every stored record into `sink`.
///
/// Partition rows with an unrecognized state are skipped. Progress is
/// recorded in the store's [`EngineStats`](crate::stats::EngineStats).
pub fn warmup<S: StatementStrategy>(
  store: &mut SqliteStore<S>,
  mut sink: impl FnMut(Item),
) -> Result<WarmupReport> {
  let started = Instant::now();
  let stats = store.stats().clone();

  let mut partitions = BTreeMap::new();
  for (partition, raw) in store.list_persisted_partitions()? {
    match raw.parse::<PartitionState>() {
      Ok(state) => {
        partitions.insert(partition, state);
      }
      Err(error) => warn!(partition, state = %raw, %error, "skipping persisted partition"),
    }
  }

  let mut records = 0u64;
  let mut failed = 0u64;
  store.dump(&mut |result: StorageResult<Item>| match result {
    StorageResult::Success(item) => {
      stats.record_warmed_up();
      records += 1;
      sink(item);
    }
    StorageResult::Failure(_) => failed += 1,
  });

  let elapsed = started.elapsed();
  stats.finish_warmup(elapsed);
  info!(
    records,
    failed,
    partitions = partitions.len(),
    elapsed_ms = elapsed.as_millis() as u64,
    "warmup complete"
  );

  Ok(WarmupReport {
    records,
    failed,
    partitions,
    elapsed,
  })
}
