//! SQLite-backed [`KvStore`].
//!
//! Tracks whether this connection has a transaction open so `begin` is
//! idempotent and a commit the backend rejects (for example `SQLITE_BUSY`)
//! can be retried without issuing a new `begin`.

mod strategy;

pub use strategy::{SingleTableStrategy, StatementStrategy, Statements};

use super::{DumpSink, KvStore};
use crate::callback::{Continuation, StorageResult, StorageStatus};
use crate::error::{EmberError, Result};
use crate::item::Item;
use crate::partition::{PartitionId, PartitionState};
use crate::stats::EngineStats;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
  Closed,
  Open,
}

pub struct SqliteStore<S: StatementStrategy = SingleTableStrategy> {
  strategy: S,
  conn: Connection,
  state: TransactionState,
  stats: Arc<EngineStats>,
}

impl SqliteStore<SingleTableStrategy> {
  /// In-memory store with the single-table schema.
  pub fn in_memory() -> Result<Self> {
    Self::open(SingleTableStrategy::in_memory(), Arc::new(EngineStats::new()))
  }
}

impl<S: StatementStrategy> SqliteStore<S> {
  pub fn open(mut strategy: S, stats: Arc<EngineStats>) -> Result<Self> {
    let conn = strategy.open()?;
    strategy.init_tables(&conn)?;
    Ok(Self {
      strategy,
      conn,
      state: TransactionState::Closed,
      stats,
    })
  }

  pub fn transaction_state(&self) -> TransactionState {
    self.state
  }

  pub fn stats(&self) -> &Arc<EngineStats> {
    &self.stats
  }

  pub fn strategy(&self) -> &S {
    &self.strategy
  }

  /// Remove every record owned by `partition` in one statement.
  pub fn delete_partition(&mut self, partition: PartitionId) -> Result<bool> {
    let sql = self.strategy.statements().delete_partition;
    let removed = self.conn.prepare_cached(sql)?.execute(params![partition])?;
    debug!(partition, removed, "deleted partition rows");
    Ok(true)
  }

  /// Upsert the persisted state of `partition`.
  pub fn set_partition_state(
    &mut self,
    partition: PartitionId,
    state: PartitionState,
  ) -> Result<bool> {
    let sql = self.strategy.statements().set_partition_state;
    let changed = self
      .conn
      .prepare_cached(sql)?
      .execute(params![partition, state.as_str(), unix_now()])?;
    Ok(changed == 1)
  }

  /// Persisted partition states keyed by partition id.
  pub fn list_persisted_partitions(&mut self) -> Result<BTreeMap<PartitionId, String>> {
    let sql = self.strategy.statements().list_partitions;
    let mut stmt = self.conn.prepare_cached(sql)?;
    let rows = stmt.query_map([], |row| {
      Ok((row.get::<_, PartitionId>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut partitions = BTreeMap::new();
    for row in rows {
      let (partition, state) = row?;
      partitions.insert(partition, state);
    }
    Ok(partitions)
  }

  fn fetch(&self, key: &[u8], row_id: Option<i64>) -> Result<Option<Item>> {
    let statements = self.strategy.statements();
    if let Some(row_id) = row_id {
      let found = self
        .conn
        .prepare_cached(statements.select_by_row_id)?
        .query_row(params![row_id, key], item_from_row)
        .optional()?;
      if found.is_some() {
        return Ok(found);
      }
      debug!(row_id, "stale row id hint, falling back to key lookup");
    }

    let found = self
      .conn
      .prepare_cached(statements.select)?
      .query_row(params![key], item_from_row)
      .optional()?;
    Ok(found)
  }

  fn insert(&self, item: &Item) -> Result<Option<i64>> {
    let sql = self.strategy.statements().insert;
    let inserted = self.conn.prepare_cached(sql)?.execute(params![
      item.key(),
      item.value(),
      item.flags(),
      item.exptime(),
      item.cas() as i64,
      item.partition(),
    ])?;
    if inserted != 1 {
      return Ok(None);
    }
    Ok(Some(self.conn.last_insert_rowid()))
  }

  fn update(&self, item: &Item, row_id: i64) -> Result<Option<i64>> {
    let sql = self.strategy.statements().update;
    let updated = self.conn.prepare_cached(sql)?.execute(params![
      item.key(),
      item.value(),
      item.flags(),
      item.exptime(),
      item.cas() as i64,
      item.partition(),
      row_id,
    ])?;
    Ok((updated == 1).then_some(row_id))
  }

  fn remove(&self, key: &[u8], partition: PartitionId) -> Result<bool> {
    let sql = self.strategy.statements().delete;
    let removed = self
      .conn
      .prepare_cached(sql)?
      .execute(params![key, partition])?;
    Ok(removed > 0)
  }

  fn scan(&self, sink: DumpSink<'_>) -> Result<usize> {
    let sql = self.strategy.statements().dump;
    let mut stmt = self.conn.prepare_cached(sql)?;
    let rows = stmt.query_map([], item_from_row)?;

    let mut delivered = 0;
    for row in rows {
      match row {
        Ok(item) => sink(StorageResult::Success(item)),
        Err(error) => {
          warn!(%error, "failed to decode stored record");
          sink(StorageResult::Failure(StorageStatus::Failed));
        }
      }
      delivered += 1;
    }
    Ok(delivered)
  }
}

impl<S: StatementStrategy> KvStore for SqliteStore<S> {
  fn get(&mut self, key: &[u8], row_id: Option<i64>, cb: Continuation<Item>) {
    match self.fetch(key, row_id) {
      Ok(Some(item)) => cb.success(item),
      Ok(None) => cb.failure(StorageStatus::KeyNotFound),
      Err(error) => {
        warn!(%error, "sqlite get failed");
        cb.failure(StorageStatus::Failed)
      }
    }
  }

  fn set(&mut self, item: &Item, cb: Continuation<i64>) {
    let result = match item.row_id() {
      Some(row_id) => self.update(item, row_id),
      None => self.insert(item),
    };

    match result {
      Ok(Some(row_id)) => {
        self.stats.record_persisted();
        cb.success(row_id)
      }
      Ok(None) => {
        self.stats.record_flush_failed();
        cb.failure(StorageStatus::NotStored)
      }
      Err(error) => {
        warn!(%error, "sqlite set failed");
        self.stats.record_flush_failed();
        cb.failure(StorageStatus::Failed)
      }
    }
  }

  fn del(&mut self, key: &[u8], partition: PartitionId, cb: Continuation<bool>) {
    match self.remove(key, partition) {
      Ok(removed) => cb.success(removed),
      Err(error) => {
        warn!(%error, partition, "sqlite delete failed");
        cb.failure(StorageStatus::Failed)
      }
    }
  }

  fn dump(&mut self, sink: DumpSink<'_>) {
    match self.scan(&mut *sink) {
      Ok(delivered) => debug!(delivered, "dumped stored records"),
      Err(error) => {
        warn!(%error, "sqlite dump failed");
        sink(StorageResult::Failure(StorageStatus::Failed));
      }
    }
  }

  fn begin(&mut self) -> Result<()> {
    if self.state == TransactionState::Open {
      return Ok(());
    }
    self
      .conn
      .execute_batch(self.strategy.statements().begin)?;
    self.state = TransactionState::Open;
    Ok(())
  }

  fn commit(&mut self) -> Result<()> {
    if self.state == TransactionState::Closed {
      return Ok(());
    }

    match self.conn.execute_batch(self.strategy.statements().commit) {
      Ok(()) => {
        self.state = TransactionState::Closed;
        Ok(())
      }
      Err(error) => {
        self.stats.record_commit_failed();
        if !self.conn.is_autocommit() {
          warn!(%error, "commit rejected, transaction left open for retry");
          return Err(EmberError::TransactionStillOpen);
        }
        self.state = TransactionState::Closed;
        Err(error.into())
      }
    }
  }

  fn rollback(&mut self) -> Result<()> {
    let open = self.state == TransactionState::Open || !self.conn.is_autocommit();
    // The flag is cleared even when the statement fails.
    self.state = TransactionState::Closed;
    if !open {
      return Ok(());
    }

    if let Err(error) = self
      .conn
      .execute_batch(self.strategy.statements().rollback)
    {
      warn!(%error, "rollback failed");
      return Err(error.into());
    }
    Ok(())
  }

  fn reset(&mut self) -> Result<()> {
    if let Err(error) = self.rollback() {
      debug!(%error, "rollback during reset failed");
    }
    self.conn.flush_prepared_statement_cache();
    self.strategy.destroy_tables(&self.conn)?;
    self.strategy.init_tables(&self.conn)?;
    Ok(())
  }

  fn noop(&mut self, cb: Continuation<bool>) {
    cb.success(true)
  }
}

impl<S: StatementStrategy> Drop for SqliteStore<S> {
  fn drop(&mut self) {
    if self.state == TransactionState::Open {
      let _ = self.rollback();
    }
    self.strategy.close();
  }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
  let key: Vec<u8> = row.get(0)?;
  let value: Vec<u8> = row.get(1)?;
  let cas: i64 = row.get(4)?;
  Ok(
    Item::new(key, value)
      .with_flags(row.get(2)?)
      .with_exptime(row.get(3)?)
      .with_cas(cas as u64)
      .with_partition(row.get(5)?)
      .with_row_id(row.get(6)?),
  )
}

fn unix_now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as i64
}

#[cfg(test)]
mod tests {
  use super::{SingleTableStrategy, SqliteStore, StatementStrategy, Statements, TransactionState};
  use crate::callback::{Continuation, StorageResult, StorageStatus};
  use crate::error::Result;
  use crate::item::Item;
  use crate::partition::PartitionState;
  use crate::stats::EngineStats;
  use crate::store::KvStore;
  use rusqlite::Connection;
  use std::sync::Arc;

  /// Single-table schema whose ROLLBACK statement always errors.
  struct FailingRollback {
    inner: SingleTableStrategy,
    statements: Statements,
  }

  impl FailingRollback {
    fn new() -> Self {
      let inner = SingleTableStrategy::in_memory();
      let statements = Statements {
        rollback: "ROLLBACK TO SAVEPOINT nowhere",
        ..*inner.statements()
      };
      Self { inner, statements }
    }
  }

  impl StatementStrategy for FailingRollback {
    fn open(&mut self) -> Result<Connection> {
      self.inner.open()
    }

    fn init_tables(&self, conn: &Connection) -> Result<()> {
      self.inner.init_tables(conn)
    }

    fn destroy_tables(&self, conn: &Connection) -> Result<()> {
      self.inner.destroy_tables(conn)
    }

    fn statements(&self) -> &Statements {
      &self.statements
    }
  }

  fn set(store: &mut SqliteStore, item: &Item) -> StorageResult<i64> {
    let (cb, result) = Continuation::remembering();
    store.set(item, cb);
    result.wait_for_value()
  }

  fn get(store: &mut SqliteStore, key: &[u8], row_id: Option<i64>) -> StorageResult<Item> {
    let (cb, result) = Continuation::remembering();
    store.get(key, row_id, cb);
    result.wait_for_value()
  }

  #[test]
  fn begin_is_idempotent() {
    let mut store = SqliteStore::in_memory().expect("open");
    store.begin().expect("begin");
    store.begin().expect("second begin is a noop");
    assert_eq!(store.transaction_state(), TransactionState::Open);
    store.commit().expect("commit");
    assert_eq!(store.transaction_state(), TransactionState::Closed);
  }

  #[test]
  fn commit_without_begin_succeeds() {
    let mut store = SqliteStore::in_memory().expect("open");
    store.commit().expect("commit without begin");
    assert_eq!(store.transaction_state(), TransactionState::Closed);
  }

  #[test]
  fn rollback_discards_writes() {
    let mut store = SqliteStore::in_memory().expect("open");
    store.begin().expect("begin");
    assert!(set(&mut store, &Item::new("k", "v")).is_success());
    store.rollback().expect("rollback");
    assert_eq!(store.transaction_state(), TransactionState::Closed);
    assert_eq!(
      get(&mut store, b"k", None),
      StorageResult::Failure(StorageStatus::KeyNotFound)
    );
    store.rollback().expect("rollback with nothing open");
  }

  #[test]
  fn failed_rollback_still_closes_transaction() {
    let strategy = FailingRollback::new();
    let mut store = SqliteStore::open(strategy, Arc::new(EngineStats::new())).expect("open");
    store.begin().expect("begin");
    assert_eq!(store.transaction_state(), TransactionState::Open);

    assert!(store.rollback().is_err());
    assert_eq!(store.transaction_state(), TransactionState::Closed);
  }

  #[test]
  fn set_then_update_by_row_id() {
    let mut store = SqliteStore::in_memory().expect("open");
    let item = Item::new("user:1", "alice").with_flags(3).with_exptime(60).with_cas(11).with_partition(9);
    let row_id = set(&mut store, &item).into_payload().expect("insert");

    let fetched = get(&mut store, b"user:1", Some(row_id))
      .into_payload()
      .expect("fetch");
    assert_eq!(fetched.value(), b"alice");
    assert_eq!(fetched.flags(), 3);
    assert_eq!(fetched.exptime(), 60);
    assert_eq!(fetched.cas(), 11);
    assert_eq!(fetched.partition(), 9);
    assert_eq!(fetched.row_id(), Some(row_id));

    let updated = Item::new("user:1", "bob").with_partition(9).with_row_id(row_id);
    assert_eq!(set(&mut store, &updated), StorageResult::Success(row_id));
    let fetched = get(&mut store, b"user:1", None).into_payload().expect("fetch");
    assert_eq!(fetched.value(), b"bob");

    let stale = Item::new("user:2", "x").with_row_id(row_id + 100);
    assert_eq!(
      set(&mut store, &stale),
      StorageResult::Failure(StorageStatus::NotStored)
    );
    assert_eq!(store.stats().snapshot().total_persisted, 2);
  }

  #[test]
  fn large_cas_survives_storage() {
    let mut store = SqliteStore::in_memory().expect("open");
    set(&mut store, &Item::new("k", "v").with_cas(u64::MAX - 1));
    let fetched = get(&mut store, b"k", None).into_payload().expect("fetch");
    assert_eq!(fetched.cas(), u64::MAX - 1);
  }

  #[test]
  fn partition_states_are_upserted() {
    let mut store = SqliteStore::in_memory().expect("open");
    assert!(store
      .set_partition_state(1, PartitionState::Active)
      .expect("set"));
    assert!(store
      .set_partition_state(2, PartitionState::Replica)
      .expect("set"));
    assert!(store
      .set_partition_state(1, PartitionState::Dead)
      .expect("upsert"));

    let partitions = store.list_persisted_partitions().expect("list");
    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[&1], "dead");
    assert_eq!(partitions[&2], "replica");
  }

  #[test]
  fn reset_clears_everything() {
    let mut store = SqliteStore::in_memory().expect("open");
    set(&mut store, &Item::new("k", "v"));
    store
      .set_partition_state(3, PartitionState::Pending)
      .expect("set state");
    store.begin().expect("begin");
    store.reset().expect("reset");

    assert_eq!(store.transaction_state(), TransactionState::Closed);
    assert!(!get(&mut store, b"k", None).is_success());
    assert!(store.list_persisted_partitions().expect("list").is_empty());
  }
}
