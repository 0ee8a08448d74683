//! Storage abstraction.
//!
//! [`KvStore`] is the full capability set the engine drives: data operations
//! that report through a [`Continuation`] plus explicit transaction control.
//! Backends without transactions implement the smaller [`DataStore`] and are
//! lifted into a `KvStore` by [`AutoCommit`].
//!
//! Stores take `&mut self`: a store instance is owned by one execution
//! context (typically a persistence thread) and is never shared unsynchronized.

pub mod memory;
pub mod sqlite;

use crate::callback::{Continuation, StorageResult};
use crate::error::Result;
use crate::item::Item;
use crate::partition::PartitionId;

pub use memory::MemoryStore;
pub use sqlite::{SingleTableStrategy, SqliteStore, StatementStrategy, TransactionState};

/// Sink receiving one result per record during a full scan.
pub type DumpSink<'a> = &'a mut dyn FnMut(StorageResult<Item>);

/// Storage with explicit transaction control.
///
/// Data operations fire their continuation exactly once; failures are
/// reported as [`StorageResult::Failure`] rather than returned, because the
/// continuation may run on a different thread than the caller.
pub trait KvStore {
  /// Look up `key`, using `row_id` for direct access when known.
  fn get(&mut self, key: &[u8], row_id: Option<i64>, cb: Continuation<Item>);

  /// Persist `item`; delivers the row id the record now lives at.
  ///
  /// An item carrying a row id updates that row. Without one the SQLite
  /// store inserts a new row, so setting a known key again leaves an older
  /// row behind that `dump` still delivers; `get` by key returns the newest.
  /// Callers update by passing the row id from a prior `get`, as
  /// [`StoreIngest`](crate::replication::StoreIngest) does. [`MemoryStore`]
  /// keeps a single record per key either way.
  fn set(&mut self, item: &Item, cb: Continuation<i64>);

  /// Delete `key` in `partition`; delivers whether a record was removed.
  fn del(&mut self, key: &[u8], partition: PartitionId, cb: Continuation<bool>);

  /// Deliver every stored record to `sink`.
  fn dump(&mut self, sink: DumpSink<'_>);

  fn begin(&mut self) -> Result<()>;

  fn commit(&mut self) -> Result<()>;

  fn rollback(&mut self) -> Result<()>;

  /// Drop all data and return to a clean state.
  fn reset(&mut self) -> Result<()>;

  /// Fires once the backend has drained the work queued before it.
  fn noop(&mut self, cb: Continuation<bool>);
}

/// Storage without transactions.
pub trait DataStore {
  fn get(&mut self, key: &[u8], row_id: Option<i64>, cb: Continuation<Item>);

  fn set(&mut self, item: &Item, cb: Continuation<i64>);

  fn del(&mut self, key: &[u8], partition: PartitionId, cb: Continuation<bool>);

  fn dump(&mut self, sink: DumpSink<'_>);

  fn reset(&mut self) -> Result<()>;
}

/// Lifts a [`DataStore`] into a [`KvStore`] whose transaction control
/// always succeeds without doing anything.
#[derive(Debug, Default)]
pub struct AutoCommit<S> {
  inner: S,
}

impl<S: DataStore> AutoCommit<S> {
  pub fn new(inner: S) -> Self {
    Self { inner }
  }

  pub fn inner(&self) -> &S {
    &self.inner
  }

  pub fn into_inner(self) -> S {
    self.inner
  }
}

impl<S: DataStore> KvStore for AutoCommit<S> {
  fn get(&mut self, key: &[u8], row_id: Option<i64>, cb: Continuation<Item>) {
    self.inner.get(key, row_id, cb)
  }

  fn set(&mut self, item: &Item, cb: Continuation<i64>) {
    self.inner.set(item, cb)
  }

  fn del(&mut self, key: &[u8], partition: PartitionId, cb: Continuation<bool>) {
    self.inner.del(key, partition, cb)
  }

  fn dump(&mut self, sink: DumpSink<'_>) {
    self.inner.dump(sink)
  }

  fn begin(&mut self) -> Result<()> {
    Ok(())
  }

  fn commit(&mut self) -> Result<()> {
    Ok(())
  }

  fn rollback(&mut self) -> Result<()> {
    Ok(())
  }

  fn reset(&mut self) -> Result<()> {
    self.inner.reset()
  }

  fn noop(&mut self, cb: Continuation<bool>) {
    cb.success(true)
  }
}

#[cfg(test)]
mod tests {
  use super::{AutoCommit, KvStore, MemoryStore};
  use crate::callback::{Continuation, StorageResult};
  use crate::item::Item;

  #[test]
  fn auto_commit_transactions_are_noops() {
    let mut store = AutoCommit::new(MemoryStore::new());
    store.begin().expect("begin");
    store.begin().expect("begin again");
    store.commit().expect("commit");
    store.rollback().expect("rollback");

    let (cb, noop) = Continuation::remembering();
    store.noop(cb);
    assert_eq!(noop.wait_for_value(), StorageResult::Success(true));
  }

  #[test]
  fn auto_commit_delegates_data_operations() {
    let mut store = AutoCommit::new(MemoryStore::new());
    let (cb, set) = Continuation::remembering();
    store.set(&Item::new("k", "v").with_partition(3), cb);
    let row_id = set.wait_for_value().into_payload().expect("row id");

    let (cb, get) = Continuation::remembering();
    store.get(b"k", Some(row_id), cb);
    let item = get.wait_for_value().into_payload().expect("item");
    assert_eq!(item.value(), b"v");
    assert_eq!(store.inner().len(), 1);
  }
}
