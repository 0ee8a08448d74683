//! Engine ingest boundary for decoded replication events.

use crate::callback::{Continuation, StorageResult, StorageStatus};
use crate::item::Item;
use crate::protocol::{TapEventKind, TapMessage};
use crate::store::KvStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome reported by the engine for an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
  Success,
  KeyNotFound,
  NotStored,
  TemporaryFailure,
  Failed,
  /// Tear the replication connection down.
  Disconnect,
}

/// Receives events decoded from a replication stream.
///
/// The message's `ttl` has already been decremented for this hop.
pub trait EngineIngest: Send {
  fn tap_notify(&self, message: &TapMessage<'_>) -> EngineStatus;
}

impl<T: EngineIngest + Sync + ?Sized> EngineIngest for Arc<T> {
  fn tap_notify(&self, message: &TapMessage<'_>) -> EngineStatus {
    (**self).tap_notify(message)
  }
}

/// Applies replicated mutations, deletions and flushes to a [`KvStore`].
pub struct StoreIngest<S> {
  store: Mutex<S>,
}

impl<S: KvStore + Send> StoreIngest<S> {
  pub fn new(store: S) -> Self {
    Self {
      store: Mutex::new(store),
    }
  }

  /// Run `f` against the wrapped store.
  pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
    f(&mut self.store.lock())
  }

  fn apply_mutation(store: &mut S, message: &TapMessage<'_>) -> EngineStatus {
    let (cb, existing) = Continuation::remembering();
    store.get(message.key, None, cb);
    let row_id = existing
      .wait_for_value()
      .into_payload()
      .and_then(|item| item.row_id());

    let mut item = Item::new(message.key, message.value)
      .with_flags(message.item_flags)
      .with_exptime(message.exptime)
      .with_cas(message.cas)
      .with_partition(message.partition);
    item.set_row_id(row_id);

    let (cb, stored) = Continuation::remembering();
    store.set(&item, cb);
    match stored.wait_for_value() {
      StorageResult::Success(_) => EngineStatus::Success,
      StorageResult::Failure(StorageStatus::NotStored) => EngineStatus::NotStored,
      StorageResult::Failure(status) => {
        warn!(%status, partition = message.partition, "failed to apply replicated mutation");
        EngineStatus::TemporaryFailure
      }
    }
  }

  fn apply_deletion(store: &mut S, message: &TapMessage<'_>) -> EngineStatus {
    let (cb, removed) = Continuation::remembering();
    store.del(message.key, message.partition, cb);
    match removed.wait_for_value() {
      StorageResult::Success(true) => EngineStatus::Success,
      StorageResult::Success(false) => EngineStatus::KeyNotFound,
      StorageResult::Failure(_) => EngineStatus::TemporaryFailure,
    }
  }
}

impl<S: KvStore + Send> EngineIngest for StoreIngest<S> {
  fn tap_notify(&self, message: &TapMessage<'_>) -> EngineStatus {
    let mut store = self.store.lock();
    match message.kind {
      TapEventKind::Mutation => Self::apply_mutation(&mut store, message),
      TapEventKind::Deletion => Self::apply_deletion(&mut store, message),
      TapEventKind::Flush => match store.reset() {
        Ok(()) => EngineStatus::Success,
        Err(error) => {
          warn!(%error, "failed to flush store for replication stream");
          EngineStatus::Failed
        }
      },
      TapEventKind::Opaque | TapEventKind::PartitionSet => {
        debug!(kind = ?message.kind, seqno = message.seqno, "event not applied to store");
        EngineStatus::Success
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{EngineIngest, EngineStatus, StoreIngest};
  use crate::callback::{Continuation, StorageResult};
  use crate::protocol::{TapEventKind, TapMessage};
  use crate::store::{AutoCommit, KvStore, MemoryStore};

  #[test]
  fn mutations_overwrite_and_deletions_remove() {
    let ingest = StoreIngest::new(AutoCommit::new(MemoryStore::new()));

    let mut mutation = TapMessage::new(TapEventKind::Mutation, 3);
    mutation.key = b"k";
    mutation.value = b"v1";
    assert_eq!(ingest.tap_notify(&mutation), EngineStatus::Success);
    mutation.value = b"v2";
    assert_eq!(ingest.tap_notify(&mutation), EngineStatus::Success);

    ingest.with_store(|store| {
      assert_eq!(store.inner().len(), 1);
      let (cb, value) = Continuation::remembering();
      store.get(b"k", None, cb);
      let item = value.wait_for_value().into_payload().expect("item");
      assert_eq!(item.value(), b"v2");
      assert_eq!(item.partition(), 3);
    });

    let mut deletion = TapMessage::new(TapEventKind::Deletion, 3);
    deletion.key = b"k";
    assert_eq!(ingest.tap_notify(&deletion), EngineStatus::Success);
    assert_eq!(ingest.tap_notify(&deletion), EngineStatus::KeyNotFound);
  }

  #[test]
  fn flush_resets_store() {
    let ingest = StoreIngest::new(AutoCommit::new(MemoryStore::new()));
    let mut mutation = TapMessage::new(TapEventKind::Mutation, 0);
    mutation.key = b"a";
    ingest.tap_notify(&mutation);

    let flush = TapMessage::new(TapEventKind::Flush, 0);
    assert_eq!(ingest.tap_notify(&flush), EngineStatus::Success);
    ingest.with_store(|store| {
      let (cb, value) = Continuation::remembering();
      store.get(b"a", None, cb);
      assert!(!matches!(value.wait_for_value(), StorageResult::Success(_)));
    });
  }
}
