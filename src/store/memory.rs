//! In-memory [`DataStore`].

use super::{DataStore, DumpSink};
use crate::callback::{Continuation, StorageResult, StorageStatus};
use crate::error::Result;
use crate::item::Item;
use crate::partition::PartitionId;
use std::collections::{BTreeMap, HashMap};

/// Keeps records in a map keyed by key, with monotonically assigned row ids.
#[derive(Debug, Default)]
pub struct MemoryStore {
  records: BTreeMap<Vec<u8>, Item>,
  rows: HashMap<i64, Vec<u8>>,
  next_row_id: i64,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      next_row_id: 1,
      ..Self::default()
    }
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  fn alloc_row_id(&mut self) -> i64 {
    let row_id = self.next_row_id.max(1);
    self.next_row_id = row_id + 1;
    row_id
  }
}

impl DataStore for MemoryStore {
  fn get(&mut self, key: &[u8], row_id: Option<i64>, cb: Continuation<Item>) {
    // A stale row id hint falls back to the key lookup.
    let found = row_id
      .and_then(|row_id| self.rows.get(&row_id))
      .filter(|stored_key| stored_key.as_slice() == key)
      .and_then(|stored_key| self.records.get(stored_key))
      .or_else(|| self.records.get(key));

    match found {
      Some(item) => cb.success(item.clone()),
      None => cb.failure(StorageStatus::KeyNotFound),
    }
  }

  fn set(&mut self, item: &Item, cb: Continuation<i64>) {
    let row_id = match item.row_id() {
      Some(row_id) => {
        let Some(previous_key) = self.rows.get(&row_id).cloned() else {
          cb.failure(StorageStatus::NotStored);
          return;
        };
        if previous_key.as_slice() != item.key() {
          self.records.remove(&previous_key);
        }
        row_id
      }
      None => self.alloc_row_id(),
    };

    if let Some(previous) = self.records.get(item.key()).and_then(Item::row_id) {
      if previous != row_id {
        self.rows.remove(&previous);
      }
    }

    let mut stored = item.clone();
    stored.set_row_id(Some(row_id));
    stored.mark_clean();
    self.rows.insert(row_id, stored.key().to_vec());
    self.records.insert(stored.key().to_vec(), stored);
    cb.success(row_id)
  }

  fn del(&mut self, key: &[u8], partition: PartitionId, cb: Continuation<bool>) {
    let matches = self
      .records
      .get(key)
      .is_some_and(|item| item.partition() == partition);
    if !matches {
      cb.success(false);
      return;
    }

    if let Some(item) = self.records.remove(key) {
      if let Some(row_id) = item.row_id() {
        self.rows.remove(&row_id);
      }
    }
    cb.success(true)
  }

  fn dump(&mut self, sink: DumpSink<'_>) {
    for item in self.records.values() {
      sink(StorageResult::Success(item.clone()));
    }
  }

  fn reset(&mut self) -> Result<()> {
    self.records.clear();
    self.rows.clear();
    self.next_row_id = 1;
    Ok(())
  }
}
