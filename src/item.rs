//! The stored and replicated record.

use crate::partition::PartitionId;
use std::time::{SystemTime, UNIX_EPOCH};

/// A key/value record plus the metadata persisted and replicated with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
  key: Vec<u8>,
  value: Vec<u8>,
  flags: u32,
  exptime: u32,
  cas: u64,
  partition: PartitionId,
  row_id: Option<i64>,
  dirty: bool,
  /// Seconds since the epoch when the item was last dirtied.
  dirtied_at: u64,
}

impl Item {
  pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
    Self {
      key: key.into(),
      value: value.into(),
      flags: 0,
      exptime: 0,
      cas: 0,
      partition: 0,
      row_id: None,
      dirty: false,
      dirtied_at: 0,
    }
  }

  pub fn with_flags(mut self, flags: u32) -> Self {
    self.flags = flags;
    self
  }

  pub fn with_exptime(mut self, exptime: u32) -> Self {
    self.exptime = exptime;
    self
  }

  pub fn with_cas(mut self, cas: u64) -> Self {
    self.cas = cas;
    self
  }

  pub fn with_partition(mut self, partition: PartitionId) -> Self {
    self.partition = partition;
    self
  }

  pub fn with_row_id(mut self, row_id: i64) -> Self {
    self.row_id = Some(row_id);
    self
  }

  pub fn key(&self) -> &[u8] {
    &self.key
  }

  pub fn value(&self) -> &[u8] {
    &self.value
  }

  pub fn flags(&self) -> u32 {
    self.flags
  }

  pub fn exptime(&self) -> u32 {
    self.exptime
  }

  pub fn cas(&self) -> u64 {
    self.cas
  }

  pub fn partition(&self) -> PartitionId {
    self.partition
  }

  pub fn row_id(&self) -> Option<i64> {
    self.row_id
  }

  pub fn set_row_id(&mut self, row_id: Option<i64>) {
    self.row_id = row_id;
  }

  pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
    self.value = value.into();
    self.mark_dirty();
  }

  pub fn is_dirty(&self) -> bool {
    self.dirty
  }

  pub fn mark_dirty(&mut self) {
    self.dirty = true;
    self.dirtied_at = now_secs();
  }

  pub fn mark_clean(&mut self) {
    self.dirty = false;
  }

  /// Seconds the item has been dirty, zero when clean.
  pub fn dirty_age(&self) -> u64 {
    if !self.dirty {
      return 0;
    }
    now_secs().saturating_sub(self.dirtied_at)
  }

  pub fn into_value(self) -> Vec<u8> {
    self.value
  }
}

fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

#[cfg(test)]
mod tests {
  use super::Item;

  #[test]
  fn builder_sets_metadata() {
    let item = Item::new("k", "v")
      .with_flags(7)
      .with_exptime(300)
      .with_cas(99)
      .with_partition(12)
      .with_row_id(5);
    assert_eq!(item.key(), b"k");
    assert_eq!(item.value(), b"v");
    assert_eq!(item.flags(), 7);
    assert_eq!(item.exptime(), 300);
    assert_eq!(item.cas(), 99);
    assert_eq!(item.partition(), 12);
    assert_eq!(item.row_id(), Some(5));
    assert!(!item.is_dirty());
  }

  #[test]
  fn set_value_dirties_item() {
    let mut item = Item::new("k", "v");
    item.set_value("w");
    assert!(item.is_dirty());
    assert!(item.dirty_age() <= 1);
    item.mark_clean();
    assert!(!item.is_dirty());
  }
}
