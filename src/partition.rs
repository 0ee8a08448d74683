//! Partition ids, states, and key-to-partition hashing.

use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash-range shard of the key space.
pub type PartitionId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
  Active,
  Replica,
  Pending,
  Dead,
}

impl PartitionState {
  pub const ALL: [PartitionState; 4] = [
    PartitionState::Active,
    PartitionState::Replica,
    PartitionState::Pending,
    PartitionState::Dead,
  ];

  /// Tag carried on the wire for partition-state-set events.
  pub const fn wire_tag(self) -> u32 {
    match self {
      PartitionState::Active => 1,
      PartitionState::Replica => 2,
      PartitionState::Pending => 3,
      PartitionState::Dead => 4,
    }
  }

  pub fn from_wire_tag(tag: u32) -> Result<Self> {
    match tag {
      1 => Ok(PartitionState::Active),
      2 => Ok(PartitionState::Replica),
      3 => Ok(PartitionState::Pending),
      4 => Ok(PartitionState::Dead),
      other => Err(EmberError::InvalidPartitionState(other)),
    }
  }

  pub const fn as_str(self) -> &'static str {
    match self {
      PartitionState::Active => "active",
      PartitionState::Replica => "replica",
      PartitionState::Pending => "pending",
      PartitionState::Dead => "dead",
    }
  }
}

impl fmt::Display for PartitionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for PartitionState {
  type Err = EmberError;

  fn from_str(raw: &str) -> Result<Self> {
    match raw {
      "active" => Ok(PartitionState::Active),
      "replica" => Ok(PartitionState::Replica),
      "pending" => Ok(PartitionState::Pending),
      "dead" => Ok(PartitionState::Dead),
      _ => Err(EmberError::Serialization(format!(
        "invalid partition state: {raw}"
      ))),
    }
  }
}

/// Map a key onto one of `count` partitions.
///
/// Uses the upper bits of the key's CRC32 so neighbouring keys spread out.
pub fn partition_for_key(key: &[u8], count: u16) -> PartitionId {
  if count == 0 {
    return 0;
  }
  let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
  (hash % u32::from(count)) as PartitionId
}

#[cfg(test)]
mod tests {
  use super::{partition_for_key, PartitionState};
  use crate::error::EmberError;
  use std::collections::HashSet;
  use std::str::FromStr;

  #[test]
  fn wire_tags_are_distinct_and_reversible() {
    let tags: HashSet<u32> = PartitionState::ALL.iter().map(|s| s.wire_tag()).collect();
    assert_eq!(tags.len(), 4);
    for state in PartitionState::ALL {
      assert_eq!(
        PartitionState::from_wire_tag(state.wire_tag()).expect("tag"),
        state
      );
    }
  }

  #[test]
  fn unknown_wire_tag_is_rejected() {
    assert!(matches!(
      PartitionState::from_wire_tag(0),
      Err(EmberError::InvalidPartitionState(0))
    ));
    assert!(PartitionState::from_wire_tag(5).is_err());
  }

  #[test]
  fn state_strings_roundtrip() {
    for state in PartitionState::ALL {
      assert_eq!(PartitionState::from_str(&state.to_string()).expect("parse"), state);
    }
    assert!(PartitionState::from_str("Active").is_err());
  }

  #[test]
  fn key_hashing_is_deterministic_and_in_range() {
    for i in 0..500 {
      let key = format!("key-{i}");
      let first = partition_for_key(key.as_bytes(), 1024);
      assert_eq!(first, partition_for_key(key.as_bytes(), 1024));
      assert!(first < 1024);
    }
    assert_eq!(partition_for_key(b"anything", 0), 0);
  }
}
