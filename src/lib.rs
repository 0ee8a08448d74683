//! EmberKV - persistence and replication core of an embeddable key-value engine.
//!
//! Records are persisted behind the [`store::KvStore`] abstraction (SQLite
//! backed through a pluggable statement strategy) and mutation events are
//! exchanged with peers over the length-prefixed replication stream
//! implemented in [`protocol`] and [`replication`].

pub mod callback;
pub mod config;
pub mod error;
pub mod item;
pub mod partition;
pub mod protocol;
pub mod replication;
pub mod stats;
pub mod store;
pub mod warmup;

pub use callback::{Continuation, Remembered, StorageResult, StorageStatus};
pub use config::{EngineConfig, ReplicationOptions, RetryPolicy, StoreOptions};
pub use error::{EmberError, Result};
pub use item::Item;
pub use partition::{PartitionId, PartitionState};
pub use stats::EngineStats;
pub use store::{AutoCommit, DataStore, KvStore};
