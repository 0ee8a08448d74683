//! Error types for EmberKV.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EmberError>;

#[derive(Debug, Error)]
pub enum EmberError {
  /// Name resolution, socket creation, connect or read failures.
  #[error("connectivity error: {0}")]
  Connectivity(String),

  /// The peer closed the replication stream (zero-length read).
  #[error("stream closed")]
  StreamClosed,

  /// Malformed or unexpected frame on the replication stream.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// A partition state value outside the four protocol tags.
  #[error("invalid partition state: {0}")]
  InvalidPartitionState(u32),

  /// The backend rejected a commit and the transaction is still open.
  #[error("commit rejected, transaction still open")]
  TransactionStillOpen,

  #[error("persistence error: {0}")]
  Persistence(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

impl EmberError {
  /// Errors that a replication connection recovers from by reconnecting.
  pub fn is_connectivity(&self) -> bool {
    matches!(
      self,
      EmberError::Connectivity(_) | EmberError::StreamClosed | EmberError::Io(_)
    )
  }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for EmberError {
  fn from(errno: nix::errno::Errno) -> Self {
    EmberError::Connectivity(errno.desc().to_string())
  }
}
