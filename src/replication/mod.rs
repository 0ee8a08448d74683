//! Replication stream endpoints.
//!
//! The receiving side is a [`ReplicationClient`] that connects out to a peer
//! and feeds decoded events to an [`EngineIngest`]. The sending side keeps
//! its in-flight messages in an [`AckTracker`].

pub mod ack;
pub mod client;
pub mod ingest;
pub mod socket;

pub use ack::{
  encode_partition_state_change, encode_raw_partition_state_change, AckTracker, PartitionEvent,
  PartitionStateChange, PendingAck,
};
pub use client::{split_peer, ClientHandle, ConnectionState, ConnectionStatus, ReplicationClient};
pub use ingest::{EngineIngest, EngineStatus, StoreIngest};
#[cfg(unix)]
pub use socket::{NixSocket, NixSocketFactory};
pub use socket::{ConnectStatus, Interest, PeerSocket, SocketFactory};
