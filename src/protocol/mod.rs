//! Replication stream wire format.
//!
//! Every frame is a fixed 24-byte header followed by `body_len` bytes of
//! body. All multi-byte integers are big-endian.

mod frame;
mod header;
mod message;

pub use frame::{Frame, MAX_BODY_BYTES};
pub use header::{FrameHeader, HEADER_BYTES};
pub use message::{
  encode_connect_frame, ConnectRequest, TapAck, TapEventKind, TapMessage, CONNECT_OPAQUE,
  PARTITION_STATE_BYTES,
};

use bitflags::bitflags;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

pub const RAW_BYTES: u8 = 0x00;

/// Replication stream opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
  Connect = 0x40,
  Mutation = 0x41,
  Delete = 0x42,
  Flush = 0x43,
  Opaque = 0x44,
  PartitionSet = 0x45,
}

impl Opcode {
  pub fn from_u8(raw: u8) -> Option<Self> {
    match raw {
      0x40 => Some(Opcode::Connect),
      0x41 => Some(Opcode::Mutation),
      0x42 => Some(Opcode::Delete),
      0x43 => Some(Opcode::Flush),
      0x44 => Some(Opcode::Opaque),
      0x45 => Some(Opcode::PartitionSet),
      _ => None,
    }
  }
}

/// Engine-private commands the front end accepts next to the replication
/// opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineCommand {
  StopPersistence = 0x80,
  StartPersistence = 0x81,
  SetFlushParam = 0x82,
  SetPartition = 0x83,
  GetPartition = 0x84,
  DeletePartition = 0x85,
  StartReplication = 0x90,
  StopReplication = 0x91,
  SetReplicationParam = 0x92,
  EvictKey = 0x93,
}

impl EngineCommand {
  pub fn from_u8(raw: u8) -> Option<Self> {
    match raw {
      0x80 => Some(EngineCommand::StopPersistence),
      0x81 => Some(EngineCommand::StartPersistence),
      0x82 => Some(EngineCommand::SetFlushParam),
      0x83 => Some(EngineCommand::SetPartition),
      0x84 => Some(EngineCommand::GetPartition),
      0x85 => Some(EngineCommand::DeletePartition),
      0x90 => Some(EngineCommand::StartReplication),
      0x91 => Some(EngineCommand::StopReplication),
      0x92 => Some(EngineCommand::SetReplicationParam),
      0x93 => Some(EngineCommand::EvictKey),
      _ => None,
    }
  }
}

/// Response status codes carried in the header's partition field.
pub mod status {
  pub const SUCCESS: u16 = 0x00;
  pub const KEY_NOT_FOUND: u16 = 0x01;
  pub const KEY_EXISTS: u16 = 0x02;
  pub const TOO_BIG: u16 = 0x03;
  pub const INVALID_ARGUMENTS: u16 = 0x04;
  pub const NOT_STORED: u16 = 0x05;
  pub const NOT_MY_PARTITION: u16 = 0x07;
  pub const UNKNOWN_COMMAND: u16 = 0x81;
  pub const OUT_OF_MEMORY: u16 = 0x82;
  pub const TEMPORARY_FAILURE: u16 = 0x86;
}

bitflags! {
  /// Flags sent in the connect handshake.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct TapConnectFlags: u32 {
    /// Deliver existing records from the backfill position onwards.
    const BACKFILL = 0x01;
    /// Dump current contents, then disconnect.
    const DUMP = 0x02;
    /// Only stream the listed partitions.
    const LIST_PARTITIONS = 0x04;
    /// Transfer ownership of the listed partitions.
    const TAKEOVER_PARTITIONS = 0x08;
    /// The client acknowledges messages.
    const SUPPORT_ACK = 0x10;
    const KEYS_ONLY = 0x20;
  }
}

bitflags! {
  /// Per-message flags in the replication sub-header.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct TapMessageFlags: u16 {
    /// The sender expects an acknowledgment for this message.
    const ACK = 0x01;
    const NO_VALUE = 0x02;
  }
}

#[cfg(test)]
mod tests {
  use super::{EngineCommand, Opcode};

  #[test]
  fn opcode_lookup() {
    for opcode in [
      Opcode::Connect,
      Opcode::Mutation,
      Opcode::Delete,
      Opcode::Flush,
      Opcode::Opaque,
      Opcode::PartitionSet,
    ] {
      assert_eq!(Opcode::from_u8(opcode as u8), Some(opcode));
    }
    assert_eq!(Opcode::from_u8(0x01), None);
  }

  #[test]
  fn engine_commands_do_not_overlap_opcodes() {
    for raw in 0u8..=0xff {
      assert!(!(Opcode::from_u8(raw).is_some() && EngineCommand::from_u8(raw).is_some()));
    }
    assert_eq!(
      EngineCommand::from_u8(0x85),
      Some(EngineCommand::DeletePartition)
    );
  }
}
