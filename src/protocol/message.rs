//! Typed views over replication frames and their encoders.

use super::frame::{Frame, MAX_BODY_BYTES};
use super::header::{FrameHeader, HEADER_BYTES};
use super::{Opcode, TapConnectFlags, MAGIC_REQUEST, MAGIC_RESPONSE, RAW_BYTES};
use crate::error::{EmberError, Result};
use crate::partition::{PartitionId, PartitionState};
use byteorder::{BigEndian, ByteOrder};

/// Opaque value marking connect handshakes.
pub const CONNECT_OPAQUE: u32 = 0xcafe_cafe;

/// Width of the partition state tag carried in partition-set events.
pub const PARTITION_STATE_BYTES: usize = 4;

/// Replication sub-header: engine-specific length, flags, ttl, 3 reserved.
const TAP_EXTRAS_BYTES: usize = 8;
/// Mutation frames append item flags and expiration.
const MUTATION_EXTRAS_BYTES: usize = TAP_EXTRAS_BYTES + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapEventKind {
  Mutation,
  Deletion,
  Flush,
  Opaque,
  PartitionSet,
}

impl TapEventKind {
  pub fn from_opcode(raw: u8) -> Option<Self> {
    match Opcode::from_u8(raw)? {
      Opcode::Mutation => Some(TapEventKind::Mutation),
      Opcode::Delete => Some(TapEventKind::Deletion),
      Opcode::Flush => Some(TapEventKind::Flush),
      Opcode::Opaque => Some(TapEventKind::Opaque),
      Opcode::PartitionSet => Some(TapEventKind::PartitionSet),
      Opcode::Connect => None,
    }
  }

  pub fn opcode(self) -> Opcode {
    match self {
      TapEventKind::Mutation => Opcode::Mutation,
      TapEventKind::Deletion => Opcode::Delete,
      TapEventKind::Flush => Opcode::Flush,
      TapEventKind::Opaque => Opcode::Opaque,
      TapEventKind::PartitionSet => Opcode::PartitionSet,
    }
  }

  fn extras_len(self) -> usize {
    match self {
      TapEventKind::Mutation => MUTATION_EXTRAS_BYTES,
      _ => TAP_EXTRAS_BYTES,
    }
  }
}

/// One replication event, borrowing its byte ranges from a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapMessage<'a> {
  pub kind: TapEventKind,
  pub engine_specific: &'a [u8],
  /// Remaining hop count.
  pub ttl: u8,
  pub tap_flags: u16,
  pub seqno: u32,
  pub key: &'a [u8],
  pub item_flags: u32,
  pub exptime: u32,
  pub cas: u64,
  pub value: &'a [u8],
  pub partition: PartitionId,
}

impl<'a> TapMessage<'a> {
  /// An event with empty payload fields.
  pub fn new(kind: TapEventKind, partition: PartitionId) -> Self {
    Self {
      kind,
      engine_specific: &[],
      ttl: 0,
      tap_flags: 0,
      seqno: 0,
      key: &[],
      item_flags: 0,
      exptime: 0,
      cas: 0,
      value: &[],
      partition,
    }
  }

  pub(super) fn parse(frame: &'a Frame) -> Result<Option<Self>> {
    let header = frame.header();
    if header.magic != MAGIC_REQUEST {
      return Ok(None);
    }
    let Some(kind) = TapEventKind::from_opcode(header.opcode) else {
      return Ok(None);
    };

    let body = frame.body();
    let extras = kind.extras_len();
    if body.len() < extras {
      return Err(EmberError::Protocol(format!(
        "{kind:?} frame body of {} bytes is shorter than its {extras} byte sub-header",
        body.len()
      )));
    }

    let engine_len = usize::from(BigEndian::read_u16(&body[0..2]));
    let tap_flags = BigEndian::read_u16(&body[2..4]);
    let ttl = body[4];
    let (item_flags, exptime) = match kind {
      TapEventKind::Mutation => (
        BigEndian::read_u32(&body[8..12]),
        BigEndian::read_u32(&body[12..16]),
      ),
      _ => (0, 0),
    };

    let key_start = extras + engine_len;
    let value_start = key_start + usize::from(header.key_len);
    if value_start > body.len() {
      return Err(EmberError::Protocol(format!(
        "{kind:?} frame declares {engine_len} engine bytes and {} key bytes but carries {}",
        header.key_len,
        body.len() - extras
      )));
    }

    Ok(Some(Self {
      kind,
      engine_specific: &body[extras..key_start],
      ttl,
      tap_flags,
      seqno: header.opaque,
      key: &body[key_start..value_start],
      item_flags,
      exptime,
      cas: header.cas,
      value: &body[value_start..],
      partition: header.partition,
    }))
  }

  /// Encode as a request frame.
  pub fn encode(&self) -> Result<Vec<u8>> {
    let key_len = u16::try_from(self.key.len())
      .map_err(|_| EmberError::Protocol(format!("key of {} bytes too long", self.key.len())))?;
    let engine_len = u16::try_from(self.engine_specific.len()).map_err(|_| {
      EmberError::Protocol(format!(
        "engine-specific section of {} bytes too long",
        self.engine_specific.len()
      ))
    })?;
    let extras = self.kind.extras_len();
    let body_len = extras + self.engine_specific.len() + self.key.len() + self.value.len();
    let body_len = u32::try_from(body_len)
      .ok()
      .filter(|len| *len <= MAX_BODY_BYTES)
      .ok_or_else(|| EmberError::Protocol(format!("frame body of {body_len} bytes too long")))?;

    let header = FrameHeader {
      magic: MAGIC_REQUEST,
      opcode: self.kind.opcode() as u8,
      key_len,
      extra_len: extras as u8,
      data_type: RAW_BYTES,
      partition: self.partition,
      body_len,
      opaque: self.seqno,
      cas: self.cas,
    };

    let mut bytes = Vec::with_capacity(header.frame_size());
    bytes.extend_from_slice(&header.to_bytes());

    let mut sub_header = [0u8; MUTATION_EXTRAS_BYTES];
    BigEndian::write_u16(&mut sub_header[0..2], engine_len);
    BigEndian::write_u16(&mut sub_header[2..4], self.tap_flags);
    sub_header[4] = self.ttl;
    BigEndian::write_u32(&mut sub_header[8..12], self.item_flags);
    BigEndian::write_u32(&mut sub_header[12..16], self.exptime);
    bytes.extend_from_slice(&sub_header[..extras]);

    bytes.extend_from_slice(self.engine_specific);
    bytes.extend_from_slice(self.key);
    bytes.extend_from_slice(self.value);
    Ok(bytes)
  }

  /// State carried by a partition-set event.
  pub fn partition_state(&self) -> Result<PartitionState> {
    if self.kind != TapEventKind::PartitionSet {
      return Err(EmberError::Protocol(format!(
        "{:?} event carries no partition state",
        self.kind
      )));
    }
    if self.engine_specific.len() != PARTITION_STATE_BYTES {
      return Err(EmberError::Protocol(format!(
        "partition state tag of {} bytes",
        self.engine_specific.len()
      )));
    }
    PartitionState::from_wire_tag(BigEndian::read_u32(self.engine_specific))
  }
}

/// Build the connect handshake: flags word, unpadded name, and the backfill
/// position when the backfill flag is set.
pub fn encode_connect_frame(name: &str, flags: TapConnectFlags, backfill: u64) -> Result<Vec<u8>> {
  let key_len = u16::try_from(name.len())
    .map_err(|_| EmberError::Protocol(format!("connect name of {} bytes too long", name.len())))?;
  let backfill_len = if flags.contains(TapConnectFlags::BACKFILL) {
    8
  } else {
    0
  };
  let body_len = 4 + name.len() + backfill_len;

  let header = FrameHeader {
    magic: MAGIC_REQUEST,
    opcode: Opcode::Connect as u8,
    key_len,
    extra_len: 4,
    data_type: RAW_BYTES,
    partition: 0,
    body_len: body_len as u32,
    opaque: CONNECT_OPAQUE,
    cas: 0,
  };

  let mut bytes = Vec::with_capacity(HEADER_BYTES + body_len);
  bytes.extend_from_slice(&header.to_bytes());
  let mut word = [0u8; 8];
  BigEndian::write_u32(&mut word[..4], flags.bits());
  bytes.extend_from_slice(&word[..4]);
  bytes.extend_from_slice(name.as_bytes());
  if backfill_len > 0 {
    BigEndian::write_u64(&mut word, backfill);
    bytes.extend_from_slice(&word);
  }
  Ok(bytes)
}

/// A decoded connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest<'a> {
  pub flags: TapConnectFlags,
  pub name: &'a [u8],
  pub backfill: Option<u64>,
}

impl<'a> ConnectRequest<'a> {
  pub(super) fn parse(frame: &'a Frame) -> Result<Self> {
    let header = frame.header();
    if header.magic != MAGIC_REQUEST || header.opcode != Opcode::Connect as u8 {
      return Err(EmberError::Protocol(format!(
        "expected connect request, got opcode 0x{:02x}",
        header.opcode
      )));
    }

    let body = frame.body();
    let name_end = 4 + usize::from(header.key_len);
    if body.len() < name_end {
      return Err(EmberError::Protocol("truncated connect request".to_string()));
    }
    let flags = TapConnectFlags::from_bits_truncate(BigEndian::read_u32(&body[0..4]));
    let backfill = if flags.contains(TapConnectFlags::BACKFILL) {
      let raw = body
        .get(name_end..name_end + 8)
        .ok_or_else(|| EmberError::Protocol("connect request missing backfill".to_string()))?;
      Some(BigEndian::read_u64(raw))
    } else {
      None
    };

    Ok(Self {
      flags,
      name: &body[4..name_end],
      backfill,
    })
  }
}

/// Acknowledgment response for a replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapAck {
  pub opcode: u8,
  pub seqno: u32,
  pub status: u16,
  pub message: String,
}

impl TapAck {
  pub fn new(opcode: Opcode, seqno: u32, status: u16) -> Self {
    Self {
      opcode: opcode as u8,
      seqno,
      status,
      message: String::new(),
    }
  }

  pub fn message(mut self, message: impl Into<String>) -> Self {
    self.message = message.into();
    self
  }

  pub fn encode(&self) -> Vec<u8> {
    let header = FrameHeader {
      magic: MAGIC_RESPONSE,
      opcode: self.opcode,
      key_len: 0,
      extra_len: 0,
      data_type: RAW_BYTES,
      partition: self.status,
      body_len: self.message.len() as u32,
      opaque: self.seqno,
      cas: 0,
    };
    let mut bytes = Vec::with_capacity(header.frame_size());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(self.message.as_bytes());
    bytes
  }

  pub(super) fn parse(frame: &Frame) -> Result<Self> {
    let header = frame.header();
    if header.magic != MAGIC_RESPONSE {
      return Err(EmberError::Protocol(
        "acknowledgment must be a response frame".to_string(),
      ));
    }
    Ok(Self {
      opcode: header.opcode,
      seqno: header.opaque,
      status: header.status(),
      message: String::from_utf8_lossy(frame.body()).into_owned(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::{encode_connect_frame, TapAck, TapEventKind, TapMessage, CONNECT_OPAQUE};
  use crate::error::EmberError;
  use crate::partition::PartitionState;
  use crate::protocol::{
    status, Frame, FrameHeader, Opcode, TapConnectFlags, HEADER_BYTES, MAGIC_REQUEST,
  };

  #[test]
  fn connect_frame_without_backfill() {
    let bytes = encode_connect_frame("replica-a", TapConnectFlags::SUPPORT_ACK, 99).expect("encode");
    assert_eq!(bytes.len(), HEADER_BYTES + 4 + "replica-a".len());

    let frame = Frame::from_bytes(bytes).expect("frame");
    let header = frame.header();
    assert_eq!(header.opcode, Opcode::Connect as u8);
    assert_eq!(header.key_len, 9);
    assert_eq!(header.extra_len, 4);
    assert_eq!(header.body_len, 13);
    assert_eq!(header.opaque, CONNECT_OPAQUE);
    assert_eq!(&frame.body()[..4], &[0, 0, 0, 0x10]);

    let request = frame.connect_request().expect("parse");
    assert_eq!(request.name, b"replica-a");
    assert_eq!(request.flags, TapConnectFlags::SUPPORT_ACK);
    assert_eq!(request.backfill, None);
  }

  #[test]
  fn connect_frame_with_backfill_appends_position() {
    let flags = TapConnectFlags::BACKFILL | TapConnectFlags::SUPPORT_ACK;
    let bytes = encode_connect_frame("r", flags, 0x0102_0304_0506_0708).expect("encode");
    assert_eq!(bytes.len(), HEADER_BYTES + 4 + 1 + 8);
    assert_eq!(
      &bytes[bytes.len() - 8..],
      &[1, 2, 3, 4, 5, 6, 7, 8]
    );

    let frame = Frame::from_bytes(bytes).expect("frame");
    let request = frame.connect_request().expect("parse");
    assert_eq!(request.backfill, Some(0x0102_0304_0506_0708));
  }

  #[test]
  fn mutation_carries_item_sub_header() {
    let mut message = TapMessage::new(TapEventKind::Mutation, 7);
    message.engine_specific = b"es";
    message.ttl = 3;
    message.seqno = 41;
    message.key = b"key";
    message.value = b"value";
    message.item_flags = 0xdead;
    message.exptime = 600;
    message.cas = 12;

    let bytes = message.encode().expect("encode");
    assert_eq!(bytes.len(), HEADER_BYTES + 16 + 2 + 3 + 5);
    let frame = Frame::from_bytes(bytes).expect("frame");
    let decoded = frame.tap_message().expect("parse").expect("event");
    assert_eq!(decoded, message);
  }

  #[test]
  fn delete_has_no_item_sub_header() {
    let mut message = TapMessage::new(TapEventKind::Deletion, 2);
    message.key = b"gone";
    let bytes = message.encode().expect("encode");
    assert_eq!(bytes.len(), HEADER_BYTES + 8 + 4);

    let frame = Frame::from_bytes(bytes).expect("frame");
    let decoded = frame.tap_message().expect("parse").expect("event");
    assert_eq!(decoded.key, b"gone");
    assert!(decoded.value.is_empty());
    assert_eq!(decoded.item_flags, 0);
  }

  #[test]
  fn declared_lengths_beyond_body_are_protocol_errors() {
    let header = FrameHeader {
      magic: MAGIC_REQUEST,
      opcode: Opcode::Delete as u8,
      key_len: 50,
      body_len: 10,
      ..FrameHeader::default()
    };
    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 10]);
    let frame = Frame::from_bytes(bytes).expect("frame");
    assert!(matches!(frame.tap_message(), Err(EmberError::Protocol(_))));
  }

  #[test]
  fn unknown_opcode_yields_no_event() {
    let header = FrameHeader {
      magic: MAGIC_REQUEST,
      opcode: 0x7a,
      ..FrameHeader::default()
    };
    let frame = Frame::from_bytes(header.to_bytes().to_vec()).expect("frame");
    assert!(frame.tap_message().expect("parse").is_none());
  }

  #[test]
  fn partition_set_state_decoding() {
    let tag = PartitionState::Pending.wire_tag().to_be_bytes();
    let mut message = TapMessage::new(TapEventKind::PartitionSet, 11);
    message.engine_specific = &tag;
    assert_eq!(message.partition_state().expect("state"), PartitionState::Pending);

    let bad = 9u32.to_be_bytes();
    message.engine_specific = &bad;
    assert!(matches!(
      message.partition_state(),
      Err(EmberError::InvalidPartitionState(9))
    ));
  }

  #[test]
  fn ack_response_roundtrip() {
    let ack = TapAck::new(Opcode::Mutation, 77, status::TEMPORARY_FAILURE).message("busy");
    let frame = Frame::from_bytes(ack.encode()).expect("frame");
    assert!(!frame.is_request());
    assert_eq!(frame.ack().expect("parse"), ack);
    assert!(frame.tap_message().expect("parse").is_none());
  }
}
