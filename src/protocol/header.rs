//! Fixed frame header.

use byteorder::{BigEndian, ByteOrder};

pub const HEADER_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
  pub magic: u8,
  pub opcode: u8,
  pub key_len: u16,
  pub extra_len: u8,
  pub data_type: u8,
  /// Partition id on requests, status code on responses.
  pub partition: u16,
  pub body_len: u32,
  pub opaque: u32,
  pub cas: u64,
}

impl FrameHeader {
  pub fn decode(bytes: &[u8; HEADER_BYTES]) -> Self {
    Self {
      magic: bytes[0],
      opcode: bytes[1],
      key_len: BigEndian::read_u16(&bytes[2..4]),
      extra_len: bytes[4],
      data_type: bytes[5],
      partition: BigEndian::read_u16(&bytes[6..8]),
      body_len: BigEndian::read_u32(&bytes[8..12]),
      opaque: BigEndian::read_u32(&bytes[12..16]),
      cas: BigEndian::read_u64(&bytes[16..24]),
    }
  }

  pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
    let mut bytes = [0u8; HEADER_BYTES];
    bytes[0] = self.magic;
    bytes[1] = self.opcode;
    BigEndian::write_u16(&mut bytes[2..4], self.key_len);
    bytes[4] = self.extra_len;
    bytes[5] = self.data_type;
    BigEndian::write_u16(&mut bytes[6..8], self.partition);
    BigEndian::write_u32(&mut bytes[8..12], self.body_len);
    BigEndian::write_u32(&mut bytes[12..16], self.opaque);
    BigEndian::write_u64(&mut bytes[16..24], self.cas);
    bytes
  }

  pub fn status(&self) -> u16 {
    self.partition
  }

  /// Header plus body.
  pub fn frame_size(&self) -> usize {
    HEADER_BYTES + self.body_len as usize
  }
}
