//! Owned frame buffer validated at construction.

use super::header::{FrameHeader, HEADER_BYTES};
use super::message::{ConnectRequest, TapAck, TapMessage};
use super::{MAGIC_REQUEST, MAGIC_RESPONSE};
use crate::error::{EmberError, Result};

/// Largest body accepted from a peer.
pub const MAX_BODY_BYTES: u32 = 32 * 1024 * 1024;

/// A frame whose header has been validated; the body may still be filling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  header: FrameHeader,
  bytes: Vec<u8>,
}

impl Frame {
  /// Start a frame from a received header, allocating room for its body.
  ///
  /// Fails when the magic byte is neither request nor response; the stream
  /// cannot be resynchronized after that.
  pub fn with_header(raw: &[u8; HEADER_BYTES]) -> Result<Self> {
    let header = FrameHeader::decode(raw);
    validate(&header)?;

    let mut bytes = vec![0u8; header.frame_size()];
    bytes[..HEADER_BYTES].copy_from_slice(raw);
    Ok(Self { header, bytes })
  }

  /// Wrap a complete encoded frame.
  pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
    let raw: &[u8; HEADER_BYTES] = bytes
      .get(..HEADER_BYTES)
      .and_then(|head| head.try_into().ok())
      .ok_or_else(|| EmberError::Protocol("frame shorter than header".to_string()))?;
    let header = FrameHeader::decode(raw);
    validate(&header)?;

    if bytes.len() != header.frame_size() {
      return Err(EmberError::Protocol(format!(
        "frame length {} does not match declared size {}",
        bytes.len(),
        header.frame_size()
      )));
    }
    Ok(Self { header, bytes })
  }

  pub fn header(&self) -> &FrameHeader {
    &self.header
  }

  pub fn size(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_request(&self) -> bool {
    self.header.magic == MAGIC_REQUEST
  }

  pub fn body(&self) -> &[u8] {
    &self.bytes[HEADER_BYTES..]
  }

  pub fn body_mut(&mut self) -> &mut [u8] {
    &mut self.bytes[HEADER_BYTES..]
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.bytes
  }

  /// Decode a replication event; `None` for opcodes that carry no event.
  pub fn tap_message(&self) -> Result<Option<TapMessage<'_>>> {
    TapMessage::parse(self)
  }

  pub fn connect_request(&self) -> Result<ConnectRequest<'_>> {
    ConnectRequest::parse(self)
  }

  pub fn ack(&self) -> Result<TapAck> {
    TapAck::parse(self)
  }
}

fn validate(header: &FrameHeader) -> Result<()> {
  if header.magic != MAGIC_REQUEST && header.magic != MAGIC_RESPONSE {
    return Err(EmberError::Protocol(format!(
      "invalid packet magic 0x{:02x} on the wire",
      header.magic
    )));
  }
  if header.body_len > MAX_BODY_BYTES {
    return Err(EmberError::Protocol(format!(
      "frame body of {} bytes exceeds limit",
      header.body_len
    )));
  }
  Ok(())
}
