//! Acknowledgment tracking for the sending side of a replication stream.
//!
//! Every message sent with the ack flag is logged as a [`PendingAck`] in
//! send order. A positive acknowledgment releases entries from the head of
//! the log; a negative one marks the connection for disconnect.

use super::ingest::EngineStatus;
use crate::error::Result;
use crate::partition::{PartitionId, PartitionState};
use crate::protocol::{status, Frame, TapEventKind, TapMessage, TapMessageFlags, PARTITION_STATE_BYTES};
use crate::stats::EngineStats;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A sent message awaiting acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
  pub seqno: u32,
}

/// A partition changing state, to be announced to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEvent {
  pub partition: PartitionId,
  pub state: PartitionState,
}

/// Wire form of a [`PartitionEvent`]: the partition goes in the header, the
/// state tag in the engine-specific section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStateChange {
  pub partition: PartitionId,
  pub tag: [u8; PARTITION_STATE_BYTES],
}

impl PartitionStateChange {
  pub fn engine_specific(&self) -> &[u8] {
    &self.tag
  }
}

pub fn encode_partition_state_change(event: &PartitionEvent) -> PartitionStateChange {
  PartitionStateChange {
    partition: event.partition,
    tag: event.state.wire_tag().to_be_bytes(),
  }
}

/// Like [`encode_partition_state_change`] for an untyped state value.
///
/// Values outside the four known tags are rejected with
/// [`EmberError::InvalidPartitionState`](crate::error::EmberError::InvalidPartitionState).
pub fn encode_raw_partition_state_change(
  partition: PartitionId,
  raw_state: u32,
) -> Result<PartitionStateChange> {
  let state = PartitionState::from_wire_tag(raw_state)?;
  Ok(encode_partition_state_change(&PartitionEvent { partition, state }))
}

#[derive(Debug)]
pub struct AckTracker {
  peer: String,
  log: VecDeque<PendingAck>,
  next_seqno: u32,
  disconnect: bool,
  expiry: Option<Instant>,
  stats: Arc<EngineStats>,
}

impl AckTracker {
  pub fn new(peer: impl Into<String>, stats: Arc<EngineStats>) -> Self {
    Self {
      peer: peer.into(),
      log: VecDeque::new(),
      next_seqno: 1,
      disconnect: false,
      expiry: None,
      stats,
    }
  }

  pub fn record_sent(&mut self, seqno: u32) {
    self.log.push_back(PendingAck { seqno });
  }

  /// Apply an acknowledgment from the peer.
  ///
  /// On success only the leading entries carrying `seqno` are released;
  /// entries behind an unacknowledged one stay pending.
  pub fn process_ack(&mut self, seqno: u32, status: u16, message: &str) -> EngineStatus {
    let positive = status == status::SUCCESS;
    self.stats.record_ack(positive);

    if !positive {
      warn!(peer = %self.peer, seqno, status, message, "negative acknowledgment");
      self.disconnect = true;
      self.expiry = None;
      return EngineStatus::Disconnect;
    }

    let before = self.log.len();
    while self.log.front().is_some_and(|pending| pending.seqno == seqno) {
      self.log.pop_front();
    }
    debug!(peer = %self.peer, seqno, released = before - self.log.len(), "acknowledged");
    EngineStatus::Success
  }

  /// Decode an acknowledgment response and apply it.
  pub fn process_ack_frame(&mut self, frame: &Frame) -> Result<EngineStatus> {
    let ack = frame.ack()?;
    Ok(self.process_ack(ack.seqno, ack.status, &ack.message))
  }

  /// Stamp `message` with the next seqno and the ack flag, encode it and
  /// log it as pending.
  pub fn next_frame(&mut self, mut message: TapMessage<'_>) -> Result<Vec<u8>> {
    let seqno = self.next_seqno;
    message.seqno = seqno;
    message.tap_flags |= TapMessageFlags::ACK.bits();
    let bytes = message.encode()?;

    self.next_seqno = self.next_seqno.wrapping_add(1);
    self.record_sent(seqno);
    Ok(bytes)
  }

  /// Encode a partition-set message announcing `event`.
  pub fn partition_state_frame(&mut self, event: &PartitionEvent) -> Result<Vec<u8>> {
    let change = encode_partition_state_change(event);
    let mut message = TapMessage::new(TapEventKind::PartitionSet, change.partition);
    message.engine_specific = change.engine_specific();
    self.next_frame(message)
  }

  /// Keep the connection alive until `timeout` from now.
  pub fn set_expiry(&mut self, timeout: Duration) {
    self.expiry = Some(Instant::now() + timeout);
  }

  pub fn clear_expiry(&mut self) {
    self.expiry = None;
  }

  pub fn expiry(&self) -> Option<Instant> {
    self.expiry
  }

  pub fn is_expired(&self, now: Instant) -> bool {
    self.expiry.is_some_and(|deadline| now >= deadline)
  }

  pub fn should_disconnect(&self) -> bool {
    self.disconnect
  }

  pub fn pending_len(&self) -> usize {
    self.log.len()
  }

  pub fn pending(&self) -> impl Iterator<Item = &PendingAck> {
    self.log.iter()
  }
}

#[cfg(test)]
mod tests {
  use super::{
    encode_partition_state_change, encode_raw_partition_state_change, AckTracker,
    PartitionEvent,
  };
  use crate::error::EmberError;
  use crate::partition::PartitionState;
  use crate::protocol::{status, Frame, Opcode, TapAck, TapEventKind, TapMessage, TapMessageFlags};
  use crate::replication::ingest::EngineStatus;
  use crate::stats::EngineStats;
  use std::collections::HashSet;
  use std::sync::Arc;
  use std::time::{Duration, Instant};

  fn tracker() -> (AckTracker, Arc<EngineStats>) {
    let stats = Arc::new(EngineStats::new());
    (AckTracker::new("replica-a", Arc::clone(&stats)), stats)
  }

  fn pending(tracker: &AckTracker) -> Vec<u32> {
    tracker.pending().map(|entry| entry.seqno).collect()
  }

  #[test]
  fn positive_ack_releases_leading_run_only() {
    let (mut tracker, stats) = tracker();
    for seqno in [5, 5, 6, 5] {
      tracker.record_sent(seqno);
    }

    assert_eq!(tracker.process_ack(5, status::SUCCESS, ""), EngineStatus::Success);
    assert_eq!(pending(&tracker), vec![6, 5]);

    assert_eq!(tracker.process_ack(5, status::SUCCESS, ""), EngineStatus::Success);
    assert_eq!(pending(&tracker), vec![6, 5]);

    tracker.process_ack(6, status::SUCCESS, "");
    assert_eq!(pending(&tracker), vec![5]);
    assert!(!tracker.should_disconnect());
    assert_eq!(stats.snapshot().acks_received, 3);
  }

  #[test]
  fn negative_ack_requests_disconnect() {
    let (mut tracker, stats) = tracker();
    tracker.record_sent(1);
    tracker.set_expiry(Duration::from_secs(30));

    let outcome = tracker.process_ack(1, status::TEMPORARY_FAILURE, "busy");
    assert_eq!(outcome, EngineStatus::Disconnect);
    assert!(tracker.should_disconnect());
    assert!(tracker.expiry().is_none());
    assert_eq!(tracker.pending_len(), 1);
    assert_eq!(stats.snapshot().negative_acks, 1);
  }

  #[test]
  fn ack_frames_are_decoded() {
    let (mut tracker, _) = tracker();
    let frame = {
      let mut message = TapMessage::new(TapEventKind::Deletion, 4);
      message.key = b"k";
      Frame::from_bytes(tracker.next_frame(message).expect("encode")).expect("frame")
    };
    let sent = frame.tap_message().expect("parse").expect("event");
    assert_eq!(sent.seqno, 1);
    assert_ne!(sent.tap_flags & TapMessageFlags::ACK.bits(), 0);

    let ack = Frame::from_bytes(TapAck::new(Opcode::Delete, 1, status::SUCCESS).encode())
      .expect("ack frame");
    assert_eq!(
      tracker.process_ack_frame(&ack).expect("ack"),
      EngineStatus::Success
    );
    assert_eq!(tracker.pending_len(), 0);

    assert!(tracker.process_ack_frame(&frame).is_err());
  }

  #[test]
  fn partition_states_have_distinct_tags() {
    let tags: HashSet<[u8; 4]> = PartitionState::ALL
      .iter()
      .map(|state| {
        encode_partition_state_change(&PartitionEvent {
          partition: 3,
          state: *state,
        })
        .tag
      })
      .collect();
    assert_eq!(tags.len(), 4);

    let change = encode_raw_partition_state_change(9, 2).expect("replica");
    assert_eq!(change.partition, 9);
    assert_eq!(change.tag, PartitionState::Replica.wire_tag().to_be_bytes());

    for raw in [0, 5, u32::MAX] {
      assert!(matches!(
        encode_raw_partition_state_change(1, raw),
        Err(EmberError::InvalidPartitionState(value)) if value == raw
      ));
    }
  }

  #[test]
  fn partition_state_frame_roundtrips() {
    let (mut tracker, _) = tracker();
    let bytes = tracker
      .partition_state_frame(&PartitionEvent {
        partition: 12,
        state: PartitionState::Dead,
      })
      .expect("encode");
    let frame = Frame::from_bytes(bytes).expect("frame");
    let message = frame.tap_message().expect("parse").expect("event");
    assert_eq!(message.kind, TapEventKind::PartitionSet);
    assert_eq!(message.partition, 12);
    assert_eq!(message.partition_state().expect("state"), PartitionState::Dead);
    assert_eq!(pending(&tracker), vec![1]);
  }

  #[test]
  fn expiry() {
    let (mut tracker, _) = tracker();
    let now = Instant::now();
    assert!(!tracker.is_expired(now));
    tracker.set_expiry(Duration::ZERO);
    assert!(tracker.is_expired(Instant::now()));
    tracker.clear_expiry();
    assert!(!tracker.is_expired(now + Duration::from_secs(60)));
  }
}
