//! A multiplexed stream: fragmentation, reassembly, and flags.
//!
//! A payload larger than one datagram is cut into parts that share a
//! `message_id`. The receiver holds parts per `message_id` until all
//! `part_total` of them are present, then hands back the concatenation.
//! Parts may arrive in any order and may be duplicated.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use falcon_protocol::{DATA_HEADER_LEN, DataFrame, PeerId, StreamFlags, StreamId};

use crate::SessionError;

/// Most parts one message can be split into (`part_total` is one byte).
pub const MAX_PARTS: usize = u8::MAX as usize;

/// Parts received so far for one `message_id`.
#[derive(Debug)]
struct PartialMessage {
    part_total: u8,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    started: Instant,
}

impl PartialMessage {
    fn new(part_total: u8, now: Instant) -> Self {
        Self {
            part_total,
            parts: vec![None; usize::from(part_total)],
            received: 0,
            started: now,
        }
    }

    /// Stores one part. A repeated part replaces the earlier copy without
    /// counting twice.
    fn insert(&mut self, part_id: u8, bytes: Vec<u8>) {
        let slot = &mut self.parts[usize::from(part_id)];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(bytes);
    }

    fn is_complete(&self) -> bool {
        self.received == usize::from(self.part_total)
    }

    fn assemble(self) -> Vec<u8> {
        self.parts.into_iter().flatten().flatten().collect()
    }
}

/// One logical channel within a session.
///
/// The reliable bit lives in the id and never changes. A stream does not
/// hold a handle to its session or transport: it only produces and
/// consumes [`DataFrame`]s, and the owning [`Session`](crate::Session)
/// routes them.
#[derive(Debug)]
pub struct Stream {
    stream_id: StreamId,
    peer_id: PeerId,
    next_message_id: u16,
    flags: StreamFlags,
    reassembly: HashMap<u16, PartialMessage>,
}

impl Stream {
    /// Creates an empty stream for `peer_id`.
    pub fn new(peer_id: PeerId, stream_id: StreamId) -> Self {
        Self {
            stream_id,
            peer_id,
            next_message_id: 0,
            flags: StreamFlags::default(),
            reassembly: HashMap::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_reliable(&self) -> bool {
        self.stream_id.is_reliable()
    }

    /// The current flags: set locally, or taken from the last completed
    /// incoming message.
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Sets flag `index`. Out-of-range indices are ignored.
    pub fn set_flag(&mut self, index: usize, value: bool) {
        self.flags.set(index, value);
    }

    /// Reads flag `index`. Out-of-range indices read as `false`.
    pub fn get_flag(&self, index: usize) -> bool {
        self.flags.get(index)
    }

    /// Number of messages with some but not all parts received.
    pub fn pending_reassembly(&self) -> usize {
        self.reassembly.len()
    }

    /// Splits `payload` into DATA frames that each fit in
    /// `max_datagram_size` bytes.
    ///
    /// Every call consumes one `message_id`, shared by all returned parts.
    /// An empty payload still produces one (empty) part so the receiver
    /// sees a completed message.
    ///
    /// # Errors
    /// Returns [`SessionError::PayloadTooLarge`] if the payload needs more
    /// than [`MAX_PARTS`] parts. No message id is consumed in that case.
    pub fn fragment(
        &mut self,
        payload: &[u8],
        max_datagram_size: usize,
    ) -> Result<Vec<DataFrame>, SessionError> {
        let part_size = max_datagram_size.saturating_sub(DATA_HEADER_LEN).max(1);
        let part_total = payload.len().div_ceil(part_size).max(1);
        let part_total = u8::try_from(part_total).map_err(|_| {
            SessionError::PayloadTooLarge {
                len: payload.len(),
                max: part_size * MAX_PARTS,
            }
        })?;

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let frames = if payload.is_empty() {
            vec![self.part(message_id, 0, 1, Vec::new())]
        } else {
            payload
                .chunks(part_size)
                .zip(0u8..)
                .map(|(chunk, part_id)| {
                    self.part(message_id, part_id, part_total, chunk.to_vec())
                })
                .collect()
        };

        Ok(frames)
    }

    fn part(
        &self,
        message_id: u16,
        part_id: u8,
        part_total: u8,
        payload: Vec<u8>,
    ) -> DataFrame {
        DataFrame {
            peer_id: self.peer_id,
            stream_id: self.stream_id,
            flags: self.flags,
            part_id,
            part_total,
            message_id,
            payload,
        }
    }

    /// Accepts one incoming part.
    ///
    /// Returns the reassembled payload once the last missing part of its
    /// message arrives; the stream's flags are updated from that part at
    /// the same time. A part whose `part_total` disagrees with the parts
    /// already held for its `message_id` restarts that message.
    pub fn receive(&mut self, frame: DataFrame, now: Instant) -> Option<Vec<u8>> {
        let DataFrame {
            flags,
            part_id,
            part_total,
            message_id,
            payload,
            ..
        } = frame;

        // Decoding rejects these, but frames can also be built by hand.
        if part_total == 0 || part_id >= part_total {
            return None;
        }

        if part_total == 1 {
            self.reassembly.remove(&message_id);
            self.flags = flags;
            return Some(payload);
        }

        let partial = self
            .reassembly
            .entry(message_id)
            .or_insert_with(|| PartialMessage::new(part_total, now));
        if partial.part_total != part_total {
            tracing::debug!(
                stream_id = %self.stream_id,
                message_id,
                "part total changed mid-message, restarting reassembly"
            );
            *partial = PartialMessage::new(part_total, now);
        }
        partial.insert(part_id, payload);

        if !partial.is_complete() {
            return None;
        }

        let complete = self.reassembly.remove(&message_id)?;
        self.flags = flags;
        Some(complete.assemble())
    }

    /// Drops partial messages whose first part arrived more than `max_age`
    /// ago. Returns how many were dropped.
    pub fn prune_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.reassembly.len();
        self.reassembly.retain(|_, partial| {
            now.saturating_duration_since(partial.started) <= max_age
        });
        before - self.reassembly.len()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_protocol::StreamOrigin;

    // -- Helpers ----------------------------------------------------------

    /// A small datagram size so a few dozen bytes already fragment:
    /// 23 header + 8 payload bytes per part.
    const SMALL_DATAGRAM: usize = DATA_HEADER_LEN + 8;

    fn reliable_stream() -> Stream {
        Stream::new(
            PeerId(1),
            StreamId::new(0, true, StreamOrigin::Client),
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Feeds every frame to `receiver` and returns what it delivered.
    fn deliver_all(receiver: &mut Stream, frames: Vec<DataFrame>) -> Vec<Vec<u8>> {
        let now = Instant::now();
        frames
            .into_iter()
            .filter_map(|frame| receiver.receive(frame, now))
            .collect()
    }

    // =====================================================================
    // fragment()
    // =====================================================================

    #[test]
    fn test_fragment_empty_payload_produces_one_empty_part() {
        let mut stream = reliable_stream();

        let frames = stream.fragment(&[], SMALL_DATAGRAM).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].part_id, 0);
        assert_eq!(frames[0].part_total, 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_fragment_splits_at_datagram_limit() {
        let mut stream = reliable_stream();

        let frames = stream.fragment(&payload(20), SMALL_DATAGRAM).unwrap();

        assert_eq!(frames.len(), 3);
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
        for (expected_id, frame) in frames.iter().enumerate() {
            assert_eq!(usize::from(frame.part_id), expected_id);
            assert_eq!(frame.part_total, 3);
            assert_eq!(frame.message_id, frames[0].message_id);
        }
    }

    #[test]
    fn test_fragment_exact_multiple_has_no_empty_tail() {
        let mut stream = reliable_stream();
        let frames = stream.fragment(&payload(16), SMALL_DATAGRAM).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_fragment_each_call_uses_new_message_id() {
        let mut stream = reliable_stream();

        let first = stream.fragment(b"a", SMALL_DATAGRAM).unwrap();
        let second = stream.fragment(b"b", SMALL_DATAGRAM).unwrap();

        assert_ne!(first[0].message_id, second[0].message_id);
    }

    #[test]
    fn test_fragment_message_id_wraps() {
        let mut stream = reliable_stream();
        stream.next_message_id = u16::MAX;

        let last = stream.fragment(b"a", SMALL_DATAGRAM).unwrap();
        let wrapped = stream.fragment(b"b", SMALL_DATAGRAM).unwrap();

        assert_eq!(last[0].message_id, u16::MAX);
        assert_eq!(wrapped[0].message_id, 0);
    }

    #[test]
    fn test_fragment_carries_current_flags() {
        let mut stream = reliable_stream();
        stream.set_flag(3, true);

        let frames = stream.fragment(&payload(20), SMALL_DATAGRAM).unwrap();

        assert!(frames.iter().all(|f| f.flags.get(3)));
    }

    #[test]
    fn test_fragment_too_many_parts_returns_error() {
        let mut stream = reliable_stream();

        let result = stream.fragment(&payload(8 * MAX_PARTS + 1), SMALL_DATAGRAM);

        assert_eq!(
            result,
            Err(SessionError::PayloadTooLarge {
                len: 8 * MAX_PARTS + 1,
                max: 8 * MAX_PARTS,
            })
        );
        // The failed call did not burn a message id.
        assert_eq!(stream.fragment(b"x", SMALL_DATAGRAM).unwrap()[0].message_id, 0);
    }

    #[test]
    fn test_fragment_max_parts_is_accepted() {
        let mut stream = reliable_stream();
        let frames = stream.fragment(&payload(8 * MAX_PARTS), SMALL_DATAGRAM).unwrap();
        assert_eq!(frames.len(), MAX_PARTS);
    }

    // =====================================================================
    // receive()
    // =====================================================================

    #[test]
    fn test_receive_reassembles_fragmented_payload() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();
        let original = payload(100);

        let frames = sender.fragment(&original, SMALL_DATAGRAM).unwrap();
        let delivered = deliver_all(&mut receiver, frames);

        assert_eq!(delivered, vec![original]);
        assert_eq!(receiver.pending_reassembly(), 0);
    }

    #[test]
    fn test_receive_out_of_order_parts() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();
        let original = payload(30);

        let mut frames = sender.fragment(&original, SMALL_DATAGRAM).unwrap();
        frames.reverse();
        let delivered = deliver_all(&mut receiver, frames);

        assert_eq!(delivered, vec![original]);
    }

    #[test]
    fn test_receive_duplicate_part_does_not_complete_early() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();
        let original = payload(20);
        let frames = sender.fragment(&original, SMALL_DATAGRAM).unwrap();
        let now = Instant::now();

        assert!(receiver.receive(frames[0].clone(), now).is_none());
        assert!(receiver.receive(frames[0].clone(), now).is_none());
        assert!(receiver.receive(frames[1].clone(), now).is_none());
        assert_eq!(receiver.receive(frames[2].clone(), now), Some(original));
    }

    #[test]
    fn test_receive_empty_payload_delivers_empty() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();

        let frames = sender.fragment(&[], SMALL_DATAGRAM).unwrap();
        let delivered = deliver_all(&mut receiver, frames);

        assert_eq!(delivered, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_receive_interleaved_messages() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();
        let first = payload(20);
        let second = vec![7u8; 12];

        let a = sender.fragment(&first, SMALL_DATAGRAM).unwrap();
        let b = sender.fragment(&second, SMALL_DATAGRAM).unwrap();
        let now = Instant::now();

        assert!(receiver.receive(a[0].clone(), now).is_none());
        assert!(receiver.receive(b[0].clone(), now).is_none());
        assert!(receiver.receive(a[1].clone(), now).is_none());
        assert_eq!(receiver.receive(b[1].clone(), now), Some(second));
        assert_eq!(receiver.receive(a[2].clone(), now), Some(first));
    }

    #[test]
    fn test_receive_updates_flags_on_completion_only() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();
        sender.set_flag(5, true);
        let frames = sender.fragment(&payload(20), SMALL_DATAGRAM).unwrap();
        let now = Instant::now();

        receiver.receive(frames[0].clone(), now);
        assert!(!receiver.get_flag(5));

        receiver.receive(frames[1].clone(), now);
        receiver.receive(frames[2].clone(), now);
        assert!(receiver.get_flag(5));
    }

    #[test]
    fn test_receive_conflicting_part_total_restarts_message() {
        let mut receiver = reliable_stream();
        let now = Instant::now();
        let part = |part_id, part_total, byte| DataFrame {
            peer_id: PeerId(1),
            stream_id: receiver_id(),
            flags: StreamFlags::default(),
            part_id,
            part_total,
            message_id: 9,
            payload: vec![byte],
        };

        assert!(receiver.receive(part(0, 3, b'x'), now).is_none());
        assert!(receiver.receive(part(1, 2, b'b'), now).is_none());
        assert_eq!(receiver.receive(part(0, 2, b'a'), now), Some(b"ab".to_vec()));
    }

    fn receiver_id() -> StreamId {
        StreamId::new(0, true, StreamOrigin::Client)
    }

    #[test]
    fn test_receive_invalid_part_numbering_is_ignored() {
        let mut receiver = reliable_stream();
        let frame = DataFrame {
            peer_id: PeerId(1),
            stream_id: receiver_id(),
            flags: StreamFlags::default(),
            part_id: 2,
            part_total: 2,
            message_id: 0,
            payload: vec![1],
        };

        assert!(receiver.receive(frame, Instant::now()).is_none());
        assert_eq!(receiver.pending_reassembly(), 0);
    }

    // =====================================================================
    // prune_stale()
    // =====================================================================

    #[test]
    fn test_prune_stale_drops_old_partial_messages() {
        let mut sender = reliable_stream();
        let mut receiver = reliable_stream();
        let frames = sender.fragment(&payload(20), SMALL_DATAGRAM).unwrap();
        let start = Instant::now();

        receiver.receive(frames[0].clone(), start);
        assert_eq!(receiver.pending_reassembly(), 1);

        let timeout = Duration::from_millis(100);
        assert_eq!(receiver.prune_stale(start + Duration::from_millis(50), timeout), 0);
        assert_eq!(receiver.prune_stale(start + Duration::from_millis(150), timeout), 1);
        assert_eq!(receiver.pending_reassembly(), 0);
    }

    // =====================================================================
    // flags
    // =====================================================================

    #[test]
    fn test_set_flag_out_of_range_is_noop() {
        let mut stream = reliable_stream();
        stream.set_flag(16, true);
        assert_eq!(stream.flags(), StreamFlags::default());
        assert!(!stream.get_flag(16));
    }
}
