//! The per-peer session record.
//!
//! A session is what one side knows about the other:
//! - WHO the peer is (`PeerId`) and WHERE it is (`SocketAddr`)
//! - WHEN it was last heard from (for the liveness timeout)
//! - WHICH streams are open, and which reliable payloads still wait for
//!   a DATA_ACK

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use falcon_protocol::{DataFrame, Frame, PeerId, StreamId, StreamOrigin};

use crate::{SessionError, Stream};

/// Names one stream of one session.
///
/// Returned by the engines' `create_stream` and accepted by their
/// `close_stream`. It is a plain pair of ids, not a reference: it stays
/// valid to pass around after the stream or session is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer_id, self.stream_id)
    }
}

/// A payload that finished reassembly on some stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stream the payload arrived on.
    pub stream_id: StreamId,
    /// The reassembled bytes.
    pub payload: Vec<u8>,
    /// DATA_ACK to send back when the stream is reliable.
    pub ack: Option<Frame>,
}

/// One side's record of a connection to a peer.
///
/// The server holds one per connected client; the client holds one for
/// the server once the handshake completes. Dropping a session drops its
/// streams and pending acks with it.
#[derive(Debug)]
pub struct Session {
    peer_id: PeerId,
    address: SocketAddr,
    last_seen: Instant,
    /// Namespace used for ids this side allocates.
    origin: StreamOrigin,
    next_stream_ordinal: u32,
    streams: HashMap<StreamId, Stream>,
    /// Latest unacknowledged payload per reliable stream.
    pending_acks: HashMap<StreamId, Vec<u8>>,
}

impl Session {
    /// Creates a session that allocates stream ids in `origin`'s namespace.
    pub fn new(
        peer_id: PeerId,
        address: SocketAddr,
        origin: StreamOrigin,
        now: Instant,
    ) -> Self {
        Self {
            peer_id,
            address,
            last_seen: now,
            origin,
            next_stream_ordinal: 0,
            streams: HashMap::new(),
            pending_acks: HashMap::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Records that a frame from the peer arrived at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = self.last_seen.max(now);
    }

    /// Returns `true` once the peer has been silent for longer than
    /// `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    // -- Streams ------------------------------------------------------------

    /// Allocates a new stream id in this side's namespace and registers
    /// the stream.
    ///
    /// The ordinal counter wraps within its 30 bits; ids still in use are
    /// skipped.
    pub fn create_stream(&mut self, reliable: bool) -> StreamId {
        loop {
            let stream_id =
                StreamId::new(self.next_stream_ordinal, reliable, self.origin);
            self.next_stream_ordinal =
                self.next_stream_ordinal.wrapping_add(1) & StreamId::ORDINAL_MASK;
            if !self.streams.contains_key(&stream_id) {
                self.streams
                    .insert(stream_id, Stream::new(self.peer_id, stream_id));
                return stream_id;
            }
        }
    }

    /// Registers a stream the peer allocated. Returns `false` if it was
    /// already known.
    pub fn open_stream(&mut self, stream_id: StreamId) -> bool {
        if self.streams.contains_key(&stream_id) {
            return false;
        }
        self.streams
            .insert(stream_id, Stream::new(self.peer_id, stream_id));
        true
    }

    /// Removes a stream and its pending ack. Returns `false` if there was
    /// nothing to remove; that is not an error.
    pub fn close_stream(&mut self, stream_id: StreamId) -> bool {
        self.pending_acks.remove(&stream_id);
        self.streams.remove(&stream_id).is_some()
    }

    pub fn contains_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    /// Ids of all open streams, in ascending order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Sets flag `index` on a stream. Out-of-range indices are ignored.
    ///
    /// # Errors
    /// [`SessionError::UnknownStream`] if the stream is not open.
    pub fn set_stream_flag(
        &mut self,
        stream_id: StreamId,
        index: usize,
        value: bool,
    ) -> Result<(), SessionError> {
        self.stream_mut(stream_id)?.set_flag(index, value);
        Ok(())
    }

    /// Reads flag `index` of a stream. Out-of-range indices read `false`.
    ///
    /// # Errors
    /// [`SessionError::UnknownStream`] if the stream is not open.
    pub fn get_stream_flag(
        &self,
        stream_id: StreamId,
        index: usize,
    ) -> Result<bool, SessionError> {
        self.streams
            .get(&stream_id)
            .map(|stream| stream.get_flag(index))
            .ok_or(SessionError::UnknownStream(stream_id))
    }

    fn stream_mut(&mut self, stream_id: StreamId) -> Result<&mut Stream, SessionError> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))
    }

    // -- Sending and acknowledgment -----------------------------------------

    /// Fragments `payload` on a stream and returns the DATA frames to send.
    ///
    /// On a reliable stream the whole payload becomes the stream's pending
    /// ack, replacing any earlier one that was never acknowledged.
    ///
    /// # Errors
    /// - [`SessionError::UnknownStream`] if the stream is not open
    /// - [`SessionError::PayloadTooLarge`] if the payload cannot be split
    ///   into few enough parts; nothing is recorded then
    pub fn send(
        &mut self,
        stream_id: StreamId,
        payload: &[u8],
        max_datagram_size: usize,
    ) -> Result<Vec<Frame>, SessionError> {
        let stream = self.stream_mut(stream_id)?;
        let frames = stream.fragment(payload, max_datagram_size)?;
        if stream_id.is_reliable() {
            self.pending_acks.insert(stream_id, payload.to_vec());
        }
        Ok(frames.into_iter().map(Frame::Data).collect())
    }

    /// Clears the pending ack for `stream_id`. Returns `false` if nothing
    /// was pending.
    pub fn acknowledge(&mut self, stream_id: StreamId) -> bool {
        self.pending_acks.remove(&stream_id).is_some()
    }

    pub fn has_pending_ack(&self, stream_id: StreamId) -> bool {
        self.pending_acks.contains_key(&stream_id)
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Re-fragments every pending payload as a fresh message.
    ///
    /// Pending entries stay in place; only a DATA_ACK or closing the stream
    /// removes them.
    pub fn retransmit(&mut self, max_datagram_size: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        for (stream_id, payload) in &self.pending_acks {
            let Some(stream) = self.streams.get_mut(stream_id) else {
                continue;
            };
            match stream.fragment(payload, max_datagram_size) {
                Ok(parts) => frames.extend(parts.into_iter().map(Frame::Data)),
                Err(e) => {
                    tracing::warn!(
                        peer_id = %self.peer_id,
                        %stream_id,
                        error = %e,
                        "cannot retransmit pending payload"
                    );
                }
            }
        }
        frames
    }

    // -- Receiving ------------------------------------------------------------

    /// Routes an incoming DATA part to its stream.
    ///
    /// A part for an unknown stream opens that stream first, mirroring a
    /// stream the peer created. Returns the payload once its message is
    /// complete, together with the DATA_ACK to send if the stream is
    /// reliable.
    pub fn receive_data(&mut self, frame: DataFrame, now: Instant) -> Option<Delivery> {
        let stream_id = frame.stream_id;
        if self.open_stream(stream_id) {
            tracing::debug!(
                peer_id = %self.peer_id,
                %stream_id,
                "stream opened by incoming data"
            );
        }

        let stream = self.streams.get_mut(&stream_id)?;
        let payload = stream.receive(frame, now)?;
        let ack = stream_id.is_reliable().then(|| Frame::DataAck {
            peer_id: self.peer_id,
            stream_id,
            payload: Vec::new(),
        });

        Some(Delivery {
            stream_id,
            payload,
            ack,
        })
    }

    /// Drops partial messages older than `max_age` on every stream.
    pub fn prune_reassembly(&mut self, now: Instant, max_age: Duration) -> usize {
        self.streams
            .values_mut()
            .map(|stream| stream.prune_stale(now, max_age))
            .sum()
    }
}

// =========================================================================
// Tests
// =========================================================================
