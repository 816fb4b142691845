//! Error types for the session layer.

use falcon_protocol::{PeerId, StreamId};

/// Errors returned by session and stream operations.
///
/// None of these are fatal: they describe a single bad request from the
/// caller and leave all other state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The stream id is not registered on this session.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// No session exists for the given peer.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The payload needs more parts than a DATA frame can number.
    #[error("payload of {len} bytes exceeds the {max}-byte stream limit")]
    PayloadTooLarge { len: usize, max: usize },
}
