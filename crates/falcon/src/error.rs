//! Unified error type for Falcon.

use falcon_protocol::ProtocolError;
use falcon_session::SessionError;
use falcon_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The engines return this single type. The `#[from]` variants let `?`
/// lift sub-crate errors without ceremony.
#[derive(Debug, thiserror::Error)]
pub enum FalconError {
    /// A transport-level error (bind, send, receive, resolve).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (unknown stream or peer, oversized payload).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The operation needs an established connection or a running listener.
    #[error("not connected")]
    NotConnected,

    /// `connect` or `listen` was called while already active.
    #[error("engine is already running")]
    AlreadyRunning,

    /// No CONNECT_ACK arrived within the connect timeout.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The configuration cannot work; the message says which field.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
