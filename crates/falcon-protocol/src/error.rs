//! Error types for the protocol layer.
//!
//! Each crate in Falcon defines its own error enum. When you see a
//! `ProtocolError`, you know the problem is in the byte layout of a frame,
//! not in the network or in session bookkeeping.

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The received bytes do not form a valid frame.
    ///
    /// Common causes: a buffer shorter than the kind's fixed header, an
    /// unknown kind byte, or a declared size that disagrees with the
    /// number of bytes actually received. The listener loop drops such
    /// frames and keeps going.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame would not fit in the 16-bit size field.
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}
