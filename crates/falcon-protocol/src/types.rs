//! Core protocol types: identifiers, stream flags, and message kinds.
//!
//! Every type in this module appears inside frames on the wire, so each
//! one has a fixed width that matches the layout in [`crate::Frame`].

use std::fmt;

/// The protocol version carried in CONNECT and CONNECT_ACK frames.
///
/// Peers drop handshakes that carry any other value.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A server-assigned identifier for a client session.
///
/// The server hands this out in CONNECT_ACK and it stays stable for the
/// lifetime of the session. Every frame after the initial CONNECT carries
/// it, in both directions, so either side can tell which session a frame
/// belongs to.
///
/// Newtype over `u64` so a peer id can't be mixed up with a stream id or
/// a raw counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Which side of a session created a stream.
///
/// Client- and server-originated ids live in separate namespaces (bit 30 of
/// the id), so both sides can allocate ids for the same peer without a
/// round trip and without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOrigin {
    /// Created by the connecting side.
    Client,
    /// Created by the listening side.
    Server,
}

/// Identifier of a multiplexed stream within a session.
///
/// ```text
///  31  30  29 ............................ 0
/// +---+---+---------------------------------+
/// | R | S |            ordinal              |
/// +---+---+---------------------------------+
/// R = reliable, S = server-originated
/// ```
///
/// The reliable bit is fixed at creation: a stream never switches between
/// reliable and unreliable delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Bit marking a reliable stream.
    pub const RELIABLE_BIT: u32 = 1 << 31;
    /// Bit marking a stream created by the listening side.
    pub const SERVER_ORIGIN_BIT: u32 = 1 << 30;
    /// Bits available for the per-peer ordinal.
    pub const ORDINAL_MASK: u32 = Self::SERVER_ORIGIN_BIT - 1;

    /// Builds a stream id from its parts. Ordinal bits above
    /// [`Self::ORDINAL_MASK`] are discarded.
    pub fn new(ordinal: u32, reliable: bool, origin: StreamOrigin) -> Self {
        let mut raw = ordinal & Self::ORDINAL_MASK;
        if reliable {
            raw |= Self::RELIABLE_BIT;
        }
        if origin == StreamOrigin::Server {
            raw |= Self::SERVER_ORIGIN_BIT;
        }
        Self(raw)
    }

    /// Returns `true` if payloads on this stream are retransmitted until
    /// acknowledged.
    pub fn is_reliable(self) -> bool {
        self.0 & Self::RELIABLE_BIT != 0
    }

    /// Returns `true` if the listening side allocated this id.
    pub fn is_server_origin(self) -> bool {
        self.0 & Self::SERVER_ORIGIN_BIT != 0
    }

    /// Which side allocated this id.
    pub fn origin(self) -> StreamOrigin {
        if self.is_server_origin() {
            StreamOrigin::Server
        } else {
            StreamOrigin::Client
        }
    }

    /// The per-peer ordinal part of the id.
    pub fn ordinal(self) -> u32 {
        self.0 & Self::ORDINAL_MASK
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = if self.is_server_origin() { 's' } else { 'c' };
        let mode = if self.is_reliable() { 'r' } else { 'u' };
        write!(f, "stream-{origin}{mode}{}", self.ordinal())
    }
}

// ---------------------------------------------------------------------------
// Stream flags
// ---------------------------------------------------------------------------

/// Sixteen application-defined boolean flags carried on every DATA frame.
///
/// Indices outside `0..16` are ignored by [`set`](Self::set) and read as
/// `false` by [`get`](Self::get); they are never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(pub u16);

impl StreamFlags {
    /// Number of independent flags.
    pub const COUNT: usize = 16;

    /// Sets or clears the flag at `index`.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= Self::COUNT {
            return;
        }
        let bit = 1u16 << index;
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Reads the flag at `index`.
    pub fn get(self, index: usize) -> bool {
        index < Self::COUNT && self.0 & (1u16 << index) != 0
    }
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Connect = 0,
    ConnectAck = 1,
    Disconnect = 2,
    Ping = 3,
    Pong = 4,
    CreateStream = 5,
    CloseStream = 6,
    Data = 7,
    DataAck = 8,
}

impl MessageKind {
    /// Parses a kind byte, returning `None` for unknown values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let kind = match byte {
            0 => Self::Connect,
            1 => Self::ConnectAck,
            2 => Self::Disconnect,
            3 => Self::Ping,
            4 => Self::Pong,
            5 => Self::CreateStream,
            6 => Self::CloseStream,
            7 => Self::Data,
            8 => Self::DataAck,
            _ => return None,
        };
        Some(kind)
    }

    /// The byte written on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::ConnectAck => "CONNECT_ACK",
            Self::Disconnect => "DISCONNECT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::CreateStream => "CREATE_STREAM",
            Self::CloseStream => "CLOSE_STREAM",
            Self::Data => "DATA",
            Self::DataAck => "DATA_ACK",
        };
        f.write_str(name)
    }
}
