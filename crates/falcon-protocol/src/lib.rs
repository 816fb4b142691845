//! Wire protocol for Falcon.
//!
//! This crate defines the "language" that clients and servers speak:
//!
//! - **Types** ([`PeerId`], [`StreamId`], [`StreamFlags`], [`MessageKind`]):
//!   the identifiers and enums that travel inside every frame.
//! - **Codec** ([`Frame`], [`DataFrame`]): the fixed-offset binary layout
//!   of each message kind and how it is converted to/from bytes.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw datagrams) and session
//! (per-peer state). It doesn't know about sockets, peers, or timers;
//! it only knows how to lay frames out in bytes and read them back.
//!
//! ```text
//! Transport (datagrams) → Protocol (Frame) → Session (peer + stream state)
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod error;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{
    CONNECT_ACK_LEN, CONNECT_LEN, DATA_ACK_HEADER_LEN, DATA_HEADER_LEN,
    DISCONNECT_LEN, DataFrame, Frame, PING_LEN, STREAM_CONTROL_LEN,
};
pub use error::ProtocolError;
pub use types::{
    MessageKind, PROTOCOL_VERSION, PeerId, StreamFlags, StreamId, StreamOrigin,
};
