//! Session and stream state for Falcon.
//!
//! This crate holds everything a connection remembers between datagrams:
//!
//! 1. **Streams** ([`Stream`]): fragmenting outgoing payloads into DATA
//!    frames and reassembling incoming parts, plus the 16 stream flags
//! 2. **Sessions** ([`Session`]): one per peer, owning its streams, its
//!    stream id allocator, and the pending-ack table for reliable streams
//! 3. **Session table** ([`SessionTable`]): the listening side's map of
//!    peers, with id assignment and idle expiry
//!
//! Nothing here touches a socket or a clock. Every operation that depends
//! on time takes `now: Instant`, and every operation that would send
//! something returns the frames instead, so the engine above decides when
//! and where they go.
//!
//! # How it fits in the stack
//!
//! ```text
//! Engine Layer (above)  ← drives sessions from the listener loop and the API
//!     ↕
//! Session Layer (this crate)  ← peer + stream state, fragments, pending acks
//!     ↕
//! Protocol Layer (below)  ← provides PeerId, StreamId, Frame types
//! ```

mod config;
mod error;
mod manager;
mod session;
mod stream;

pub use config::SessionConfig;
pub use error::SessionError;
pub use manager::SessionTable;
pub use session::{Delivery, Session, StreamHandle};
pub use stream::{MAX_PARTS, Stream};
