//! # Falcon
//!
//! Lightweight connection-oriented transport over UDP.
//!
//! A [`FalconServer`] accepts clients; a [`FalconClient`] connects to one
//! server. Once connected, either side can open streams and send payloads
//! of any size up to 255 datagrams:
//!
//! - **Reliable** streams acknowledge each payload, and the latest
//!   unacknowledged payload per stream is resent until it is.
//! - **Unreliable** streams are fire-and-forget.
//!
//! Both sides ping to keep the connection alive and drop it after
//! [`SessionConfig::liveness_timeout`] of silence.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use falcon::prelude::*;
//!
//! # async fn demo() -> Result<(), FalconError> {
//! let mut server = FalconServer::new(FalconConfig::default());
//! server.on_data_received(|peer_id, stream_id, data| {
//!     println!("{peer_id}/{stream_id}: {} bytes", data.len());
//! });
//! server.listen("127.0.0.1:5555").await?;
//!
//! let mut client = FalconClient::new(FalconConfig::default());
//! client.connect("127.0.0.1:5555").await?;
//! client.wait_until_connected().await?;
//! let stream = client.create_stream(true).await?;
//! client.send_data(stream.stream_id, b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod listener;
mod server;

pub use client::{ConnectionState, FalconClient};
pub use config::{FalconConfig, MAX_UDP_PAYLOAD};
pub use error::FalconError;
pub use server::FalconServer;

pub use falcon_protocol::{PROTOCOL_VERSION, PeerId, StreamFlags, StreamId, StreamOrigin};
pub use falcon_session::{SessionConfig, SessionError, StreamHandle};
pub use falcon_transport::{Transport, TransportError, UdpTransport};

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        ConnectionState, FalconClient, FalconConfig, FalconError, FalconServer,
        PROTOCOL_VERSION, PeerId, SessionConfig, SessionError, StreamFlags,
        StreamHandle, StreamId, Transport, UdpTransport,
    };
}
