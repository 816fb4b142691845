//! Transport abstraction layer for Falcon.
//!
//! Provides the [`Transport`] trait: an unconnected datagram socket that
//! can send to any address and receive from any address with a bounded
//! wait. Everything above this layer (frames, sessions, retransmission) is
//! written against the trait, so tests can swap the real socket for one
//! that loses or rewrites datagrams.
//!
//! # Feature Flags
//!
//! - `udp` (default): [`UdpTransport`] over `tokio::net::UdpSocket`
//! - `simulator`: [`LossyTransport`], a wrapper that drops outgoing
//!   datagrams with a seeded, reproducible probability

mod error;
#[cfg(any(test, feature = "simulator"))]
mod lossy;
#[cfg(feature = "udp")]
mod udp;

pub use error::TransportError;
#[cfg(any(test, feature = "simulator"))]
pub use lossy::LossyTransport;
#[cfg(feature = "udp")]
pub use udp::UdpTransport;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

/// Largest datagram a transport will hand back from a receive.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Sends and receives whole datagrams.
///
/// All methods take `&self` so one transport can be shared between the
/// task that drives a connection and the callers that send on it.
pub trait Transport: Send + Sync + 'static {
    /// Sends `data` as one datagram to `to`, returning the bytes written.
    fn send_to(
        &self,
        to: SocketAddr,
        data: &[u8],
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Waits up to `timeout` for the next datagram.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Datagrams are
    /// returned whole; there is no partial read.
    fn recv_from(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<(Vec<u8>, SocketAddr)>, TransportError>>
    + Send;

    /// The address this transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Resolves `addr` (`"host:port"`) to the first address it names.
///
/// # Errors
/// Returns [`TransportError::AddressResolution`] if the lookup fails or
/// yields nothing.
pub async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::AddressResolution(format!("{addr}: {e}")))?;
    addrs.next().ok_or_else(|| {
        TransportError::AddressResolution(format!("{addr}: no addresses"))
    })
}

/// The wildcard address of the same family as `peer`, with an ephemeral
/// port. Used to bind the local end of an outgoing connection.
pub fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    use std::net::{Ipv4Addr, Ipv6Addr};
    match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}
