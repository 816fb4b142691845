//! UDP transport implementation using `tokio::net::UdpSocket`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::{MAX_DATAGRAM_SIZE, Transport, TransportError};

/// A [`Transport`] over one unconnected UDP socket.
///
/// The same type serves both sides: a server binds a well-known address,
/// a client binds an ephemeral one.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a new UDP transport to the given address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(TransportError::BindFailed)?;
        let local = socket.local_addr().map_err(TransportError::BindFailed)?;
        tracing::debug!(%local, "UDP transport bound");
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    async fn send_to(
        &self,
        to: SocketAddr,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.socket
            .send_to(data, to)
            .await
            .map_err(TransportError::SendFailed)
    }

    async fn recv_from(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Ok(Some((buf, from)))
            }
            Ok(Err(e)) => Err(TransportError::ReceiveFailed(e)),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::BindFailed)
    }
}
