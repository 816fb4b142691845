//! Fault-injecting transport for exercising retransmission.
//!
//! Real networks drop datagrams. [`LossyTransport`] wraps any other
//! transport and silently discards outgoing datagrams with probability
//! `loss_rate`, using a seeded RNG so a failing test replays the same
//! losses every run.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Transport, TransportError};

/// Wraps a transport and drops a fraction of the datagrams sent through it.
///
/// A dropped send still reports success with the full length, exactly like
/// a datagram lost somewhere on the network.
pub struct LossyTransport<T> {
    inner: T,
    loss_rate: f64,
    rng: Mutex<StdRng>,
    dropped: AtomicU64,
}

impl<T: Transport> LossyTransport<T> {
    /// Wraps `inner`. `loss_rate` is clamped to `[0.0, 1.0]`; NaN means
    /// no loss.
    pub fn new(inner: T, loss_rate: f64, seed: u64) -> Self {
        let loss_rate = if loss_rate.is_nan() {
            0.0
        } else {
            loss_rate.clamp(0.0, 1.0)
        };
        Self {
            inner,
            loss_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of datagrams discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn should_drop(&self) -> bool {
        // A poisoned lock only means another sender panicked mid-draw; the
        // RNG state is still usable.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.random_bool(self.loss_rate)
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    async fn send_to(
        &self,
        to: SocketAddr,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        if self.should_drop() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%to, len = data.len(), "simulated datagram loss");
            return Ok(data.len());
        }
        self.inner.send_to(to, data).await
    }

    async fn recv_from(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, TransportError> {
        self.inner.recv_from(timeout).await
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr()
    }
}
