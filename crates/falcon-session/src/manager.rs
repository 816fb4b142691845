//! The session table: every peer the listening side is talking to.
//!
//! This is the server's registry. It's responsible for:
//! - Assigning peer ids to new clients
//! - Looking sessions up by peer id
//! - Expiring peers that went silent
//! - Collecting the retransmission sweep across all peers
//!
//! # Concurrency note
//!
//! `SessionTable` is a plain `HashMap` wrapper and is not thread-safe by
//! itself. The engine owns it behind one mutex shared by the listener
//! loop and the public API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use falcon_protocol::{Frame, PeerId, StreamOrigin};

use crate::{Session, SessionConfig, SessionError};

/// All live sessions on the listening side, keyed by peer id.
///
/// ## Lifecycle
///
/// ```text
/// CONNECT ──→ create() ──→ [live] ──→ remove()       (DISCONNECT, kick)
///                             │
///                             └────→ expire_idle()  (liveness timeout)
/// ```
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<PeerId, Session>,
    /// Next id to hand out. Ids are never reused within one table.
    next_peer_id: u64,
    config: SessionConfig,
}

impl SessionTable {
    /// Creates an empty table. The first peer gets id 1.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            next_peer_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Registers a new peer at `address` and returns its id.
    pub fn create(&mut self, address: SocketAddr, now: Instant) -> PeerId {
        let peer_id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        self.sessions.insert(
            peer_id,
            Session::new(peer_id, address, StreamOrigin::Server, now),
        );
        tracing::debug!(%peer_id, %address, "session created");
        peer_id
    }

    /// Removes a session with all of its streams and pending acks.
    pub fn remove(&mut self, peer_id: PeerId) -> Option<Session> {
        self.sessions.remove(&peer_id)
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Session> {
        self.sessions.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: PeerId) -> Option<&mut Session> {
        self.sessions.get_mut(&peer_id)
    }

    /// Like [`get`](Self::get), but an absent peer is an error.
    pub fn require(&self, peer_id: PeerId) -> Result<&Session, SessionError> {
        self.get(peer_id).ok_or(SessionError::UnknownPeer(peer_id))
    }

    /// Like [`get_mut`](Self::get_mut), but an absent peer is an error.
    pub fn require_mut(
        &mut self,
        peer_id: PeerId,
    ) -> Result<&mut Session, SessionError> {
        self.get_mut(peer_id).ok_or(SessionError::UnknownPeer(peer_id))
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.sessions.contains_key(&peer_id)
    }

    /// Removes every session silent for longer than the liveness timeout.
    ///
    /// Returns the removed peer ids, in ascending order.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.config.liveness_timeout;
        let mut expired: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now, timeout))
            .map(Session::peer_id)
            .collect();
        expired.sort();

        for peer_id in &expired {
            self.sessions.remove(peer_id);
            tracing::info!(%peer_id, "session expired (liveness timeout)");
        }
        expired
    }

    /// Collects the retransmission of every pending payload of every peer.
    ///
    /// Each entry is `(peer, peer address, frame)`.
    pub fn retransmit_all(&mut self) -> Vec<(PeerId, SocketAddr, Frame)> {
        let max_datagram_size = self.config.max_datagram_size;
        let mut out = Vec::new();
        for session in self.sessions.values_mut() {
            let peer_id = session.peer_id();
            let address = session.address();
            out.extend(
                session
                    .retransmit(max_datagram_size)
                    .into_iter()
                    .map(|frame| (peer_id, address, frame)),
            );
        }
        out
    }

    /// Drops stale partial messages on every peer.
    pub fn prune_reassembly(&mut self, now: Instant) -> usize {
        let max_age = self.config.liveness_timeout;
        self.sessions
            .values_mut()
            .map(|session| session.prune_reassembly(now, max_age))
            .sum()
    }

    /// Removes and returns every session.
    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    /// Ids of all live peers, in ascending order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// =========================================================================
// Tests
// =========================================================================
