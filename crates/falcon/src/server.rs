//! The listening side: `FalconServer` and its engine.
//!
//! The server keeps one [`Session`](falcon_session::Session) per client in
//! a [`SessionTable`]. A client joins with CONNECT and leaves by sending
//! DISCONNECT, by going silent past the liveness timeout, by becoming
//! unreachable, or by being kicked with
//! [`disconnect_client`](FalconServer::disconnect_client).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use falcon_protocol::{Frame, PROTOCOL_VERSION, PeerId, StreamId};
use falcon_session::{SessionTable, StreamHandle};
use falcon_transport::{Transport, UdpTransport};

use crate::listener::{
    Callbacks, ConnectionEngine, Event, Outbox, Worker, send_all, send_frame,
    unix_millis,
};
use crate::{FalconConfig, FalconError};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The server side of the protocol: handshake, per-peer routing, idle
/// expiry, and the retransmission sweep.
pub(crate) struct ServerEngine {
    sessions: SessionTable,
    config: FalconConfig,
    client_count: Arc<AtomicUsize>,
    last_retransmit: Instant,
    /// Events raised outside the loop, dispatched on its next tick.
    queued: Vec<Event>,
}

impl ServerEngine {
    pub(crate) fn new(
        config: FalconConfig,
        client_count: Arc<AtomicUsize>,
        now: Instant,
    ) -> Self {
        client_count.store(0, Ordering::Release);
        Self {
            sessions: SessionTable::new(config.session.clone()),
            config,
            client_count,
            last_retransmit: now,
            queued: Vec::new(),
        }
    }

    pub(crate) fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub(crate) fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }

    pub(crate) fn max_datagram_size(&self) -> usize {
        self.config.session.max_datagram_size
    }

    /// Removes a client's session on request of the application and queues
    /// its client-disconnected event for the loop. Returns the address the
    /// client was connected from.
    pub(crate) fn disconnect(&mut self, peer_id: PeerId) -> Option<SocketAddr> {
        let session = self.sessions.remove(peer_id)?;
        self.queued.push(Event::ClientDisconnected(peer_id));
        self.sync_count();
        Some(session.address())
    }

    /// Publishes the current number of sessions to the shared counter.
    pub(crate) fn sync_count(&self) {
        self.client_count
            .store(self.sessions.len(), Ordering::Release);
    }

    fn handle_connect(
        &mut self,
        version: u8,
        from: SocketAddr,
        now: Instant,
        out: &mut Outbox,
    ) {
        if version != PROTOCOL_VERSION {
            tracing::warn!(
                %from,
                version,
                expected = PROTOCOL_VERSION,
                "rejecting CONNECT with unsupported protocol version"
            );
            return;
        }

        let peer_id = self.sessions.create(from, now);
        tracing::info!(%peer_id, %from, "client connected");
        out.send(
            from,
            Some(peer_id),
            Frame::ConnectAck {
                peer_id,
                version: PROTOCOL_VERSION,
            },
        );
        out.emit(Event::ClientConnected(peer_id));
    }
}

impl ConnectionEngine for ServerEngine {
    fn handle_frame(
        &mut self,
        frame: Frame,
        from: SocketAddr,
        now: Instant,
        out: &mut Outbox,
    ) {
        let peer_id = match frame {
            Frame::Connect { version } => {
                self.handle_connect(version, from, now, out);
                self.sync_count();
                return;
            }
            ref other => match other.peer_id() {
                Some(peer_id) => peer_id,
                None => return,
            },
        };

        let Some(session) = self.sessions.get_mut(peer_id) else {
            tracing::debug!(%peer_id, %from, kind = %frame.kind(), "dropping frame for unknown peer");
            return;
        };
        if session.address() != from {
            tracing::debug!(
                %peer_id,
                %from,
                expected = %session.address(),
                "dropping frame from unexpected address"
            );
            return;
        }
        session.touch(now);

        match frame {
            Frame::Disconnect { .. } => {
                self.sessions.remove(peer_id);
                tracing::info!(%peer_id, "client disconnected");
                out.emit(Event::ClientDisconnected(peer_id));
            }
            Frame::Ping { ping_id, .. } => {
                tracing::trace!(%peer_id, ping_id, "ping");
                out.send(
                    from,
                    Some(peer_id),
                    Frame::Pong {
                        peer_id,
                        ping_id,
                        timestamp: unix_millis(),
                    },
                );
            }
            Frame::CreateStream { stream_id, .. } => {
                if session.open_stream(stream_id) {
                    tracing::debug!(%peer_id, %stream_id, "stream mirrored");
                }
            }
            Frame::CloseStream { stream_id, .. } => {
                if session.close_stream(stream_id) {
                    tracing::debug!(%peer_id, %stream_id, "stream closed by client");
                }
            }
            Frame::Data(data) => {
                if let Some(delivery) = session.receive_data(data, now) {
                    if let Some(ack) = delivery.ack {
                        out.send(from, Some(peer_id), ack);
                    }
                    out.emit(Event::Data {
                        peer_id,
                        stream_id: delivery.stream_id,
                        payload: delivery.payload,
                    });
                }
            }
            Frame::DataAck { stream_id, .. } => {
                if session.acknowledge(stream_id) {
                    tracing::trace!(%peer_id, %stream_id, "payload acknowledged");
                }
            }
            other => {
                tracing::debug!(%peer_id, kind = %other.kind(), "ignoring unexpected frame");
            }
        }
        self.sync_count();
    }

    fn tick(&mut self, now: Instant, out: &mut Outbox) {
        out.events.append(&mut self.queued);
        for peer_id in self.sessions.expire_idle(now) {
            out.emit(Event::ClientDisconnected(peer_id));
        }

        if now.saturating_duration_since(self.last_retransmit)
            >= self.config.retransmit_interval
        {
            self.last_retransmit = now;
            let resend = self.sessions.retransmit_all();
            if !resend.is_empty() {
                tracing::trace!(parts = resend.len(), "retransmitting");
            }
            for (peer_id, address, frame) in resend {
                out.send(address, Some(peer_id), frame);
            }
        }

        self.sessions.prune_reassembly(now);
        self.sync_count();
    }

    fn handle_send_failure(
        &mut self,
        peer_id: Option<PeerId>,
        events: &mut Vec<Event>,
    ) {
        let Some(peer_id) = peer_id else {
            return;
        };
        if self.sessions.remove(peer_id).is_some() {
            tracing::warn!(%peer_id, "client unreachable, dropping session");
            events.push(Event::ClientDisconnected(peer_id));
            self.sync_count();
        }
    }

    fn is_finished(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// FalconServer
// ---------------------------------------------------------------------------

/// The listening side of Falcon connections.
///
/// # Example
///
/// ```rust,no_run
/// use falcon::prelude::*;
///
/// # async fn demo() -> Result<(), FalconError> {
/// let mut server = FalconServer::new(FalconConfig::default());
/// server.on_client_connected(|peer_id| println!("{peer_id} joined"));
/// server.listen("0.0.0.0:5555").await?;
/// # Ok(())
/// # }
/// ```
pub struct FalconServer<T: Transport = UdpTransport> {
    config: FalconConfig,
    callbacks: Callbacks,
    client_count: Arc<AtomicUsize>,
    worker: Option<Worker<ServerEngine, T>>,
}

impl FalconServer {
    /// Creates a server that will listen on UDP.
    pub fn new(config: FalconConfig) -> Self {
        Self::with_config(config)
    }

    /// Binds `addr` (`"host:port"`, port 0 for an ephemeral one) and starts
    /// the listener loop.
    ///
    /// # Errors
    /// [`FalconError::AlreadyRunning`], [`FalconError::InvalidConfig`], or
    /// a transport error if binding fails.
    pub async fn listen(&mut self, addr: &str) -> Result<(), FalconError> {
        if self.worker.is_some() {
            return Err(FalconError::AlreadyRunning);
        }
        self.config.validate()?;
        let transport = UdpTransport::bind(addr).await?;
        self.listen_with(transport)
    }
}

impl<T: Transport> FalconServer<T> {
    /// Creates a stopped server for any transport.
    pub fn with_config(config: FalconConfig) -> Self {
        Self {
            config,
            callbacks: Callbacks::default(),
            client_count: Arc::new(AtomicUsize::new(0)),
            worker: None,
        }
    }

    /// Starts the listener loop on an already bound transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen_with(&mut self, transport: T) -> Result<(), FalconError> {
        if self.worker.is_some() {
            return Err(FalconError::AlreadyRunning);
        }
        self.config.validate()?;

        let local = transport.local_addr()?;
        let engine = ServerEngine::new(
            self.config.clone(),
            Arc::clone(&self.client_count),
            Instant::now(),
        );
        self.worker = Some(Worker::spawn(
            engine,
            Arc::new(transport),
            self.callbacks.clone(),
            self.config.receive_timeout,
        ));
        tracing::info!(%local, "listening");
        Ok(())
    }

    /// Sends DISCONNECT to every client and stops the listener loop.
    ///
    /// Does not fire the client-disconnected callback. Calling it while
    /// not listening does nothing.
    pub async fn stop_listening(&mut self) -> Result<(), FalconError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let transport = Arc::clone(worker.transport());
        let engine = worker.stop().await;
        let sessions = {
            let mut engine = engine.lock().await;
            let sessions = engine.sessions_mut().drain();
            engine.sync_count();
            sessions
        };

        let mut result = Ok(());
        for session in sessions {
            let peer_id = session.peer_id();
            let disconnect = Frame::Disconnect { peer_id };
            if let Err(e) =
                send_frame(transport.as_ref(), session.address(), &disconnect).await
            {
                tracing::warn!(%peer_id, error = %e, "cannot notify client of shutdown");
                result = Err(e);
            }
        }
        tracing::info!("stopped listening");
        result
    }

    // -- State --------------------------------------------------------------

    /// `true` while the listener loop is running.
    pub fn is_listening(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// The bound address, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker
            .as_ref()
            .and_then(|worker| worker.transport().local_addr().ok())
    }

    /// Number of live client sessions.
    pub fn get_active_client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    /// Ids of the live clients, in ascending order.
    pub async fn peers(&self) -> Vec<PeerId> {
        match self.worker() {
            Ok(worker) => worker.engine().lock().await.sessions().peer_ids(),
            Err(_) => Vec::new(),
        }
    }

    pub fn config(&self) -> &FalconConfig {
        &self.config
    }

    // -- Peers and streams --------------------------------------------------

    /// Ends a client's session and sends it DISCONNECT. The
    /// client-disconnected callback fires on the listener loop's next
    /// iteration.
    ///
    /// # Errors
    /// `UnknownPeer` (as [`FalconError::Session`]) if the client is not
    /// connected, [`FalconError::NotConnected`] if not listening.
    pub async fn disconnect_client(&self, peer_id: PeerId) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let address = worker
            .engine()
            .lock()
            .await
            .disconnect(peer_id)
            .ok_or(falcon_session::SessionError::UnknownPeer(peer_id))?;

        tracing::info!(%peer_id, "disconnecting client");
        send_frame(
            worker.transport().as_ref(),
            address,
            &Frame::Disconnect { peer_id },
        )
        .await
    }

    /// Opens a server-originated stream to a client and announces it with
    /// CREATE_STREAM so the client mirrors it.
    pub async fn create_stream(
        &self,
        peer_id: PeerId,
        reliable: bool,
    ) -> Result<StreamHandle, FalconError> {
        let worker = self.worker()?;
        let (address, stream_id) = {
            let mut engine = worker.engine().lock().await;
            let session = engine.sessions_mut().require_mut(peer_id)?;
            (session.address(), session.create_stream(reliable))
        };

        let handle = StreamHandle { peer_id, stream_id };
        tracing::debug!(stream = %handle, "stream created");
        send_frame(
            worker.transport().as_ref(),
            address,
            &Frame::CreateStream { peer_id, stream_id },
        )
        .await?;
        Ok(handle)
    }

    /// Closes a stream and tells the client. Closing a stream that is not
    /// open is not an error; an unknown peer is.
    pub async fn close_stream(&self, handle: StreamHandle) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let StreamHandle { peer_id, stream_id } = handle;
        let (address, removed) = {
            let mut engine = worker.engine().lock().await;
            let session = engine.sessions_mut().require_mut(peer_id)?;
            (session.address(), session.close_stream(stream_id))
        };

        if removed {
            tracing::debug!(stream = %handle, "stream closed");
            send_frame(
                worker.transport().as_ref(),
                address,
                &Frame::CloseStream { peer_id, stream_id },
            )
            .await?;
        }
        Ok(())
    }

    /// Sends `payload` to a client on one of its streams.
    ///
    /// # Errors
    /// `UnknownPeer`, `UnknownStream`, or `PayloadTooLarge` (as
    /// [`FalconError::Session`]), or a transport error.
    pub async fn send_data(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
        payload: &[u8],
    ) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let (address, frames) = {
            let mut engine = worker.engine().lock().await;
            let max_datagram_size = engine.max_datagram_size();
            let session = engine.sessions_mut().require_mut(peer_id)?;
            let frames = session.send(stream_id, payload, max_datagram_size)?;
            (session.address(), frames)
        };
        send_all(worker.transport().as_ref(), address, &frames).await
    }

    /// Ids of a client's open streams, from both namespaces.
    pub async fn streams(&self, peer_id: PeerId) -> Result<Vec<StreamId>, FalconError> {
        let worker = self.worker()?;
        let engine = worker.engine().lock().await;
        Ok(engine.sessions().require(peer_id)?.stream_ids())
    }

    /// `true` while a reliable payload to `peer_id` on `stream_id` waits
    /// for its ack.
    pub async fn has_pending_ack(&self, peer_id: PeerId, stream_id: StreamId) -> bool {
        let Ok(worker) = self.worker() else {
            return false;
        };
        let engine = worker.engine().lock().await;
        engine
            .sessions()
            .get(peer_id)
            .is_some_and(|session| session.has_pending_ack(stream_id))
    }

    /// Sets flag `index` (0..16) of a client's stream; other indices are
    /// ignored.
    pub async fn set_stream_flag(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
        index: usize,
        value: bool,
    ) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let mut engine = worker.engine().lock().await;
        engine
            .sessions_mut()
            .require_mut(peer_id)?
            .set_stream_flag(stream_id, index, value)?;
        Ok(())
    }

    /// Reads flag `index` of a client's stream; other indices read `false`.
    pub async fn get_stream_flag(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
        index: usize,
    ) -> Result<bool, FalconError> {
        let worker = self.worker()?;
        let engine = worker.engine().lock().await;
        Ok(engine
            .sessions()
            .require(peer_id)?
            .get_stream_flag(stream_id, index)?)
    }

    fn worker(&self) -> Result<&Worker<ServerEngine, T>, FalconError> {
        self.worker.as_ref().ok_or(FalconError::NotConnected)
    }

    // -- Callbacks ----------------------------------------------------------

    /// Called with the id of every client that completes the handshake.
    pub fn on_client_connected<F>(&mut self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.callbacks.on_client_connected = Some(Arc::new(callback));
    }

    /// Called once per client that leaves: by DISCONNECT, liveness
    /// timeout, send failure, or [`disconnect_client`](Self::disconnect_client).
    pub fn on_client_disconnected<F>(&mut self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.callbacks.on_client_disconnected = Some(Arc::new(callback));
    }

    /// Called with every reassembled payload from any client.
    pub fn on_data_received<F>(&mut self, callback: F)
    where
        F: Fn(PeerId, StreamId, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.on_data_received = Some(Arc::new(callback));
    }
}

impl<T: Transport> std::fmt::Debug for FalconServer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalconServer")
            .field("listening", &self.is_listening())
            .field("clients", &self.get_active_client_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Tests
// =========================================================================
