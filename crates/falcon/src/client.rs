//! The connecting side: `FalconClient` and its engine.
//!
//! ```text
//!   Disconnected ──connect()──→ Connecting ──CONNECT_ACK──→ Connected
//!        ↑                          │                          │
//!        └──── connect timeout ─────┘                          │
//!        └──── DISCONNECT / liveness timeout / send failure ───┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use falcon_protocol::{Frame, PROTOCOL_VERSION, PeerId, StreamId, StreamOrigin};
use falcon_session::{Session, StreamHandle};
use falcon_transport::{Transport, UdpTransport};
use tokio::sync::watch;

use crate::listener::{
    Callbacks, ConnectionEngine, Event, Outbox, Worker, send_all, send_frame,
    unix_millis,
};
use crate::{FalconConfig, FalconError};

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Where a client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// CONNECT sent, waiting for CONNECT_ACK.
    Connecting,
    /// Handshake done; the server assigned this peer id.
    Connected(PeerId),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The client side of the connection state machine.
///
/// Holds at most one session: the one with the server, created when the
/// CONNECT_ACK arrives.
pub(crate) struct ClientEngine {
    server: SocketAddr,
    config: FalconConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    connect_started: Instant,
    session: Option<Session>,
    next_ping_id: u16,
    /// `None` until the first PING of the current connection.
    last_ping: Option<Instant>,
    last_retransmit: Instant,
}

impl ClientEngine {
    pub(crate) fn new(
        server: SocketAddr,
        config: FalconConfig,
        state: Arc<watch::Sender<ConnectionState>>,
        now: Instant,
    ) -> Self {
        state.send_replace(ConnectionState::Connecting);
        Self {
            server,
            config,
            state,
            connect_started: now,
            session: None,
            next_ping_id: 0,
            last_ping: None,
            last_retransmit: now,
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The session, once connected.
    pub(crate) fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut Session, FalconError> {
        self.session.as_mut().ok_or(FalconError::NotConnected)
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    pub(crate) fn max_datagram_size(&self) -> usize {
        self.config.session.max_datagram_size
    }

    /// Drops the session and reports the right event for the phase the
    /// connection was in.
    fn fail(&mut self, events: &mut Vec<Event>) {
        match self.current() {
            ConnectionState::Connecting => {
                events.push(Event::ConnectResult(None));
            }
            ConnectionState::Connected(_) => events.push(Event::Disconnected),
            ConnectionState::Disconnected => return,
        }
        self.session = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn handle_connect_ack(
        &mut self,
        peer_id: PeerId,
        version: u8,
        now: Instant,
        out: &mut Outbox,
    ) {
        if self.current() != ConnectionState::Connecting {
            tracing::debug!(%peer_id, "ignoring CONNECT_ACK outside handshake");
            return;
        }
        if version != PROTOCOL_VERSION {
            tracing::warn!(
                version,
                expected = PROTOCOL_VERSION,
                "ignoring CONNECT_ACK with unsupported protocol version"
            );
            return;
        }

        self.session = Some(Session::new(
            peer_id,
            self.server,
            StreamOrigin::Client,
            now,
        ));
        self.last_ping = None;
        self.last_retransmit = now;
        self.state.send_replace(ConnectionState::Connected(peer_id));
        tracing::info!(%peer_id, server = %self.server, "connected");
        out.emit(Event::ConnectResult(Some(peer_id)));
    }
}

impl ConnectionEngine for ClientEngine {
    fn handle_frame(
        &mut self,
        frame: Frame,
        from: SocketAddr,
        now: Instant,
        out: &mut Outbox,
    ) {
        if from != self.server {
            tracing::debug!(%from, "dropping frame from unexpected address");
            return;
        }

        if let Frame::ConnectAck { peer_id, version } = frame {
            self.handle_connect_ack(peer_id, version, now, out);
            return;
        }

        let Some(session) = self.session.as_mut() else {
            tracing::debug!(kind = %frame.kind(), "dropping frame before handshake");
            return;
        };
        let peer_id = session.peer_id();
        if frame.peer_id() != Some(peer_id) {
            tracing::debug!(kind = %frame.kind(), "dropping frame for another peer");
            return;
        }
        session.touch(now);

        match frame {
            Frame::Disconnect { .. } => {
                tracing::info!(%peer_id, "server closed the connection");
                self.fail(&mut out.events);
            }
            Frame::Pong { ping_id, .. } => {
                tracing::trace!(%peer_id, ping_id, "pong");
            }
            Frame::CreateStream { stream_id, .. } => {
                if session.open_stream(stream_id) {
                    tracing::debug!(%peer_id, %stream_id, "stream mirrored");
                }
            }
            Frame::CloseStream { stream_id, .. } => {
                if session.close_stream(stream_id) {
                    tracing::debug!(%peer_id, %stream_id, "stream closed by server");
                }
            }
            Frame::Data(data) => {
                if let Some(delivery) = session.receive_data(data, now) {
                    if let Some(ack) = delivery.ack {
                        out.send(self.server, Some(peer_id), ack);
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
                tracing::debug!(kind = %other.kind(), "ignoring unexpected frame");
            }
        }
    }

    fn tick(&mut self, now: Instant, out: &mut Outbox) {
        match self.current() {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                let waited = now.saturating_duration_since(self.connect_started);
                if waited > self.config.connect_timeout {
                    tracing::info!(server = %self.server, "connect timed out");
                    self.fail(&mut out.events);
                }
            }
            ConnectionState::Connected(peer_id) => {
                let liveness = self.config.session.liveness_timeout;
                let Some(session) = self.session.as_mut() else {
                    return;
                };

                if session.is_expired(now, liveness) {
                    tracing::info!(%peer_id, "server went silent, disconnecting");
                    self.fail(&mut out.events);
                    return;
                }

                // At most one PING per receive timeout; a PONG also ends an
                // iteration.
                let ping_due = self.last_ping.is_none_or(|last| {
                    now.saturating_duration_since(last) >= self.config.receive_timeout
                });
                if ping_due {
                    self.last_ping = Some(now);
                    let ping_id = self.next_ping_id;
                    self.next_ping_id = self.next_ping_id.wrapping_add(1);
                    out.send(
                        self.server,
                        Some(peer_id),
                        Frame::Ping {
                            peer_id,
                            ping_id,
                            timestamp: unix_millis(),
                        },
                    );
                }

                if now.saturating_duration_since(self.last_retransmit)
                    >= self.config.retransmit_interval
                {
                    self.last_retransmit = now;
                    let frames =
                        session.retransmit(self.config.session.max_datagram_size);
                    if !frames.is_empty() {
                        tracing::trace!(%peer_id, parts = frames.len(), "retransmitting");
                    }
                    for frame in frames {
                        out.send(self.server, Some(peer_id), frame);
                    }
                }

                session.prune_reassembly(now, liveness);
            }
        }
    }

    fn handle_send_failure(
        &mut self,
        _peer_id: Option<PeerId>,
        events: &mut Vec<Event>,
    ) {
        tracing::warn!(server = %self.server, "cannot reach server, disconnecting");
        self.fail(events);
    }

    fn is_finished(&self) -> bool {
        self.current() == ConnectionState::Disconnected
    }
}

// ---------------------------------------------------------------------------
// FalconClient
// ---------------------------------------------------------------------------

/// The connecting side of a Falcon connection.
///
/// Register callbacks first, then [`connect`](FalconClient::connect).
/// Callbacks are copied into the listener loop when it starts, so ones
/// registered later apply from the next connection on.
///
/// # Example
///
/// ```rust,no_run
/// use falcon::prelude::*;
///
/// # async fn demo() -> Result<(), FalconError> {
/// let mut client = FalconClient::new(FalconConfig::default());
/// client.on_data_received(|stream_id, data| {
///     println!("{stream_id}: {} bytes", data.len());
/// });
/// client.connect("127.0.0.1:5555").await?;
/// client.wait_until_connected().await?;
///
/// let stream = client.create_stream(true).await?;
/// client.send_data(stream.stream_id, b"hello").await?;
/// # Ok(())
/// # }
/// ```
pub struct FalconClient<T: Transport = UdpTransport> {
    config: FalconConfig,
    callbacks: Callbacks,
    state: Arc<watch::Sender<ConnectionState>>,
    worker: Option<Worker<ClientEngine, T>>,
}

impl FalconClient {
    /// Creates a disconnected client that will use UDP.
    pub fn new(config: FalconConfig) -> Self {
        Self::with_config(config)
    }

    /// Resolves `addr` (`"host:port"`), binds an ephemeral UDP port of
    /// the same address family, and starts connecting.
    ///
    /// Returns once CONNECT is sent. The outcome arrives through
    /// [`on_connection_event`](Self::on_connection_event) or
    /// [`wait_until_connected`](Self::wait_until_connected).
    ///
    /// # Errors
    /// [`FalconError::AlreadyRunning`], [`FalconError::InvalidConfig`], or
    /// a transport error if resolving, binding, or sending fails.
    pub async fn connect(&mut self, addr: &str) -> Result<(), FalconError> {
        self.ensure_idle().await?;
        self.config.validate()?;
        let server = falcon_transport::resolve(addr).await?;
        let transport =
            UdpTransport::bind(falcon_transport::unspecified_for(server)).await?;
        self.connect_with(transport, server).await
    }
}

impl<T: Transport> FalconClient<T> {
    /// Creates a disconnected client for any transport.
    pub fn with_config(config: FalconConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            callbacks: Callbacks::default(),
            state: Arc::new(state),
            worker: None,
        }
    }

    /// Starts connecting to `server` over an already bound transport.
    ///
    /// # Errors
    /// Same as [`FalconClient::connect`], minus resolving and binding.
    pub async fn connect_with(
        &mut self,
        transport: T,
        server: SocketAddr,
    ) -> Result<(), FalconError> {
        self.ensure_idle().await?;
        self.config.validate()?;

        let transport = Arc::new(transport);
        let engine = ClientEngine::new(
            server,
            self.config.clone(),
            Arc::clone(&self.state),
            Instant::now(),
        );
        tracing::info!(%server, "connecting");

        let connect = Frame::Connect {
            version: PROTOCOL_VERSION,
        };
        if let Err(e) = send_frame(transport.as_ref(), server, &connect).await {
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(e);
        }

        self.worker = Some(Worker::spawn(
            engine,
            transport,
            self.callbacks.clone(),
            self.config.receive_timeout,
        ));
        Ok(())
    }

    /// Fails with `AlreadyRunning` if a connection is live or being set
    /// up; reaps the loop of a connection that already ended.
    async fn ensure_idle(&mut self) -> Result<(), FalconError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(FalconError::AlreadyRunning);
        }
        if let Some(worker) = self.worker.take() {
            worker.stop().await;
        }
        Ok(())
    }

    /// Waits for the handshake to finish.
    ///
    /// # Errors
    /// - [`FalconError::NotConnected`] if no connection attempt is active
    /// - [`FalconError::ConnectTimeout`] if the attempt fails
    pub async fn wait_until_connected(&self) -> Result<PeerId, FalconError> {
        let mut rx = self.state.subscribe();
        if *rx.borrow_and_update() == ConnectionState::Disconnected {
            return Err(FalconError::NotConnected);
        }
        let state = *rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| FalconError::NotConnected)?;
        match state {
            ConnectionState::Connected(peer_id) => Ok(peer_id),
            _ => Err(FalconError::ConnectTimeout),
        }
    }

    /// Closes the connection: sends DISCONNECT if connected, then stops
    /// the listener loop. Does not fire the disconnect callback.
    ///
    /// Calling it while already disconnected does nothing.
    pub async fn disconnect(&mut self) -> Result<(), FalconError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let transport = Arc::clone(worker.transport());
        let server = worker.engine().lock().await.server();
        worker.stop().await;

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if let ConnectionState::Connected(peer_id) = previous {
            tracing::info!(%peer_id, "disconnecting");
            send_frame(transport.as_ref(), server, &Frame::Disconnect { peer_id })
                .await?;
        }
        Ok(())
    }

    // -- State --------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected(_))
    }

    /// The id the server assigned, while connected.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.state() {
            ConnectionState::Connected(peer_id) => Some(peer_id),
            _ => None,
        }
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The local address of the transport, while a connection is active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker
            .as_ref()
            .and_then(|worker| worker.transport().local_addr().ok())
    }

    pub fn config(&self) -> &FalconConfig {
        &self.config
    }

    // -- Streams ------------------------------------------------------------

    /// Opens a stream to the server and announces it with CREATE_STREAM.
    ///
    /// # Errors
    /// [`FalconError::NotConnected`] before the handshake completes, or a
    /// transport error if the announcement cannot be sent (the stream is
    /// still open locally and the server mirrors it on first DATA).
    pub async fn create_stream(
        &self,
        reliable: bool,
    ) -> Result<StreamHandle, FalconError> {
        let worker = self.worker()?;
        let (server, handle) = {
            let mut engine = worker.engine().lock().await;
            let server = engine.server();
            let session = engine.session_mut()?;
            let stream_id = session.create_stream(reliable);
            let handle = StreamHandle {
                peer_id: session.peer_id(),
                stream_id,
            };
            (server, handle)
        };

        tracing::debug!(stream = %handle, "stream created");
        let announce = Frame::CreateStream {
            peer_id: handle.peer_id,
            stream_id: handle.stream_id,
        };
        send_frame(worker.transport().as_ref(), server, &announce).await?;
        Ok(handle)
    }

    /// Closes a stream and tells the server. Closing a stream that is not
    /// open is not an error.
    pub async fn close_stream(&self, handle: StreamHandle) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let (server, peer_id, removed) = {
            let mut engine = worker.engine().lock().await;
            let server = engine.server();
            let session = engine.session_mut()?;
            (server, session.peer_id(), session.close_stream(handle.stream_id))
        };

        if removed {
            tracing::debug!(stream = %handle, "stream closed");
            let close = Frame::CloseStream {
                peer_id,
                stream_id: handle.stream_id,
            };
            send_frame(worker.transport().as_ref(), server, &close).await?;
        }
        Ok(())
    }

    /// Sends `payload` on a stream, fragmenting it as needed.
    ///
    /// On a reliable stream the payload is resent every retransmit
    /// interval until the server acknowledges it, or until a newer payload
    /// on the same stream replaces it.
    ///
    /// # Errors
    /// [`FalconError::NotConnected`], `UnknownStream` or `PayloadTooLarge`
    /// (as [`FalconError::Session`]), or a transport error.
    pub async fn send_data(
        &self,
        stream_id: StreamId,
        payload: &[u8],
    ) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let (server, frames) = {
            let mut engine = worker.engine().lock().await;
            let server = engine.server();
            let max_datagram_size = engine.max_datagram_size();
            let frames = engine
                .session_mut()?
                .send(stream_id, payload, max_datagram_size)?;
            (server, frames)
        };
        send_all(worker.transport().as_ref(), server, &frames).await
    }

    /// Ids of the open streams, including ones mirrored from the server.
    /// Empty while not connected.
    pub async fn streams(&self) -> Vec<StreamId> {
        let Ok(worker) = self.worker() else {
            return Vec::new();
        };
        let engine = worker.engine().lock().await;
        engine.session().map(Session::stream_ids).unwrap_or_default()
    }

    /// `true` while a reliable payload on `stream_id` waits for its ack.
    pub async fn has_pending_ack(&self, stream_id: StreamId) -> bool {
        let Ok(worker) = self.worker() else {
            return false;
        };
        let engine = worker.engine().lock().await;
        engine
            .session()
            .is_some_and(|session| session.has_pending_ack(stream_id))
    }

    /// Sets flag `index` (0..16) of a stream; other indices are ignored.
    pub async fn set_stream_flag(
        &self,
        stream_id: StreamId,
        index: usize,
        value: bool,
    ) -> Result<(), FalconError> {
        let worker = self.worker()?;
        let mut engine = worker.engine().lock().await;
        engine
            .session_mut()?
            .set_stream_flag(stream_id, index, value)?;
        Ok(())
    }

    /// Reads flag `index` of a stream; other indices read `false`.
    pub async fn get_stream_flag(
        &self,
        stream_id: StreamId,
        index: usize,
    ) -> Result<bool, FalconError> {
        let worker = self.worker()?;
        let engine = worker.engine().lock().await;
        let session = engine.session().ok_or(FalconError::NotConnected)?;
        Ok(session.get_stream_flag(stream_id, index)?)
    }

    fn worker(&self) -> Result<&Worker<ClientEngine, T>, FalconError> {
        self.worker.as_ref().ok_or(FalconError::NotConnected)
    }

    // -- Callbacks ----------------------------------------------------------

    /// Called once per [`connect`](FalconClient::connect) with the assigned
    /// peer id, or `None` if the connect timeout passed.
    pub fn on_connection_event<F>(&mut self, callback: F)
    where
        F: Fn(Option<PeerId>) + Send + Sync + 'static,
    {
        self.callbacks.on_connection_event = Some(Arc::new(callback));
    }

    /// Called when an established connection ends because the server
    /// disconnected, went silent, or became unreachable.
    pub fn on_disconnect<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_disconnect = Some(Arc::new(callback));
    }

    /// Called with every reassembled payload.
    pub fn on_data_received<F>(&mut self, callback: F)
    where
        F: Fn(StreamId, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.on_data_received =
            Some(Arc::new(move |_peer_id: PeerId, stream_id: StreamId, data: &[u8]| {
                callback(stream_id, data)
            }));
    }
}

impl<T: Transport> std::fmt::Debug for FalconClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalconClient")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Tests
// =========================================================================
