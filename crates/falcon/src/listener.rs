//! The background listener loop shared by both engine roles.
//!
//! Each running client or server owns exactly one loop task. One iteration:
//!
//! 1. Wait up to `receive_timeout` for a datagram.
//! 2. Lock the engine, decode and handle the datagram (if any), run the
//!    engine's timers, unlock.
//! 3. Send the frames the engine queued.
//! 4. Fire callbacks for the events the engine queued.
//!
//! The engine lock is never held across network I/O or a callback, so the
//! public API can take it between iterations, including from a task a
//! callback handed work to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use falcon_protocol::{Frame, PeerId, StreamId};
use falcon_transport::Transport;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::FalconError;

// ---------------------------------------------------------------------------
// Engine capability
// ---------------------------------------------------------------------------

/// Role-specific connection logic driven by the listener loop.
///
/// Implemented by the client and server engines. Implementations do no
/// I/O: they read frames and the current time, and write what should
/// happen next into an [`Outbox`].
pub(crate) trait ConnectionEngine: Send + 'static {
    /// Handles one decoded frame received from `from`.
    fn handle_frame(
        &mut self,
        frame: Frame,
        from: SocketAddr,
        now: Instant,
        out: &mut Outbox,
    );

    /// Runs timers: connect and liveness timeouts, pings, retransmission.
    /// Called once per loop iteration whether or not a frame arrived.
    fn tick(&mut self, now: Instant, out: &mut Outbox);

    /// Tears down whatever session `peer_id` belongs to after a send to it
    /// failed.
    fn handle_send_failure(
        &mut self,
        peer_id: Option<PeerId>,
        events: &mut Vec<Event>,
    );

    /// `true` once the loop has nothing left to do.
    fn is_finished(&self) -> bool;
}

/// A frame the engine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Outgoing {
    pub(crate) to: SocketAddr,
    /// Session to tear down if the send fails.
    pub(crate) peer_id: Option<PeerId>,
    pub(crate) frame: Frame,
}

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    /// Client handshake finished: `Some(id)` on success, `None` on timeout.
    ConnectResult(Option<PeerId>),
    /// Client lost its connection.
    Disconnected,
    ClientConnected(PeerId),
    ClientDisconnected(PeerId),
    /// A payload finished reassembly.
    Data {
        peer_id: PeerId,
        stream_id: StreamId,
        payload: Vec<u8>,
    },
}

/// Frames and events produced by one engine call.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub(crate) frames: Vec<Outgoing>,
    pub(crate) events: Vec<Event>,
}

impl Outbox {
    pub(crate) fn send(
        &mut self,
        to: SocketAddr,
        peer_id: Option<PeerId>,
        frame: Frame,
    ) {
        self.frames.push(Outgoing { to, peer_id, frame });
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

pub(crate) type ConnectionCallback = Arc<dyn Fn(Option<PeerId>) + Send + Sync>;
pub(crate) type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type PeerCallback = Arc<dyn Fn(PeerId) + Send + Sync>;
pub(crate) type DataCallback = Arc<dyn Fn(PeerId, StreamId, &[u8]) + Send + Sync>;

/// The application callbacks registered on an engine.
///
/// Copied into the loop task when it starts. Callbacks run on that task,
/// one at a time; a slow callback delays the next receive.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) on_connection_event: Option<ConnectionCallback>,
    pub(crate) on_disconnect: Option<DisconnectCallback>,
    pub(crate) on_client_connected: Option<PeerCallback>,
    pub(crate) on_client_disconnected: Option<PeerCallback>,
    pub(crate) on_data_received: Option<DataCallback>,
}

impl Callbacks {
    pub(crate) fn dispatch(&self, event: Event) {
        match event {
            Event::ConnectResult(result) => {
                if let Some(callback) = &self.on_connection_event {
                    callback(result);
                }
            }
            Event::Disconnected => {
                if let Some(callback) = &self.on_disconnect {
                    callback();
                }
            }
            Event::ClientConnected(peer_id) => {
                if let Some(callback) = &self.on_client_connected {
                    callback(peer_id);
                }
            }
            Event::ClientDisconnected(peer_id) => {
                if let Some(callback) = &self.on_client_disconnected {
                    callback(peer_id);
                }
            }
            Event::Data {
                peer_id,
                stream_id,
                payload,
            } => {
                if let Some(callback) = &self.on_data_received {
                    callback(peer_id, stream_id, &payload);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A running listener loop and the state it shares with the public API.
///
/// Dropping a worker raises the stop flag; the task exits within one
/// receive timeout. [`stop`](Self::stop) also waits for it.
pub(crate) struct Worker<E, T> {
    engine: Arc<Mutex<E>>,
    transport: Arc<T>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl<E: ConnectionEngine, T: Transport> Worker<E, T> {
    /// Starts the loop task on the current Tokio runtime.
    pub(crate) fn spawn(
        engine: E,
        transport: Arc<T>,
        callbacks: Callbacks,
        receive_timeout: Duration,
    ) -> Self {
        let engine = Arc::new(Mutex::new(engine));
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run(
            Arc::clone(&engine),
            Arc::clone(&transport),
            Arc::clone(&running),
            callbacks,
            receive_timeout,
        ));
        Self {
            engine,
            transport,
            running,
            task: Some(task),
        }
    }

    pub(crate) fn engine(&self) -> &Mutex<E> {
        &self.engine
    }

    pub(crate) fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// `true` once the loop task has exited on its own.
    pub(crate) fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Raises the stop flag and waits for the loop task to exit. Returns
    /// the engine, which nothing else touches from then on.
    pub(crate) async fn stop(mut self) -> Arc<Mutex<E>> {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "listener loop ended abnormally");
            }
        }
        Arc::clone(&self.engine)
    }
}

impl<E, T> Drop for Worker<E, T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

async fn run<E: ConnectionEngine, T: Transport>(
    engine: Arc<Mutex<E>>,
    transport: Arc<T>,
    running: Arc<AtomicBool>,
    callbacks: Callbacks,
    receive_timeout: Duration,
) {
    tracing::debug!("listener loop started");

    while running.load(Ordering::Acquire) {
        let received = match transport.recv_from(receive_timeout).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "receive failed");
                // Keep timers running without spinning on a failing socket.
                tokio::time::sleep(receive_timeout).await;
                None
            }
        };

        let now = Instant::now();
        let mut out = Outbox::default();
        let finished = {
            let mut engine = engine.lock().await;
            if let Some((bytes, from)) = received {
                match Frame::decode(&bytes) {
                    Ok(frame) => engine.handle_frame(frame, from, now, &mut out),
                    Err(e) => {
                        tracing::debug!(%from, error = %e, "dropping malformed frame");
                    }
                }
            }
            engine.tick(now, &mut out);
            engine.is_finished()
        };

        flush(&engine, transport.as_ref(), out, &callbacks).await;

        if finished {
            break;
        }
    }

    tracing::debug!("listener loop stopped");
}

/// Sends the queued frames, lets the engine react to failed sends, then
/// fires the queued callbacks.
async fn flush<E: ConnectionEngine, T: Transport>(
    engine: &Mutex<E>,
    transport: &T,
    out: Outbox,
    callbacks: &Callbacks,
) {
    let Outbox { frames, mut events } = out;

    let mut failed: Vec<Option<PeerId>> = Vec::new();
    for outgoing in frames {
        if let Err(e) = send_frame(transport, outgoing.to, &outgoing.frame).await {
            tracing::warn!(
                to = %outgoing.to,
                kind = %outgoing.frame.kind(),
                error = %e,
                "send failed"
            );
            if !failed.contains(&outgoing.peer_id) {
                failed.push(outgoing.peer_id);
            }
        }
    }

    if !failed.is_empty() {
        let mut engine = engine.lock().await;
        for peer_id in failed {
            engine.handle_send_failure(peer_id, &mut events);
        }
    }

    for event in events {
        callbacks.dispatch(event);
    }
}

/// Encodes and sends one frame.
pub(crate) async fn send_frame<T: Transport>(
    transport: &T,
    to: SocketAddr,
    frame: &Frame,
) -> Result<(), FalconError> {
    let bytes = frame.encode()?;
    transport.send_to(to, &bytes).await?;
    Ok(())
}

/// Sends frames in order, stopping at the first failure.
pub(crate) async fn send_all<T: Transport>(
    transport: &T,
    to: SocketAddr,
    frames: &[Frame],
) -> Result<(), FalconError> {
    for frame in frames {
        send_frame(transport, to, frame).await?;
    }
    Ok(())
}

/// Wall-clock milliseconds since the Unix epoch, for PING/PONG timestamps.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn test_dispatch_routes_each_event_to_its_callback() {
        let log = Arc::new(StdMutex::new(Vec::<String>::new()));
        let push = |log: &Arc<StdMutex<Vec<String>>>| {
            let log = Arc::clone(log);
            move |entry: String| log.lock().unwrap().push(entry)
        };

        let connect = push(&log);
        let disconnect = push(&log);
        let joined = push(&log);
        let left = push(&log);
        let data = push(&log);
        let callbacks = Callbacks {
            on_connection_event: Some(Arc::new(move |r: Option<PeerId>| connect(format!("connect {r:?}")))),
            on_disconnect: Some(Arc::new(move || disconnect("disconnect".into()))),
            on_client_connected: Some(Arc::new(move |p: PeerId| joined(format!("joined {p}")))),
            on_client_disconnected: Some(Arc::new(move |p: PeerId| left(format!("left {p}")))),
            on_data_received: Some(Arc::new(move |p: PeerId, s: StreamId, d: &[u8]| {
                data(format!("data {p} {s} {}", String::from_utf8_lossy(d)))
            })),
        };

        callbacks.dispatch(Event::ConnectResult(Some(PeerId(1))));
        callbacks.dispatch(Event::ConnectResult(None));
        callbacks.dispatch(Event::Disconnected);
        callbacks.dispatch(Event::ClientConnected(PeerId(2)));
        callbacks.dispatch(Event::ClientDisconnected(PeerId(2)));
        callbacks.dispatch(Event::Data {
            peer_id: PeerId(2),
            stream_id: StreamId(1),
            payload: b"hi".to_vec(),
        });

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "connect Some(PeerId(1))",
                "connect None",
                "disconnect",
                "joined peer-2",
                "left peer-2",
                "data peer-2 stream-cu1 hi",
            ]
        );
    }

    #[test]
    fn test_dispatch_without_callbacks_is_noop() {
        Callbacks::default().dispatch(Event::Disconnected);
    }

    #[test]
    fn test_unix_millis_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }

    // -- Worker -----------------------------------------------------------

    /// Counts ticks and reports finished after `ticks_left` of them.
    struct CountdownEngine {
        ticks_left: usize,
    }

    impl ConnectionEngine for CountdownEngine {
        fn handle_frame(&mut self, _: Frame, _: SocketAddr, _: Instant, _: &mut Outbox) {}

        fn tick(&mut self, _now: Instant, _out: &mut Outbox) {
            self.ticks_left = self.ticks_left.saturating_sub(1);
        }

        fn handle_send_failure(&mut self, _: Option<PeerId>, _: &mut Vec<Event>) {}

        fn is_finished(&self) -> bool {
            self.ticks_left == 0
        }
    }

    async fn spawn_countdown(ticks: usize) -> Worker<CountdownEngine, falcon_transport::UdpTransport> {
        let transport = falcon_transport::UdpTransport::bind("127.0.0.1:0")
            .await
            .unwrap();
        Worker::spawn(
            CountdownEngine { ticks_left: ticks },
            Arc::new(transport),
            Callbacks::default(),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_worker_is_finished_once_engine_finishes() {
        let worker = spawn_countdown(3).await;

        let mut finished = false;
        for _ in 0..100 {
            if worker.is_finished() {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(finished);
        assert_eq!(worker.engine().lock().await.ticks_left, 0);
    }

    #[tokio::test]
    async fn test_worker_stop_ends_running_loop() {
        let worker = spawn_countdown(usize::MAX).await;
        assert!(!worker.is_finished());

        let engine = worker.stop().await;

        assert!(!engine.lock().await.is_finished());
    }
}
