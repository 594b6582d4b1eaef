//! One connected chat participant.
//!
//! A [`Session`] owns a [`Transport`] and pumps it with three tasks:
//!
//! - the **reader** decodes incoming frames into the inbound mailbox,
//! - the **router** moves inbound messages to their [`Route`] (the relay
//!   [`Hub`] on the server, a local channel on the client),
//! - the **writer** drains the outbound mailbox onto the transport.
//!
//! Every suspension point also waits on the session's cancellation token, so
//! [`Session::close`] stops all three loops without them waiting on each
//! other. Close runs exactly once; later calls are no-ops.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    console::Console,
    hub::{Hub, Membership},
    message::ChatMessage,
    transport::{Frame, FrameSink, FrameStream, Transport},
};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of both the inbound and the outbound mailbox.
    pub mailbox_capacity: usize,
    /// Where every decoded inbound message is echoed, if anywhere.
    pub console: Option<Console>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            console: None,
        }
    }
}

/// Why a session closed. Delivered to every [`CloseObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a close frame or hung up.
    RemoteClosed,
    ReadFailed,
    WriteFailed,
    /// The outbound mailbox was drained after [`Session::finish`].
    Finished,
    Requested,
    /// The outbound mailbox overflowed too often.
    SlowConsumer,
    /// The relay hub was shut down or its dispatcher stopped.
    HubShutdown,
    /// The router stopped taking inbound messages.
    RouteStopped,
    /// The session was dropped without ever closing.
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::RemoteClosed => "remote closed",
            CloseReason::ReadFailed => "read failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::Finished => "finished",
            CloseReason::Requested => "close requested",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::HubShutdown => "hub shut down",
            CloseReason::RouteStopped => "route stopped",
            CloseReason::Dropped => "dropped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    Closed(CloseReason),
}

/// Outcome of handing a payload to a session's outbound mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The mailbox was full; `total` is the session's lifetime drop count.
    Dropped { total: u64 },
    /// The session is closed or no longer accepts output.
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} was already started or closed")]
    AlreadyStarted(SessionId),
}

/// Where a session's router sends the messages its reader decodes.
pub enum Route {
    /// Publish to the relay hub for fan-out to every other member.
    Hub(Arc<Hub>),
    /// Hand to a local consumer, e.g. a terminal client.
    Local(mpsc::Sender<ChatMessage>),
}

/// Resolves once, when the observed session closes.
pub struct CloseObserver {
    rx: oneshot::Receiver<CloseReason>,
}

impl CloseObserver {
    pub async fn wait(self) -> CloseReason {
        self.rx.await.unwrap_or(CloseReason::Dropped)
    }
}

struct SessionState {
    lifecycle: Lifecycle,
    // Taken on close or finish; the writer sees the mailbox end once it is gone.
    outbound: Option<mpsc::Sender<Arc<str>>>,
    observers: Vec<oneshot::Sender<CloseReason>>,
    // Present until `start` hands the pieces to the loops.
    pending: Option<PendingLoops>,
}

struct PendingLoops {
    transport: Transport,
    inbound_tx: mpsc::Sender<ChatMessage>,
    inbound_rx: mpsc::Receiver<ChatMessage>,
    outbound_rx: mpsc::Receiver<Arc<str>>,
}

pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    config: SessionConfig,
    cancel: CancellationToken,
    dropped: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(transport: Transport, config: SessionConfig) -> Arc<Self> {
        let capacity = config.mailbox_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let id = SessionId::new();
        let peer = transport.peer();
        debug!(session = %id, ?peer, "session created");

        Arc::new(Self {
            id,
            peer,
            config,
            cancel: CancellationToken::new(),
            dropped: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Open,
                outbound: Some(outbound_tx),
                observers: Vec::new(),
                pending: Some(PendingLoops {
                    transport,
                    inbound_tx,
                    inbound_rx,
                    outbound_rx,
                }),
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Closed(_))
    }

    /// Total payloads dropped because the outbound mailbox was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Spawns the reader, writer and router tasks.
    ///
    /// With [`Route::Hub`] the session is a fan-out target as soon as this
    /// returns.
    pub fn start(self: &Arc<Self>, route: Route) -> Result<SessionTasks, SessionError> {
        let pending = self
            .state
            .lock()
            .pending
            .take()
            .ok_or(SessionError::AlreadyStarted(self.id))?;
        let (sink, stream) = pending.transport.into_parts();

        let target = match route {
            Route::Hub(hub) => {
                let membership = hub.join(self);
                RouteTarget::Hub {
                    hub,
                    _membership: membership,
                }
            }
            Route::Local(tx) => RouteTarget::Local(tx),
        };

        Ok(SessionTasks {
            reader: tokio::spawn(read_loop(Arc::clone(self), stream, pending.inbound_tx)),
            writer: tokio::spawn(write_loop(Arc::clone(self), sink, pending.outbound_rx)),
            router: tokio::spawn(route_loop(Arc::clone(self), pending.inbound_rx, target)),
        })
    }

    /// Serializes `message` onto the outbound mailbox.
    pub fn send(&self, message: &ChatMessage) -> Delivery {
        let delivery = self.deliver(Arc::from(message.encode()));
        if let Delivery::Dropped { total } = delivery {
            warn!(session = %self.id, total, "outbound mailbox full, message dropped");
        }
        delivery
    }

    /// Queues an already serialized payload without waiting.
    ///
    /// A closed session accepts nothing and reports [`Delivery::Closed`].
    pub fn deliver(&self, payload: Arc<str>) -> Delivery {
        let state = self.state.lock();
        let Some(outbound) = state.outbound.as_ref() else {
            return Delivery::Closed;
        };
        match outbound.try_send(payload) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                Delivery::Dropped { total }
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Registers for a single close notification.
    ///
    /// Registering after the session closed resolves immediately.
    pub fn on_close(&self) -> CloseObserver {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Closed(reason) => {
                let _ = tx.send(reason);
            }
            Lifecycle::Open => {
                state.observers.retain(|observer| !observer.is_closed());
                state.observers.push(tx);
            }
        }
        CloseObserver { rx }
    }

    /// Closes the session. Returns `false` if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        if let Lifecycle::Closed(_) = state.lifecycle {
            return false;
        }

        state.lifecycle = Lifecycle::Closed(reason);
        self.cancel.cancel();
        state.outbound = None;
        // An unstarted session still owns its transport.
        state.pending = None;
        for observer in state.observers.drain(..) {
            let _ = observer.send(reason);
        }
        drop(state);

        info!(session = %self.id, peer = ?self.peer, %reason, "session closed");
        true
    }

    /// Stops accepting output; the writer flushes what is queued, sends a
    /// close frame and then closes the session.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.outbound.take().is_some() {
            debug!(session = %self.id, "session finishing");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for observer in state.observers.drain(..) {
            let _ = observer.send(CloseReason::Dropped);
        }
    }
}

/// Join handles for a started session's loops.
pub struct SessionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    router: JoinHandle<()>,
}

impl SessionTasks {
    pub async fn join(self) {
        let tasks = [
            ("reader", self.reader),
            ("writer", self.writer),
            ("router", self.router),
        ];
        for (name, handle) in tasks {
            if let Err(err) = handle.await {
                warn!(task = name, error = ?err, "session task failed");
            }
        }
    }
}

enum RouteTarget {
    Hub {
        hub: Arc<Hub>,
        _membership: Membership,
    },
    Local(mpsc::Sender<ChatMessage>),
}

async fn read_loop(
    session: Arc<Session>,
    mut stream: FrameStream,
    inbound: mpsc::Sender<ChatMessage>,
) {
    debug!(session = %session.id, "read loop started");

    loop {
        let frame = select! {
            biased;
            _ = session.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Text(text))) => {
                let message = match ChatMessage::decode(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(session = %session.id, error = %err, "dropping undecodable message");
                        continue;
                    }
                };
                if let Some(console) = &session.config.console {
                    let rendered = message.render();
                    select! {
                        biased;
                        _ = session.cancel.cancelled() => break,
                        written = console.write_line(&rendered) => if let Err(err) = written {
                            debug!(session = %session.id, error = %err, "console echo failed");
                        },
                    }
                }
                select! {
                    biased;
                    _ = session.cancel.cancelled() => break,
                    sent = inbound.send(message) => if sent.is_err() {
                        session.close(CloseReason::RouteStopped);
                        break;
                    },
                }
            }
            Some(Ok(Frame::Close)) => {
                debug!(session = %session.id, "received close frame");
                session.close(CloseReason::RemoteClosed);
                break;
            }
            Some(Err(err)) => {
                warn!(session = %session.id, error = %err, "read failed");
                session.close(CloseReason::ReadFailed);
                break;
            }
            None => {
                session.close(CloseReason::RemoteClosed);
                break;
            }
        }
    }

    debug!(session = %session.id, "read loop stopped");
}

async fn write_loop(
    session: Arc<Session>,
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Arc<str>>,
) {
    debug!(session = %session.id, "write loop started");

    loop {
        let payload = select! {
            biased;
            _ = session.cancel.cancelled() => break,
            payload = outbound.recv() => payload,
        };

        let Some(payload) = payload else {
            // Mailbox ended without a close: `finish` was called.
            select! {
                biased;
                _ = session.cancel.cancelled() => {}
                sent = sink.send(Frame::Close) => if let Err(err) = sent {
                    debug!(session = %session.id, error = %err, "failed to send close frame");
                },
            }
            session.close(CloseReason::Finished);
            break;
        };

        let written = select! {
            biased;
            _ = session.cancel.cancelled() => break,
            written = sink.send(Frame::Text(payload.to_string())) => written,
        };
        if let Err(err) = written {
            warn!(session = %session.id, error = %err, "write failed");
            session.close(CloseReason::WriteFailed);
            break;
        }
    }

    debug!(session = %session.id, "write loop stopped");
}

async fn route_loop(
    session: Arc<Session>,
    mut inbound: mpsc::Receiver<ChatMessage>,
    target: RouteTarget,
) {
    debug!(session = %session.id, "route loop started");

    loop {
        let message = select! {
            biased;
            _ = session.cancel.cancelled() => break,
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        match &target {
            RouteTarget::Hub { hub, .. } => {
                if !hub.publish(session.id, message, &session.cancel).await {
                    // No-op when the session itself was closed.
                    session.close(CloseReason::HubShutdown);
                    break;
                }
            }
            RouteTarget::Local(tx) => {
                select! {
                    biased;
                    _ = session.cancel.cancelled() => break,
                    sent = tx.send(message) => if sent.is_err() {
                        debug!(session = %session.id, "local consumer gone, discarding message");
                    },
                }
            }
        }
    }

    debug!(session = %session.id, "route loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;
    use crate::{
        hub::HubConfig,
        transport::{MemoryPeer, TransportError},
    };

    const WAIT: Duration = Duration::from_secs(2);

    fn local_session(
        config: SessionConfig,
    ) -> (Arc<Session>, MemoryPeer, mpsc::Receiver<ChatMessage>, SessionTasks) {
        let (transport, peer) = Transport::in_memory();
        let session = Session::new(transport, config);
        let (tx, rx) = mpsc::channel(16);
        let tasks = session.start(Route::Local(tx)).expect("start");
        (session, peer, rx, tasks)
    }

    #[tokio::test]
    async fn concurrent_close_notifies_each_observer_once() {
        let (transport, _peer) = Transport::in_memory();
        let session = Session::new(transport, SessionConfig::default());
        let first = session.on_close();
        let second = session.on_close();

        let a = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.close(CloseReason::ReadFailed) }
        });
        let b = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.close(CloseReason::WriteFailed) }
        });
        let closed = [a.await.expect("task a"), b.await.expect("task b")];

        assert_eq!(closed.iter().filter(|won| **won).count(), 1);
        let reason = first.wait().await;
        assert_eq!(second.wait().await, reason);
        assert_eq!(session.lifecycle(), Lifecycle::Closed(reason));
        assert!(!session.close(CloseReason::Requested));
    }

    #[tokio::test]
    async fn late_observer_resolves_immediately() {
        let (transport, _peer) = Transport::in_memory();
        let session = Session::new(transport, SessionConfig::default());
        session.close(CloseReason::Requested);

        let reason = timeout(WAIT, session.on_close().wait()).await.expect("immediate");
        assert_eq!(reason, CloseReason::Requested);
    }

    #[tokio::test]
    async fn abandoned_observers_are_pruned() {
        let (transport, _peer) = Transport::in_memory();
        let session = Session::new(transport, SessionConfig::default());
        for _ in 0..10 {
            drop(session.on_close());
        }
        let _kept = session.on_close();

        assert_eq!(session.state.lock().observers.len(), 1);
    }

    #[tokio::test]
    async fn sends_after_close_are_ignored() {
        let (transport, _peer) = Transport::in_memory();
        let session = Session::new(transport, SessionConfig::default());
        session.close(CloseReason::Requested);

        let message = ChatMessage::new("c", "alice", "127.0.0.1", "late");
        assert_eq!(session.send(&message), Delivery::Closed);
    }

    #[tokio::test]
    async fn full_mailbox_drops_and_counts() {
        let (transport, _peer) = Transport::in_memory();
        let session = Session::new(
            transport,
            SessionConfig {
                mailbox_capacity: 1,
                ..SessionConfig::default()
            },
        );

        assert_eq!(session.deliver(Arc::from("one")), Delivery::Queued);
        assert_eq!(session.deliver(Arc::from("two")), Delivery::Dropped { total: 1 });
        assert_eq!(session.deliver(Arc::from("three")), Delivery::Dropped { total: 2 });
        assert_eq!(session.dropped_count(), 2);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let (session, _peer, _rx, _tasks) = local_session(SessionConfig::default());
        let (tx, _rx2) = mpsc::channel(1);

        assert!(matches!(
            session.start(Route::Local(tx)),
            Err(SessionError::AlreadyStarted(id)) if id == session.id()
        ));
    }

    #[tokio::test]
    async fn read_error_closes_and_stops_writes() {
        let (session, mut peer, _rx, tasks) = local_session(SessionConfig::default());
        let observer = session.on_close();

        peer.fail(TransportError::Io(std::io::Error::other("reset")));
        let reason = timeout(WAIT, observer.wait()).await.expect("closed");
        assert_eq!(reason, CloseReason::ReadFailed);
        timeout(WAIT, tasks.join()).await.expect("loops exit");

        let message = ChatMessage::new("c", "alice", "127.0.0.1", "after");
        assert_eq!(session.send(&message), Delivery::Closed);
        assert_eq!(peer.try_next_frame(), None);
    }

    #[tokio::test]
    async fn malformed_frame_keeps_session_open() {
        let (session, peer, mut rx, _tasks) = local_session(SessionConfig::default());

        peer.send_text("{not json");
        let good = ChatMessage::new("c-1", "alice", "10.0.0.1", "still here");
        peer.send_message(&good);

        let received = timeout(WAIT, rx.recv()).await.expect("routed").expect("message");
        assert_eq!(received, good);
        assert_eq!(session.lifecycle(), Lifecycle::Open);
    }

    #[tokio::test]
    async fn close_frame_from_peer_closes_session() {
        let (session, peer, _rx, tasks) = local_session(SessionConfig::default());
        let observer = session.on_close();

        peer.send_close();
        assert_eq!(timeout(WAIT, observer.wait()).await.expect("closed"), CloseReason::RemoteClosed);
        timeout(WAIT, tasks.join()).await.expect("loops exit");
    }

    #[tokio::test]
    async fn write_failure_closes_session() {
        let (session, mut peer, _rx, _tasks) = local_session(SessionConfig::default());
        let observer = session.on_close();

        peer.refuse_writes();
        session.send(&ChatMessage::new("c", "alice", "127.0.0.1", "lost"));
        assert_eq!(timeout(WAIT, observer.wait()).await.expect("closed"), CloseReason::WriteFailed);
    }

    #[tokio::test]
    async fn finish_flushes_queue_then_sends_close_frame() {
        let (session, mut peer, _rx, tasks) = local_session(SessionConfig::default());
        let first = ChatMessage::new("c", "alice", "127.0.0.1", "one");
        let second = ChatMessage::new("c", "alice", "127.0.0.1", "two");
        session.send(&first);
        session.send(&second);
        session.finish();

        assert_eq!(peer.next_frame().await, Some(Frame::Text(first.encode())));
        assert_eq!(peer.next_frame().await, Some(Frame::Text(second.encode())));
        assert_eq!(peer.next_frame().await, Some(Frame::Close));
        timeout(WAIT, tasks.join()).await.expect("loops exit");
        assert_eq!(session.lifecycle(), Lifecycle::Closed(CloseReason::Finished));
    }

    #[tokio::test]
    async fn console_echo_writes_each_decoded_message() {
        let (writer, reader) = tokio::io::duplex(1024);
        let config = SessionConfig {
            console: Some(Console::from_writer(writer)),
            ..SessionConfig::default()
        };
        let (_session, peer, mut rx, _tasks) = local_session(config);

        peer.send_text("{not json");
        peer.send_message(&ChatMessage::new("c-1", "alice", "10.0.0.1", "hello"));
        peer.send_message(&ChatMessage::new("c-2", "bob", "10.0.0.2", "hey"));

        let mut lines = BufReader::new(reader).lines();
        for expected in ["[alice-10.0.0.1]:hello", "[bob-10.0.0.2]:hey"] {
            let line = timeout(WAIT, lines.next_line())
                .await
                .expect("echoed")
                .expect("read");
            assert_eq!(line.as_deref(), Some(expected));
        }
        assert_eq!(timeout(WAIT, rx.recv()).await.expect("routed").map(|m| m.data), Some("hello".into()));
    }

    #[tokio::test]
    async fn router_closes_session_when_hub_refuses_message() {
        let hub = Hub::start(HubConfig::default());
        hub.shutdown();
        let (transport, _peer) = Transport::in_memory();
        let bystander = Session::new(transport, SessionConfig::default());
        let target = RouteTarget::Hub {
            _membership: hub.join(&bystander),
            hub,
        };

        let (transport, _peer) = Transport::in_memory();
        let session = Session::new(transport, SessionConfig::default());
        let observer = session.on_close();
        let (tx, rx) = mpsc::channel(1);
        tx.send(ChatMessage::new("c", "alice", "127.0.0.1", "hi"))
            .await
            .expect("queued");

        timeout(WAIT, route_loop(Arc::clone(&session), rx, target))
            .await
            .expect("router exits");
        assert_eq!(timeout(WAIT, observer.wait()).await.expect("closed"), CloseReason::HubShutdown);
    }

    #[tokio::test]
    async fn reader_closes_session_when_router_is_gone() {
        let (transport, _unused) = Transport::in_memory();
        let session = Session::new(transport, SessionConfig::default());
        let (wire, peer) = Transport::in_memory();
        let (_sink, stream) = wire.into_parts();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        peer.send_message(&ChatMessage::new("c", "alice", "127.0.0.1", "hi"));
        timeout(WAIT, read_loop(Arc::clone(&session), stream, tx))
            .await
            .expect("reader exits");
        assert_eq!(session.lifecycle(), Lifecycle::Closed(CloseReason::RouteStopped));
    }
}
