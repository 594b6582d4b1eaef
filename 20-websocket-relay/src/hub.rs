//! Relay hub shared by every session of a process.
//!
//! Routers publish onto one bounded queue; a single dispatcher task drains it
//! in order and copies each message into the outbound mailbox of every
//! member, so all receivers observe the same order. The sender is skipped
//! unless [`HubConfig::echo_to_sender`] is set.
//!
//! A full shared queue makes the publishing router wait, which only slows
//! the session that is sending. A full outbound mailbox never blocks the
//! dispatcher: the copy for that member is dropped and counted, and under
//! [`OverflowPolicy::Disconnect`] a member that keeps overflowing is closed.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use futures::executor;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    message::ChatMessage,
    session::{CloseReason, Delivery, Session, SessionId},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_MAX_DROPS: u64 = 100;

static GLOBAL: OnceLock<Arc<Hub>> = OnceLock::new();

/// What to do with a member whose outbound mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the copy for that member and keep it connected.
    Drop,
    /// Drop the copy, and close the member once its lifetime drop count
    /// reaches `after_drops`.
    Disconnect { after_drops: u64 },
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub echo_to_sender: bool,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            echo_to_sender: false,
            overflow: OverflowPolicy::Disconnect {
                after_drops: DEFAULT_MAX_DROPS,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("relay hub is already initialized")]
    AlreadyInitialized,
    #[error("failed to start relay dispatcher: {0}")]
    Dispatcher(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Messages accepted onto the shared queue.
    pub published: u64,
    /// Copies placed into member mailboxes.
    pub delivered: u64,
    /// Copies lost to full member mailboxes.
    pub dropped: u64,
    /// Members closed for overflowing.
    pub disconnected: u64,
}

struct Envelope {
    origin: SessionId,
    message: ChatMessage,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

struct Shared {
    members: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: HubConfig,
    counters: Counters,
    shutdown: CancellationToken,
}

pub struct Hub {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Envelope>,
}

impl Hub {
    /// Builds a hub and spawns its dispatcher on the current tokio runtime.
    ///
    /// The dispatcher lives only as long as that runtime; a hub whose
    /// dispatcher is gone closes members with [`CloseReason::HubShutdown`].
    /// Panics outside a tokio runtime, like [`tokio::spawn`].
    pub fn start(config: HubConfig) -> Arc<Self> {
        let (hub, rx) = Self::build(config);
        tokio::spawn(dispatch_loop(Arc::clone(&hub.shared), rx));
        hub
    }

    /// Builds a hub whose dispatcher runs on its own thread, independent of
    /// any tokio runtime. It stops once the hub is shut down or dropped.
    pub fn start_detached(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let (hub, rx) = Self::build(config);
        let shared = Arc::clone(&hub.shared);
        thread::Builder::new()
            .name("relay-hub".to_string())
            .spawn(move || executor::block_on(dispatch_loop(shared, rx)))
            .map_err(HubError::Dispatcher)?;
        Ok(hub)
    }

    fn build(config: HubConfig) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            members: RwLock::new(HashMap::new()),
            config,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });
        (Arc::new(Self { shared, queue }), rx)
    }

    /// Process-wide hub, created with default settings on first access.
    ///
    /// Its dispatcher runs on a dedicated thread, so the hub outlives the
    /// runtime that first asked for it and may be requested from anywhere.
    pub fn global() -> Result<Arc<Self>, HubError> {
        if let Some(hub) = GLOBAL.get() {
            return Ok(Arc::clone(hub));
        }
        let hub = Self::start_detached(HubConfig::default())?;
        // A racing initializer may have won; its hub is the global one and
        // ours stops when dropped.
        Ok(Arc::clone(GLOBAL.get_or_init(|| hub)))
    }

    /// Creates the process-wide hub with `config`.
    ///
    /// Fails if [`Hub::global`] or this function already ran.
    pub fn init_global(config: HubConfig) -> Result<Arc<Self>, HubError> {
        if GLOBAL.get().is_some() {
            return Err(HubError::AlreadyInitialized);
        }
        let hub = Self::start_detached(config)?;
        GLOBAL
            .set(Arc::clone(&hub))
            .map_err(|_| HubError::AlreadyInitialized)?;
        Ok(hub)
    }

    /// `false` once the hub was shut down or its dispatcher stopped.
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_cancelled() && !self.queue.is_closed()
    }

    /// Makes `session` a fan-out target until the returned guard drops.
    pub fn join(&self, session: &Arc<Session>) -> Membership {
        let id = session.id();
        if self.is_running() {
            let members = {
                let mut members = self.shared.members.write();
                members.insert(id, Arc::clone(session));
                members.len()
            };
            debug!(session = %id, members, "session joined relay");
        }

        // Re-checked after inserting so a concurrent shutdown cannot miss us.
        if !self.is_running() {
            self.shared.members.write().remove(&id);
            session.close(CloseReason::HubShutdown);
        }

        Membership {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Queues `message` for fan-out, waiting for room if the queue is full.
    ///
    /// Returns `false` if `cancel` fired first or the hub has stopped.
    pub async fn publish(
        &self,
        origin: SessionId,
        message: ChatMessage,
        cancel: &CancellationToken,
    ) -> bool {
        if self.shared.shutdown.is_cancelled() {
            debug!(session = %origin, "relay hub stopped, message discarded");
            return false;
        }
        let envelope = match self.queue.try_send(Envelope { origin, message }) {
            Ok(()) => {
                self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %origin, "relay hub stopped, message discarded");
                return false;
            }
            Err(TrySendError::Full(envelope)) => {
                warn!(session = %origin, "relay queue is full, waiting for space");
                envelope
            }
        };

        select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.queue.send(envelope) => match sent {
                Ok(()) => {
                    debug!(session = %origin, "queued message after relay queue was full");
                    self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => false,
            },
        }
    }

    pub fn member_count(&self) -> usize {
        self.shared.members.read().len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.shared.members.read().contains_key(&id)
    }

    pub fn stats(&self) -> HubStats {
        let counters = &self.shared.counters;
        HubStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            disconnected: counters.disconnected.load(Ordering::Relaxed),
        }
    }

    /// Stops the dispatcher and closes every member.
    pub fn shutdown(&self) {
        self.shared.stop();
    }
}

/// Registration of one session with a [`Hub`]; leaving is implicit on drop.
pub struct Membership {
    shared: Arc<Shared>,
    id: SessionId,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.shared.members.write().remove(&self.id).is_some() {
            debug!(session = %self.id, "session left relay");
        }
    }
}

/// Stops the hub when the dispatcher exits, including when its task is
/// dropped along with the runtime it was spawned on.
struct DispatcherGuard(Arc<Shared>);

impl Drop for DispatcherGuard {
    fn drop(&mut self) {
        debug!("relay dispatcher stopped");
        self.0.stop();
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut queue: mpsc::Receiver<Envelope>) {
    debug!("relay dispatcher started");
    let _guard = DispatcherGuard(Arc::clone(&shared));

    loop {
        let envelope = select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            envelope = queue.recv() => envelope,
        };
        let Some(envelope) = envelope else {
            break;
        };
        shared.fan_out(envelope);
    }
}

impl Shared {
    fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let members: Vec<Arc<Session>> = self.members.read().values().cloned().collect();
        info!(members = members.len(), "relay hub shutting down");
        for session in members {
            session.close(CloseReason::HubShutdown);
        }
    }

    fn fan_out(&self, envelope: Envelope) {
        let Envelope { origin, message } = envelope;
        let payload: Arc<str> = Arc::from(message.encode());
        let recipients: Vec<Arc<Session>> = self
            .members
            .read()
            .values()
            .filter(|session| self.config.echo_to_sender || session.id() != origin)
            .cloned()
            .collect();

        let mut slow = Vec::new();
        for session in &recipients {
            match session.deliver(Arc::clone(&payload)) {
                Delivery::Queued => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Closed => {}
                Delivery::Dropped { total } => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    match self.config.overflow {
                        OverflowPolicy::Disconnect { after_drops } if total >= after_drops => {
                            warn!(
                                session = %session.id(),
                                total_drops = total,
                                "disconnecting slow consumer"
                            );
                            slow.push(Arc::clone(session));
                        }
                        _ => {
                            warn!(
                                session = %session.id(),
                                total_drops = total,
                                "outbound mailbox full, message dropped"
                            );
                        }
                    }
                }
            }
        }

        if !slow.is_empty() {
            {
                let mut members = self.members.write();
                for session in &slow {
                    members.remove(&session.id());
                }
            }
            for session in slow {
                if !session.is_closed() {
                    self.counters.disconnected.fetch_add(1, Ordering::Relaxed);
                }
                session.close(CloseReason::SlowConsumer);
            }
        }

        debug!(session = %origin, recipients = recipients.len(), "message relayed");
    }
}
