//! Shared push-channel event bus.
//!
//! [`EventBus`] owns the one and only push connection of a client and fans
//! every decoded [`Envelope`] out to the subscribers whose predicate
//! matches it. It is constructed once at startup and shared as
//! `Arc<EventBus>`; consumers never open connections of their own.
//!
//! Connection lifecycle:
//!
//! - [`EventBus::ensure_connected`] opens a connection unless one is
//!   already connecting or connected.
//! - When the connection closes or errors, a single reconnect is scheduled
//!   after a fixed delay. Further closes replace that timer rather than
//!   adding another one.
//! - Subscribers are untouched by reconnection.
//!
//! There is no backlog: a subscriber only sees envelopes that arrive after
//! it registered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::envelope::{decode_envelope, Envelope};
use crate::reconnect::ReconnectTimer;
use crate::sse::SseFrame;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Link status
// ---------------------------------------------------------------------------

/// Connectivity of the shared push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No connection has been requested yet, or the bus was shut down.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is open and delivering frames.
    Connected,
    /// The connection closed; a reconnect is scheduled.
    Reconnecting,
}

struct Link {
    /// Incremented for every connection attempt; stale tasks compare
    /// against it and back off.
    generation: u64,
    status: LinkStatus,
    /// Attempts since the last successful connection.
    attempts: u32,
    timer: ReconnectTimer,
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

type Predicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;
type Deliver = Box<dyn Fn(Arc<Envelope>) + Send + Sync>;

struct Subscriber {
    id: u64,
    predicate: Predicate,
    deliver: Deliver,
    active: AtomicBool,
}

/// Handle to a registered subscriber.
///
/// Dropping the handle unsubscribes, so a subscription can never outlive
/// the component that owns it. [`dispose`](Self::dispose) does the same
/// explicitly; either way the removal happens exactly once.
pub struct Subscription {
    bus: Weak<EventBus>,
    entry: Arc<Subscriber>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Whether the subscriber is still registered.
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::SeqCst)
    }

    /// Remove the subscriber from the bus.
    ///
    /// Returns `true` if this call performed the removal, `false` if it had
    /// already been disposed. Once this returns, no new delivery to the
    /// callback is started.
    pub fn dispose(&self) -> bool {
        if !self.entry.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.entry.id);
        }
        tracing::debug!(subscriber_id = self.entry.id, "Subscriber disposed");
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Multiplexes one push connection across many filtered subscribers.
pub struct EventBus {
    transport: Arc<dyn Transport>,
    /// Registration order is delivery order.
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    link: Mutex<Link>,
    status_tx: watch::Sender<LinkStatus>,
    /// Cancelled on shutdown; stops the connection task.
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    /// Create the bus. No connection is opened until the first
    /// [`subscribe`](Self::subscribe) or [`ensure_connected`](Self::ensure_connected).
    pub fn new(transport: Arc<dyn Transport>, reconnect_delay: Duration) -> Arc<Self> {
        let (status_tx, _) = watch::channel(LinkStatus::Disconnected);
        Arc::new(Self {
            transport,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            link: Mutex::new(Link {
                generation: 0,
                status: LinkStatus::Disconnected,
                attempts: 0,
                timer: ReconnectTimer::new(reconnect_delay),
            }),
            status_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Watch the connectivity of the shared connection.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Register a subscriber and make sure the connection is up.
    ///
    /// `deliver` runs synchronously on the bus's connection task for every
    /// envelope `predicate` accepts, so it should hand work off (for
    /// example into a channel) rather than block. A panic in either closure
    /// is logged and contained to that subscriber.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<P, D>(self: &Arc<Self>, predicate: P, deliver: D) -> Subscription
    where
        P: Fn(&Envelope) -> bool + Send + Sync + 'static,
        D: Fn(Arc<Envelope>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Subscriber {
            id,
            predicate: Box::new(predicate),
            deliver: Box::new(deliver),
            active: AtomicBool::new(true),
        });
        lock(&self.subscribers).push(Arc::clone(&entry));
        tracing::debug!(subscriber_id = id, "Subscriber registered");

        self.ensure_connected();

        Subscription {
            bus: Arc::downgrade(self),
            entry,
        }
    }

    /// Open the shared connection unless it is already connecting or open.
    ///
    /// Safe to call any number of times from anywhere; at most one physical
    /// connection exists at a time. Calling it while a reconnect is pending
    /// connects immediately and drops the pending timer.
    pub fn ensure_connected(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut link = lock(&self.link);
        match link.status {
            LinkStatus::Connecting | LinkStatus::Connected => {}
            LinkStatus::Disconnected | LinkStatus::Reconnecting => self.open(&mut link),
        }
    }

    /// Stop the connection and any pending reconnect, and drop all
    /// subscribers. The bus cannot be restarted afterwards.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down event bus");
        self.cancel.cancel();
        {
            let mut link = lock(&self.link);
            link.timer.cancel();
            link.generation += 1;
            link.status = LinkStatus::Disconnected;
        }
        self.status_tx.send_replace(LinkStatus::Disconnected);

        let drained: Vec<_> = lock(&self.subscribers).drain(..).collect();
        for entry in drained {
            entry.active.store(false, Ordering::SeqCst);
        }
    }

    // ---- private helpers ----

    fn set_status(&self, link: &mut Link, status: LinkStatus) {
        link.status = status;
        self.status_tx.send_replace(status);
    }

    /// Spawn a connection task. Caller holds the link lock.
    fn open(self: &Arc<Self>, link: &mut Link) {
        link.timer.cancel();
        link.generation += 1;
        link.attempts += 1;
        let generation = link.generation;
        let attempt = link.attempts;
        self.set_status(link, LinkStatus::Connecting);

        tracing::debug!(generation, attempt, "Opening push connection");

        let bus = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        tokio::spawn(run_connection(bus, transport, generation, cancel));
    }

    /// Mark a connection as live. Returns `false` if it has been superseded.
    fn connection_opened(&self, generation: u64) -> bool {
        let mut link = lock(&self.link);
        if link.generation != generation || self.cancel.is_cancelled() {
            return false;
        }
        tracing::info!(attempt = link.attempts, "Event bus connected");
        link.attempts = 0;
        self.set_status(&mut link, LinkStatus::Connected);
        true
    }

    /// React to a terminal close of the connection of `generation`.
    fn connection_closed(self: &Arc<Self>, generation: u64) {
        let mut link = lock(&self.link);
        if link.generation != generation || self.cancel.is_cancelled() {
            return;
        }
        self.set_status(&mut link, LinkStatus::Reconnecting);

        let delay_ms = link.timer.delay().as_millis() as u64;
        tracing::info!(
            attempt = link.attempts,
            delay_ms,
            "Push connection closed, reconnect scheduled",
        );

        let bus = Arc::downgrade(self);
        link.timer.schedule(async move {
            if let Some(bus) = bus.upgrade() {
                bus.reconnect_due(generation);
            }
        });
    }

    /// Fired by the reconnect timer.
    fn reconnect_due(self: &Arc<Self>, generation: u64) {
        let mut link = lock(&self.link);
        // The timer task is the one running; forget it rather than abort it.
        link.timer.clear();
        if link.generation != generation || link.status != LinkStatus::Reconnecting {
            return;
        }
        self.open(&mut link);
    }

    fn remove(&self, id: u64) {
        lock(&self.subscribers).retain(|s| s.id != id);
    }

    fn handle_frame(&self, frame: &SseFrame) {
        match decode_envelope(&frame.data) {
            Ok(envelope) => self.dispatch(Arc::new(envelope)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_message = %frame.data,
                    "Dropping malformed push envelope",
                );
            }
        }
    }

    /// Deliver one envelope to every matching subscriber, in registration
    /// order.
    ///
    /// Works on a snapshot so callbacks may subscribe or dispose
    /// (themselves included) without deadlocking.
    fn dispatch(&self, envelope: Arc<Envelope>) {
        let snapshot: Vec<Arc<Subscriber>> = lock(&self.subscribers).clone();
        let mut delivered = 0usize;

        for sub in snapshot {
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if (sub.predicate)(&envelope) && sub.active.load(Ordering::SeqCst) {
                    (sub.deliver)(Arc::clone(&envelope));
                    true
                } else {
                    false
                }
            }));
            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(_) => {
                    tracing::error!(
                        subscriber_id = sub.id,
                        job_id = %envelope.job_id,
                        event_type = envelope.event_type.as_str(),
                        "Subscriber callback panicked",
                    );
                }
            }
        }

        tracing::debug!(
            job_id = %envelope.job_id,
            event_type = envelope.event_type.as_str(),
            delivered,
            "Envelope dispatched",
        );
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connection task: connect, pump frames into the bus, report the close.
///
/// Holds only a weak reference so an abandoned bus is not kept alive by its
/// own connection.
async fn run_connection(
    bus: Weak<EventBus>,
    transport: Arc<dyn Transport>,
    generation: u64,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = transport.connect() => result,
    };

    let mut frames = match connected {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(error = %e, "Push connection attempt failed");
            if let Some(bus) = bus.upgrade() {
                bus.connection_closed(generation);
            }
            return;
        }
    };

    match bus.upgrade() {
        Some(bus) if bus.connection_opened(generation) => {}
        _ => return,
    }

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = frames.next() => next,
        };
        let Some(live) = bus.upgrade() else {
            return;
        };
        match next {
            Some(Ok(frame)) => live.handle_frame(&frame),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Push connection errored");
                break;
            }
            None => {
                tracing::info!("Push connection closed by server");
                break;
            }
        }
    }

    if let Some(bus) = bus.upgrade() {
        bus.connection_closed(generation);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
