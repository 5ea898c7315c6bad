//! Mailbox monitoring and actor-system counters.
//!
//! Each actor shares a [`MailboxMonitor`] with its handle. The handle
//! records an enqueue before it sends and takes it back if the send is
//! refused; the actor records the dequeue once a message is handled. Depth
//! past `elevated` is logged once at debug on the way up; depth past
//! `critical` warns on every enqueue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::observability::metrics as prom;

/// Mailbox depths at which an actor is considered backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxThresholds {
    pub elevated: usize,
    pub critical: usize,
}

/// Stream and registry actors see bursts on join storms.
pub const STREAM_THRESHOLDS: MailboxThresholds = MailboxThresholds {
    elevated: 100,
    critical: 500,
};

/// A connection mailbox holds outbound frames for one slow peer.
pub const CONNECTION_THRESHOLDS: MailboxThresholds = MailboxThresholds {
    elevated: 50,
    critical: 200,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Registry,
    Stream,
    Connection,
}

impl ActorType {
    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Stream => "stream",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn thresholds(&self) -> MailboxThresholds {
        match self {
            ActorType::Registry | ActorType::Stream => STREAM_THRESHOLDS,
            ActorType::Connection => CONNECTION_THRESHOLDS,
        }
    }
}

/// Up/down counter that never goes below zero.
#[derive(Debug, Default)]
struct Level(AtomicUsize);

impl Level {
    fn up(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn down(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-actor mailbox accounting.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Stream id, connection id, or the relay instance id.
    actor_id: String,
    depth: Level,
    peak: AtomicUsize,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: Level::default(),
            peak: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Called by the sender before it hands a message to the mailbox.
    pub fn record_enqueue(&self) {
        let depth = self.depth.up();
        self.peak.fetch_max(depth, Ordering::Relaxed);

        let thresholds = self.actor_type.thresholds();
        if depth > thresholds.critical {
            warn!(
                target: "relay.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox backed up"
            );
        } else if depth == thresholds.elevated + 1 {
            debug!(
                target: "relay.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox depth elevated"
            );
        }
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    pub fn record_dequeue(&self) {
        let depth = self.depth.down();
        self.processed.fetch_add(1, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    /// The mailbox was full; the enqueue did not land.
    pub fn record_drop(&self) {
        self.depth.down();
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "relay.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Mailbox full, message dropped"
        );
    }

    /// The actor has stopped; the enqueue did not land.
    pub fn record_closed(&self) {
        let depth = self.depth.down();
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.get()
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_backed_up(&self) -> bool {
        self.current_depth() > self.actor_type.thresholds().critical
    }
}

/// Counters shared by every actor in one relay.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    streams: Level,
    connections: Level,
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stream_opened(&self) {
        prom::set_streams_active(self.streams.up());
    }

    pub fn stream_closed(&self) {
        prom::set_streams_active(self.streams.down());
    }

    pub fn connection_opened(&self) {
        prom::set_connections_active(self.connections.up());
    }

    pub fn connection_closed(&self) {
        prom::set_connections_active(self.connections.down());
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        error!(
            target: "relay.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.get()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.get()
    }
}
