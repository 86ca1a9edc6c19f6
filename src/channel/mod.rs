//! # Channel Registry
//!
//! Multiplexes logical subscriptions onto physical push connections.
//!
//! Callers asking for the same (topics, filters) share one transport
//! channel via reference counting; the channel closes when the last
//! subscriber detaches. Identity is a deterministic hash over the
//! sorted topic and filter set, so equal requests always collapse.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::ChangeEvent;
use crate::filter::FilterExpr;
use crate::metrics::EngineMetrics;
use crate::reconcile::Record;
use crate::transport::backoff::BackoffPolicy;
use crate::transport::{
    spawn_transport_task, ConnectionState, Connector, TransportCommand, TransportUpdate,
};

/// Hex digits of the digest kept in a derived channel id
const CHANNEL_ID_HASH_LEN: usize = 16;

/// What one logical subscription asks for
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Deterministic identity; equal specs share one channel
    pub channel_id: String,

    /// Topics, sorted and deduplicated
    pub topics: Vec<String>,

    /// Per-topic predicate, re-checked on fan-out
    pub filters: BTreeMap<String, FilterExpr>,
}

impl ChannelSpec {
    /// Build a spec, deriving the channel id unless one is given
    pub fn build(
        topics: impl IntoIterator<Item = impl Into<String>>,
        filters: BTreeMap<String, FilterExpr>,
        explicit_id: Option<String>,
    ) -> Self {
        let mut topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        topics.sort();
        topics.dedup();
        let channel_id = explicit_id.unwrap_or_else(|| derive_channel_id(&topics, &filters));
        Self {
            channel_id,
            topics,
            filters,
        }
    }

    /// Whether an event belongs on this channel.
    ///
    /// The backend filters server-side already; arriving events are
    /// re-checked so a misbehaving backend cannot leak non-matching
    /// rows to subscribers.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.topics.iter().any(|t| t == &event.topic) {
            return false;
        }
        match self.filters.get(&event.topic) {
            Some(filter) => event
                .record_body()
                .map(|body| filter.matches(body))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// Derive a channel id from topics and canonical filter text.
///
/// Input order does not matter; topics are sorted and filters are
/// keyed by topic, so identical requests yield identical ids.
pub fn derive_channel_id(topics: &[String], filters: &BTreeMap<String, FilterExpr>) -> String {
    let mut sorted: Vec<&str> = topics.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut canonical = sorted.join(",");
    for (topic, filter) in filters {
        canonical.push('|');
        canonical.push_str(topic);
        canonical.push('=');
        canonical.push_str(&filter.canonical());
    }

    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    format!(
        "live:{}:{}",
        sorted.join("+"),
        &digest[..CHANNEL_ID_HASH_LEN]
    )
}

/// Update fanned out to channel subscribers
#[derive(Debug, Clone)]
pub enum ChannelUpdate {
    /// A change event that passed the channel's filters
    Event(ChangeEvent),

    /// Connection state transition (also replayed to late attachers)
    State(ConnectionState),
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Reconnect policy handed to every transport task
    pub backoff: BackoffPolicy,

    /// How long a teardown snapshot stays servable
    pub snapshot_window: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            snapshot_window: Duration::from_secs(30),
        }
    }
}

/// One live channel and its attached subscribers
struct ChannelEntry {
    spec: ChannelSpec,
    refcount: usize,
    state: ConnectionState,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<ChannelUpdate>>,
    commands: mpsc::UnboundedSender<TransportCommand>,
}

/// Record snapshot kept across engine restarts
struct CachedSnapshot {
    records: Vec<Record>,
    stored_at: Instant,
}

#[derive(Default)]
struct RegistryInner {
    channels: HashMap<String, ChannelEntry>,
    snapshots: HashMap<String, CachedSnapshot>,
}

/// Registry counters for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live physical channels
    pub channel_count: usize,

    /// Subscriber count per channel id
    pub refcounts: BTreeMap<String, usize>,
}

/// Owns every physical push connection.
///
/// Only the registry opens or closes transport channels; consumers go
/// through [`ChannelRegistry::subscribe`] and hold a [`ChannelGuard`].
pub struct ChannelRegistry {
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    metrics: Arc<EngineMetrics>,
    inner: Mutex<RegistryInner>,
    // Handed to pump tasks and guards; lets them outlive the registry
    self_weak: Weak<ChannelRegistry>,
}

impl ChannelRegistry {
    /// Create a registry over a connector
    pub fn new(
        connector: Arc<dyn Connector>,
        config: RegistryConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            connector,
            config,
            metrics,
            inner: Mutex::new(RegistryInner::default()),
            self_weak: self_weak.clone(),
        })
    }

    fn locked(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Attach a subscriber, reusing a live channel when the spec's id
    /// matches one. The current connection state is replayed as the
    /// first update so late attachers see where the link stands.
    pub fn subscribe(
        &self,
        spec: ChannelSpec,
    ) -> (ChannelGuard, mpsc::UnboundedReceiver<ChannelUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel_id = spec.channel_id.clone();
        let subscriber = Uuid::new_v4();

        let mut inner = self.locked();
        if let Some(entry) = inner.channels.get_mut(&channel_id) {
            entry.refcount += 1;
            let _ = tx.send(ChannelUpdate::State(entry.state));
            entry.subscribers.insert(subscriber, tx);
            tracing::debug!(
                channel_id = %channel_id,
                refcount = entry.refcount,
                "attached to existing channel"
            );
        } else {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (update_tx, update_rx) = mpsc::unbounded_channel();

            spawn_transport_task(
                Arc::clone(&self.connector),
                channel_id.clone(),
                spec.topics.clone(),
                spec.filters.clone(),
                self.config.backoff.clone(),
                update_tx,
                command_rx,
            );
            spawn_pump(self.self_weak.clone(), channel_id.clone(), update_rx);

            let _ = tx.send(ChannelUpdate::State(ConnectionState::Connecting));
            let mut subscribers = HashMap::new();
            subscribers.insert(subscriber, tx);

            inner.channels.insert(
                channel_id.clone(),
                ChannelEntry {
                    spec,
                    refcount: 1,
                    state: ConnectionState::Connecting,
                    subscribers,
                    commands: command_tx,
                },
            );
            self.metrics.increment_channels_opened();
            tracing::info!(channel_id = %channel_id, "opened channel");
        }
        drop(inner);

        let guard = ChannelGuard {
            registry: self.self_weak.clone(),
            channel_id,
            subscriber,
            detached: false,
        };
        (guard, rx)
    }

    /// Fan one transport update out to the channel's subscribers
    fn fan_out(&self, channel_id: &str, update: TransportUpdate) {
        let mut inner = self.locked();
        let Some(entry) = inner.channels.get_mut(channel_id) else {
            return;
        };

        match update {
            TransportUpdate::State(next) => {
                entry.state = next;
                entry
                    .subscribers
                    .retain(|_, tx| tx.send(ChannelUpdate::State(next)).is_ok());
            }
            TransportUpdate::Event(event) => {
                if !entry.spec.matches(&event) {
                    self.metrics.increment_events_filtered();
                    tracing::debug!(
                        channel_id,
                        topic = %event.topic,
                        "dropped non-matching event"
                    );
                    return;
                }
                self.metrics.increment_events_dispatched();
                entry
                    .subscribers
                    .retain(|_, tx| tx.send(ChannelUpdate::Event(event.clone())).is_ok());
            }
        }
    }

    fn detach(&self, channel_id: &str, subscriber: Uuid) {
        let mut inner = self.locked();
        let Some(entry) = inner.channels.get_mut(channel_id) else {
            return;
        };

        entry.subscribers.remove(&subscriber);
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let _ = entry.commands.send(TransportCommand::Close);
            inner.channels.remove(channel_id);
            self.metrics.increment_channels_closed();
            tracing::info!(channel_id, "closed channel");
        } else {
            tracing::debug!(channel_id, refcount = entry.refcount, "detached subscriber");
        }
    }

    /// Reset the channel's backoff budget and retry immediately.
    /// Returns false when no such channel is live.
    pub fn reconnect(&self, channel_id: &str) -> bool {
        let inner = self.locked();
        inner
            .channels
            .get(channel_id)
            .map(|entry| entry.commands.send(TransportCommand::Reconnect).is_ok())
            .unwrap_or(false)
    }

    /// Live channel counts
    pub fn stats(&self) -> RegistryStats {
        let inner = self.locked();
        RegistryStats {
            channel_count: inner.channels.len(),
            refcounts: inner
                .channels
                .iter()
                .map(|(id, entry)| (id.clone(), entry.refcount))
                .collect(),
        }
    }

    /// Store a record snapshot for the channel id
    pub fn cache_put(&self, channel_id: &str, records: Vec<Record>) {
        let mut inner = self.locked();
        inner.snapshots.insert(
            channel_id.to_string(),
            CachedSnapshot {
                records,
                stored_at: Instant::now(),
            },
        );
    }

    /// Fetch the snapshot for a channel id if it is still inside the
    /// configured window; stale snapshots are evicted
    pub fn cache_get(&self, channel_id: &str) -> Option<Vec<Record>> {
        let mut inner = self.locked();
        if let Some(snapshot) = inner.snapshots.get(channel_id) {
            if snapshot.stored_at.elapsed() <= self.config.snapshot_window {
                self.metrics.increment_cache_hits();
                return Some(snapshot.records.clone());
            }
            inner.snapshots.remove(channel_id);
        }
        self.metrics.increment_cache_misses();
        None
    }
}

/// Forward transport updates into the registry fan-out until either
/// side goes away
fn spawn_pump(
    registry: Weak<ChannelRegistry>,
    channel_id: String,
    mut updates: mpsc::UnboundedReceiver<TransportUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.fan_out(&channel_id, update);
        }
    })
}

/// Handle on one logical subscription. Detaching (or dropping) the
/// guard releases the channel once the last subscriber is gone.
#[derive(Debug)]
pub struct ChannelGuard {
    registry: Weak<ChannelRegistry>,
    channel_id: String,
    subscriber: Uuid,
    detached: bool,
}

impl ChannelGuard {
    /// The channel this guard is attached to
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Detach now instead of at drop
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(&self.channel_id, self.subscriber);
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.release();
    }
}
