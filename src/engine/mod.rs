//! # Engine Facade
//!
//! The one surface consumers depend on. An engine instance owns a keyed
//! record set fed by three delivery paths: push events from a shared
//! channel, adaptive poll fetches, and on-demand fetches. All merges
//! happen on a single background task, so reconciliation never races;
//! facade reads snapshot the store through a read lock.
//!
//! Lifecycle: [`SyncEngine::start`] validates the configuration,
//! attaches to (or opens) the shared channel, spawns the poller and the
//! engine task, and returns the facade. Dropping the facade, or calling
//! [`SyncEngine::shutdown`], tears all of it down and leaves a record
//! snapshot in the registry cache for quick restarts.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::channel::{ChannelGuard, ChannelRegistry, ChannelSpec, ChannelUpdate, RegistryConfig};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult, FetchError};
use crate::fetch::{FetchOrchestrator, FetchReason, FetchResult, Fetcher, QueryParams};
use crate::metrics::EngineMetrics;
use crate::poller::{spawn_poller, SurfaceSignals};
use crate::reconcile::{Record, RecordStore};
use crate::transport::{ConnectionState, Connector};

/// Change notice buffer; slow readers drop old notices, never block
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Shared services behind every engine instance. Cheap to clone; all
/// engines built from one context share the channel registry (and so
/// deduplicate physical connections) and the metrics registry.
#[derive(Clone)]
pub struct EngineContext {
    registry: Arc<ChannelRegistry>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<EngineMetrics>,
}

impl EngineContext {
    /// Context with default registry configuration
    pub fn new(connector: Arc<dyn Connector>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::with_config(connector, fetcher, RegistryConfig::default())
    }

    /// Context with explicit registry configuration
    pub fn with_config(
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn Fetcher>,
        config: RegistryConfig,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::default());
        Self {
            registry: ChannelRegistry::new(connector, config, Arc::clone(&metrics)),
            fetcher,
            metrics,
        }
    }

    /// The shared channel registry
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Shared engine counters
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}

/// Externally visible engine status
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// First fetch has not resolved yet
    pub loading: bool,

    /// Last fetch failure, cleared by the next success
    pub error: Option<String>,

    /// State of the push channel
    pub connection_state: ConnectionState,

    /// When the last push event arrived
    pub last_event_time: Option<DateTime<Utc>>,

    /// Push events delivered to this engine
    pub events_received: u64,

    /// When the last accepted fetch obtained its data
    pub last_fetch_time: Option<DateTime<Utc>>,

    /// Reason of the last accepted fetch
    pub last_fetch_reason: Option<FetchReason>,
}

/// Coalesced change notification, one per merged batch
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Ids whose records changed in the batch
    pub changed: BTreeSet<String>,

    /// When the batch merged
    pub at: DateTime<Utc>,
}

/// State shared between the engine task (sole writer) and facade reads
struct EngineShared {
    records: RwLock<RecordStore>,
    status: RwLock<EngineStatus>,
}

impl EngineShared {
    fn read_records(&self) -> RwLockReadGuard<'_, RecordStore> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, RecordStore> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_status(&self) -> RwLockReadGuard<'_, EngineStatus> {
        match self.status.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, EngineStatus> {
        match self.status.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Commands from the facade to the engine task
enum EngineCommand {
    Refetch {
        params: Option<QueryParams>,
        force: bool,
    },
    Reconnect,
    Disconnect,
    Shutdown,
}

/// A fetch landing back on the engine task
struct FetchDone {
    reason: FetchReason,
    generation: u64,
    result: Result<FetchResult, FetchError>,
}

/// Handle on one running sync engine.
///
/// All methods are callable from any task. Dropping the handle shuts
/// the engine down.
pub struct SyncEngine {
    shared: Arc<EngineShared>,
    signals: Arc<SurfaceSignals>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    changes: broadcast::Sender<ChangeNotice>,
    channel_id: String,
    task: JoinHandle<()>,
}

impl SyncEngine {
    /// Validate the configuration and start the engine.
    ///
    /// Spawns background tasks on the current tokio runtime. Fails only
    /// on configuration errors; transport and fetch failures become
    /// status, never an `Err` here.
    pub fn start(ctx: EngineContext, config: EngineConfig) -> EngineResult<Self> {
        let spec = config.compile()?;
        let channel_id = spec.channel_id.clone();

        let mut store = RecordStore::new();
        if let Some(snapshot) = ctx.registry.cache_get(&channel_id) {
            tracing::debug!(channel = %channel_id, records = snapshot.len(), "seeded from cache");
            store.seed(snapshot);
        }

        let shared = Arc::new(EngineShared {
            records: RwLock::new(store),
            status: RwLock::new(EngineStatus {
                loading: config.enable_fetch && config.initial_query.is_some(),
                error: None,
                connection_state: if config.enable_realtime {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected
                },
                last_event_time: None,
                events_received: 0,
                last_fetch_time: None,
                last_fetch_reason: None,
            }),
        });

        let (guard, channel_rx) = if config.enable_realtime {
            let (guard, rx) = ctx.registry.subscribe(spec.clone());
            (Some(guard), Some(rx))
        } else {
            (None, None)
        };

        let signals = Arc::new(SurfaceSignals::new());
        // One slot: an unconsumed tick means a fetch is already pending,
        // so further ticks are skipped rather than queued
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let poller = if config.enable_polling {
            Some(spawn_poller(
                config.intervals.clone(),
                Arc::clone(&signals),
                config.activity_window,
                tick_tx,
            ))
        } else {
            None
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();

        let current_query = config
            .initial_query
            .clone()
            .unwrap_or_else(|| default_query(&spec));

        let task = tokio::spawn(
            EngineTask {
                ctx,
                config,
                spec,
                shared: Arc::clone(&shared),
                changes: changes_tx.clone(),
                orchestrator: FetchOrchestrator::new(),
                current_query,
                guard,
                channel_rx,
                commands: command_rx,
                ticks: tick_rx,
                fetch_tx,
                fetch_rx,
                poller,
            }
            .run(),
        );

        Ok(Self {
            shared,
            signals,
            commands: command_tx,
            changes: changes_tx,
            channel_id,
            task,
        })
    }

    /// Snapshot of all records, ordered by id
    pub fn data(&self) -> Vec<Record> {
        self.shared.read_records().records()
    }

    /// Snapshot of one record
    pub fn record(&self, id: &str) -> Option<Record> {
        self.shared.read_records().get(id).cloned()
    }

    /// Current engine status
    pub fn status(&self) -> EngineStatus {
        self.shared.read_status().clone()
    }

    /// Current push channel state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.read_status().connection_state
    }

    /// Subscribe to coalesced change notifications. Slow readers lag
    /// and lose old notices rather than blocking merges.
    pub fn changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }

    /// Channel this engine is attached to
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Run a manual fetch. `params` replaces the engine's current query
    /// for this and later fetches; `None` re-runs the current one.
    pub fn refetch(&self, params: Option<QueryParams>) -> EngineResult<()> {
        self.send(EngineCommand::Refetch {
            params,
            force: false,
        })
    }

    /// Run the current query immediately, even when fetching is
    /// disabled by configuration
    pub fn force_execute(&self) -> EngineResult<()> {
        self.send(EngineCommand::Refetch {
            params: None,
            force: true,
        })
    }

    /// Reset the push channel's backoff budget and retry now. After a
    /// `disconnect()` this re-attaches to the channel.
    pub fn reconnect(&self) -> EngineResult<()> {
        self.send(EngineCommand::Reconnect)
    }

    /// Detach from the push channel without discarding records.
    /// Polling and fetching keep running.
    pub fn disconnect(&self) -> EngineResult<()> {
        self.send(EngineCommand::Disconnect)
    }

    /// Surface visibility changed
    pub fn set_visible(&self, visible: bool) {
        self.signals.set_visible(visible);
    }

    /// Surface focus changed
    pub fn set_focused(&self, focused: bool) {
        self.signals.set_focused(focused);
    }

    /// A user interaction happened now
    pub fn mark_activity(&self) {
        self.signals.mark_activity();
    }

    /// Stop the engine and wait for its task to finish
    pub async fn shutdown(self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        let _ = self.task.await;
    }

    fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.commands.send(command).map_err(|_| EngineError::Closed)
    }
}

/// Query used when the configuration gives none: everything in the
/// first topic, narrowed by that topic's filter if present
fn default_query(spec: &ChannelSpec) -> QueryParams {
    let topic = spec.topics.first().cloned().unwrap_or_default();
    let mut params = QueryParams::topic(topic.as_str());
    if let Some(filter) = spec.filters.get(&topic) {
        let (field, value) = filter.query_pair();
        params = params.with_filter(field, value);
    }
    params
}

/// Receive from an optional channel; absent means pend forever so the
/// select arm goes quiet instead of spinning on a closed receiver
async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The engine's cooperative event loop; sole writer of the shared state
struct EngineTask {
    ctx: EngineContext,
    config: EngineConfig,
    spec: ChannelSpec,
    shared: Arc<EngineShared>,
    changes: broadcast::Sender<ChangeNotice>,
    orchestrator: FetchOrchestrator,
    current_query: QueryParams,
    guard: Option<ChannelGuard>,
    channel_rx: Option<mpsc::UnboundedReceiver<ChannelUpdate>>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    ticks: mpsc::Receiver<()>,
    fetch_tx: mpsc::UnboundedSender<FetchDone>,
    fetch_rx: mpsc::UnboundedReceiver<FetchDone>,
    poller: Option<JoinHandle<()>>,
}

impl EngineTask {
    async fn run(mut self) {
        if self.config.debug {
            tracing::debug!(
                channel = %self.spec.channel_id,
                topics = ?self.spec.topics,
                "engine loop started"
            );
        }

        if self.config.enable_fetch && self.config.initial_query.is_some() {
            self.start_fetch(FetchReason::Initial, self.current_query.clone());
        }

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(EngineCommand::Refetch { params, force }) => self.on_refetch(params, force),
                    Some(EngineCommand::Reconnect) => self.on_reconnect(),
                    Some(EngineCommand::Disconnect) => self.on_disconnect(),
                    Some(EngineCommand::Shutdown) | None => break,
                },

                Some(done) = self.fetch_rx.recv() => self.on_fetch_done(done),

                update = recv_or_pending(&mut self.channel_rx) => match update {
                    Some(update) => self.on_channel_update(update),
                    None => self.channel_rx = None,
                },

                Some(()) = self.ticks.recv() => self.on_tick(),
            }
        }

        self.teardown();
    }

    /// Spawn one fetch; its result lands back on this task
    fn start_fetch(&mut self, reason: FetchReason, params: QueryParams) {
        let (generation, superseded) = self.orchestrator.begin(reason);
        if superseded {
            tracing::debug!(%reason, generation, "superseding in-flight fetch");
        }
        self.ctx.metrics.increment_fetches_started();

        let fetcher = Arc::clone(&self.ctx.fetcher);
        let done_tx = self.fetch_tx.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch(&params).await;
            let _ = done_tx.send(FetchDone {
                reason,
                generation,
                result,
            });
        });
    }

    fn on_refetch(&mut self, params: Option<QueryParams>, force: bool) {
        if let Some(params) = params {
            self.current_query = params;
        }
        if !force && !self.config.enable_fetch {
            tracing::debug!("manual refetch ignored, fetching disabled");
            return;
        }
        self.start_fetch(FetchReason::Manual, self.current_query.clone());
    }

    fn on_tick(&mut self) {
        self.ctx.metrics.increment_polls_ticked();
        if self.orchestrator.is_in_flight(FetchReason::Poll) {
            self.ctx.metrics.increment_polls_skipped();
            tracing::debug!("poll tick skipped, previous poll fetch still in flight");
            return;
        }
        self.start_fetch(FetchReason::Poll, self.current_query.clone());
    }

    fn on_fetch_done(&mut self, done: FetchDone) {
        if !self.orchestrator.accept(done.reason, done.generation) {
            self.ctx.metrics.increment_fetches_superseded();
            tracing::debug!(
                reason = %done.reason,
                generation = done.generation,
                "dropped superseded fetch result"
            );
            return;
        }

        match done.result {
            Ok(result) => {
                let report = self.shared.write_records().apply_fetch(&result);
                if report.stale_dropped > 0 {
                    self.ctx.metrics.add_merges_discarded_stale(report.stale_dropped);
                }
                if report.missing_id > 0 {
                    self.ctx.metrics.add_records_skipped_no_id(report.missing_id);
                }
                if self.config.debug {
                    tracing::debug!(
                        reason = %done.reason,
                        fetched = result.records.len(),
                        changed = report.changed.len(),
                        stale = report.stale_dropped,
                        "fetch merged"
                    );
                }

                {
                    let mut status = self.shared.write_status();
                    status.loading = false;
                    status.error = None;
                    status.last_fetch_time = Some(result.fetched_at);
                    status.last_fetch_reason = Some(done.reason);
                }
                self.notify(report.changed);
            }
            Err(error) => {
                self.ctx.metrics.increment_fetches_failed();
                tracing::warn!(reason = %done.reason, %error, "fetch failed");

                // Previously merged records stay visible
                let mut status = self.shared.write_status();
                status.loading = false;
                status.error = Some(error.to_string());
            }
        }
    }

    fn on_channel_update(&mut self, update: ChannelUpdate) {
        match update {
            ChannelUpdate::Event(event) => {
                {
                    let mut status = self.shared.write_status();
                    status.events_received += 1;
                    status.last_event_time = Some(event.observed_at);
                }

                let report = self.shared.write_records().apply_event(&event);
                if report.stale_dropped > 0 {
                    self.ctx.metrics.increment_merges_discarded_stale();
                }
                if report.missing_id > 0 {
                    self.ctx.metrics.add_records_skipped_no_id(report.missing_id);
                }
                if self.config.debug {
                    tracing::debug!(
                        topic = %event.topic,
                        kind = %event.kind,
                        changed = report.changed.len(),
                        stale = report.stale_dropped,
                        "event merged"
                    );
                }
                self.notify(report.changed);
            }
            ChannelUpdate::State(next) => {
                let mut status = self.shared.write_status();
                if status.connection_state == ConnectionState::Reconnecting
                    && next == ConnectionState::Connected
                {
                    self.ctx.metrics.increment_reconnects();
                }
                status.connection_state = next;
            }
        }
    }

    fn on_reconnect(&mut self) {
        if !self.config.enable_realtime {
            return;
        }
        match &self.guard {
            Some(guard) => {
                self.ctx.registry.reconnect(guard.channel_id());
            }
            None => {
                // Disconnected earlier; attach again
                let (guard, rx) = self.ctx.registry.subscribe(self.spec.clone());
                self.guard = Some(guard);
                self.channel_rx = Some(rx);
            }
        }
    }

    fn on_disconnect(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.detach();
        }
        self.channel_rx = None;
        self.shared.write_status().connection_state = ConnectionState::Disconnected;
    }

    fn notify(&self, changed: BTreeSet<String>) {
        if changed.is_empty() {
            return;
        }
        // No receivers is fine
        let _ = self.changes.send(ChangeNotice {
            changed,
            at: Utc::now(),
        });
    }

    fn teardown(self) {
        let records = self.shared.read_records().records();
        if !records.is_empty() {
            self.ctx.registry.cache_put(&self.spec.channel_id, records);
        }
        if let Some(poller) = self.poller {
            poller.abort();
        }
        if self.config.debug {
            tracing::debug!(channel = %self.spec.channel_id, "engine loop stopped");
        }
        // Dropping the guard detaches from the channel
    }
}
