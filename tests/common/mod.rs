//! Shared in-memory transport and fetch doubles for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use livesync::engine::EngineContext;
use livesync::errors::{EngineError, EngineResult, FetchError};
use livesync::event::ChangeEvent;
use livesync::fetch::{FetchResult, Fetcher, QueryParams};
use livesync::filter::FilterExpr;
use livesync::transport::{Connector, LinkEvent, TransportLink};

/// Connector whose dial outcomes follow a script; links it hands out
/// can be fed events or dropped from the test.
pub struct MockConnector {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: bool,
    links: Mutex<Vec<mpsc::Sender<LinkEvent>>>,
    calls: AtomicU32,
}

impl MockConnector {
    /// Every dial succeeds
    pub fn always_up() -> Self {
        Self::scripted([], true)
    }

    /// Dial outcomes follow the script, then the fallback
    pub fn scripted(outcomes: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            fallback,
            links: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of dial attempts so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Feed an event to every live link
    pub async fn push(&self, event: ChangeEvent) {
        let links: Vec<_> = self.links.lock().unwrap().clone();
        for link in links {
            let _ = link.send(LinkEvent::Change(event.clone())).await;
        }
    }

    /// Tear down every live link, as a flaky network would
    pub async fn drop_links(&self) {
        let links: Vec<_> = std::mem::take(&mut *self.links.lock().unwrap());
        for link in links {
            let _ = link
                .send(LinkEvent::Dropped("scripted drop".to_string()))
                .await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _topics: &[String],
        _filters: &BTreeMap<String, FilterExpr>,
    ) -> EngineResult<TransportLink> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let up = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if !up {
            return Err(EngineError::Connection("scripted failure".to_string()));
        }

        let (tx, rx) = mpsc::channel(16);
        let (close_tx, _close_rx) = oneshot::channel();
        self.links.lock().unwrap().push(tx);
        Ok(TransportLink::new(rx, close_tx))
    }
}

/// One scripted fetch outcome
pub enum FetchStep {
    /// Resolve with records at a pinned fetch time
    Ok(Vec<Value>, DateTime<Utc>),
    /// Resolve with an error
    Err(FetchError),
    /// Hold the fetch until the test releases the gate
    Wait(oneshot::Receiver<Result<FetchResult, FetchError>>),
}

/// Fetcher that replays scripted outcomes in call order and records
/// the query params of every call. Exhausted scripts resolve empty.
pub struct ScriptedFetcher {
    steps: Mutex<VecDeque<FetchStep>>,
    calls: Mutex<Vec<QueryParams>>,
}

impl ScriptedFetcher {
    pub fn new(steps: impl IntoIterator<Item = FetchStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every fetch resolves with zero records
    pub fn empty() -> Self {
        Self::new([])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<QueryParams> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, params: &QueryParams) -> Result<FetchResult, FetchError> {
        self.calls.lock().unwrap().push(params.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(FetchStep::Ok(records, at)) => Ok(FetchResult::at(records, at)),
            Some(FetchStep::Err(error)) => Err(error),
            Some(FetchStep::Wait(gate)) => gate
                .await
                .unwrap_or_else(|_| Err(FetchError::Http("gate dropped".to_string()))),
            None => Ok(FetchResult::new(Vec::new())),
        }
    }
}

/// Route engine tracing to the test output when `RUST_LOG` asks for it
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Context over the given doubles
pub fn build_ctx(connector: Arc<MockConnector>, fetcher: Arc<ScriptedFetcher>) -> EngineContext {
    init_tracing();
    EngineContext::new(connector, fetcher)
}

/// Fixed test epoch plus an offset, for deterministic timestamps
pub fn at_secs(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset)
}

/// Update event with a pinned observation time
pub fn update_event(topic: &str, body: Value, at: DateTime<Utc>) -> ChangeEvent {
    ChangeEvent::update(topic, body.clone(), body).observed(at)
}

/// Run queued tasks until the condition holds. Never advances the
/// clock, so timers stay untouched.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Advance the paused clock in fixed steps until the condition holds
pub async fn advance_until(
    step: Duration,
    max_steps: usize,
    mut predicate: impl FnMut() -> bool,
) {
    for _ in 0..max_steps {
        if predicate() {
            return;
        }
        tokio::time::advance(step).await;
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
