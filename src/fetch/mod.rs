//! # Fetch Orchestration
//!
//! On-demand range queries against the backend, tagged with the
//! reason that triggered them. The orchestrator tracks at most one
//! live request per reason; a newer request with the same reason
//! supersedes the older one, whose result is dropped when it finally
//! lands (last-request-wins per reason).

pub mod http;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FetchError;

/// Why a fetch was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchReason {
    /// First load after engine start
    Initial,
    /// Periodic refresh from the adaptive poller
    Poll,
    /// Explicit caller refetch
    Manual,
}

impl std::fmt::Display for FetchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchReason::Initial => write!(f, "initial"),
            FetchReason::Poll => write!(f, "poll"),
            FetchReason::Manual => write!(f, "manual"),
        }
    }
}

/// Parameters for one range query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Topic (collection) to query
    pub topic: String,

    /// Restrict to specific record ids
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Window start (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,

    /// Window end (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,

    /// Extra narrowing, field name to `op.value`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl QueryParams {
    /// Query everything in a topic
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            topic: name.into(),
            ..Self::default()
        }
    }

    /// Restrict to specific record ids
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to a date window (inclusive on both ends)
    pub fn with_date_range(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.date_from = Some(from);
        self.date_to = Some(to);
        self
    }

    /// Add a narrowing filter, value in `op.value` form
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// Render as query-string pairs in a stable order
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(ids) = &self.ids {
            pairs.push(("ids".to_string(), ids.join(",")));
        }
        if let Some(from) = self.date_from {
            pairs.push(("date_from".to_string(), from.to_string()));
        }
        if let Some(to) = self.date_to {
            pairs.push(("date_to".to_string(), to.to_string()));
        }
        for (field, value) in &self.filters {
            pairs.push((field.clone(), value.clone()));
        }
        pairs
    }
}

/// A fetch result tagged with provenance
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Raw record bodies returned by the backend
    pub records: Vec<Value>,

    /// When the data was obtained; used as the merge timestamp for
    /// every record in the batch
    pub fetched_at: DateTime<Utc>,

    /// Whether the data came from a cache rather than the backend
    pub from_cache: bool,
}

impl FetchResult {
    /// Result fetched just now from the backend
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records,
            fetched_at: Utc::now(),
            from_cache: false,
        }
    }

    /// Result with a pinned fetch time
    pub fn at(records: Vec<Value>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            records,
            fetched_at,
            from_cache: false,
        }
    }

    /// Result served from a cache
    pub fn cached(records: Vec<Value>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            records,
            fetched_at,
            from_cache: true,
        }
    }
}

/// Executes range queries against the backend.
///
/// Implemented by [`http::HttpFetcher`] in production and by scripted
/// fetchers in tests.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Run one range query
    async fn fetch(&self, params: &QueryParams) -> Result<FetchResult, FetchError>;
}

/// Tracks the live request per reason.
///
/// Owned by the engine task; merges happen on one task, so no interior
/// locking is needed here.
#[derive(Debug, Default)]
pub struct FetchOrchestrator {
    in_flight: HashMap<FetchReason, u64>,
    next_generation: u64,
}

impl FetchOrchestrator {
    /// Create an orchestrator with nothing in flight
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request. Returns its generation and whether a
    /// previous same-reason request was superseded.
    pub fn begin(&mut self, reason: FetchReason) -> (u64, bool) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let superseded = self.in_flight.insert(reason, generation).is_some();
        (generation, superseded)
    }

    /// Whether a request with this reason is currently tracked
    pub fn is_in_flight(&self, reason: FetchReason) -> bool {
        self.in_flight.contains_key(&reason)
    }

    /// Decide whether a landed result should merge. Accepting clears
    /// the slot; a stale generation is rejected and leaves any newer
    /// request in flight.
    pub fn accept(&mut self, reason: FetchReason, generation: u64) -> bool {
        match self.in_flight.get(&reason) {
            Some(current) if *current == generation => {
                self.in_flight.remove(&reason);
                true
            }
            _ => false,
        }
    }

    /// Abandon the live request for a reason; its result, if it ever
    /// lands, is dropped. Returns whether anything was in flight.
    pub fn cancel_in_flight(&mut self, reason: FetchReason) -> bool {
        self.in_flight.remove(&reason).is_some()
    }

    /// Number of reasons with a live request
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
