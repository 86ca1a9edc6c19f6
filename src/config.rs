//! # Engine Configuration
//!
//! Per-instance configuration for the sync engine facade. Topics are
//! required; everything else defaults to a fully enabled engine with
//! standard poll cadence.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::channel::ChannelSpec;
use crate::errors::{EngineError, EngineResult};
use crate::fetch::QueryParams;
use crate::filter::FilterExpr;
use crate::poller::PollIntervals;

/// Facade configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit channel id; derived from topics and filters when absent
    pub channel_id: Option<String>,

    /// Topics to subscribe to (required, non-empty)
    pub topics: Vec<String>,

    /// Per-topic predicate strings in `field=op.value` form
    pub filters: BTreeMap<String, String>,

    /// Deliver push events
    pub enable_realtime: bool,

    /// Run the adaptive poller
    pub enable_polling: bool,

    /// Run range fetches
    pub enable_fetch: bool,

    /// Poll cadence per surface class
    pub intervals: PollIntervals,

    /// Parameters of the first fetch
    pub initial_query: Option<QueryParams>,

    /// How recent an interaction must be to count as user activity
    pub activity_window: Duration,

    /// Verbose tracing for this instance
    pub debug: bool,
}

impl EngineConfig {
    /// Fully enabled engine over the given topics
    pub fn new(topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            channel_id: None,
            topics: topics.into_iter().map(Into::into).collect(),
            filters: BTreeMap::new(),
            enable_realtime: true,
            enable_polling: true,
            enable_fetch: true,
            intervals: PollIntervals::default(),
            initial_query: None,
            activity_window: Duration::from_secs(60),
            debug: false,
        }
    }

    /// Override the derived channel id
    pub fn with_channel_id(mut self, id: impl Into<String>) -> Self {
        self.channel_id = Some(id.into());
        self
    }

    /// Add a per-topic predicate string (`field=op.value`)
    pub fn with_filter(mut self, topic: impl Into<String>, predicate: impl Into<String>) -> Self {
        self.filters.insert(topic.into(), predicate.into());
        self
    }

    /// Set the first fetch's parameters
    pub fn with_initial_query(mut self, params: QueryParams) -> Self {
        self.initial_query = Some(params);
        self
    }

    /// Toggle push delivery
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.enable_realtime = enabled;
        self
    }

    /// Toggle the adaptive poller
    pub fn polling(mut self, enabled: bool) -> Self {
        self.enable_polling = enabled;
        self
    }

    /// Toggle range fetches
    pub fn fetch(mut self, enabled: bool) -> Self {
        self.enable_fetch = enabled;
        self
    }

    /// Override the poll cadence
    pub fn with_intervals(mut self, intervals: PollIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Override the activity recency window
    pub fn with_activity_window(mut self, window: Duration) -> Self {
        self.activity_window = window;
        self
    }

    /// Verbose tracing for this instance
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate and compile into a channel spec.
    ///
    /// Fails on an empty topic list, an empty topic name, a filter
    /// naming a topic outside the list, or a predicate string that
    /// does not parse.
    pub fn compile(&self) -> EngineResult<ChannelSpec> {
        if self.topics.is_empty() {
            return Err(EngineError::Configuration(
                "at least one topic is required".to_string(),
            ));
        }
        if self.topics.iter().any(|t| t.is_empty()) {
            return Err(EngineError::InvalidTopic("empty topic name".to_string()));
        }

        let mut filters = BTreeMap::new();
        for (topic, predicate) in &self.filters {
            if !self.topics.contains(topic) {
                return Err(EngineError::Configuration(format!(
                    "filter references topic '{}' which is not subscribed",
                    topic
                )));
            }
            filters.insert(topic.clone(), FilterExpr::parse(predicate)?);
        }

        Ok(ChannelSpec::build(
            self.topics.clone(),
            filters,
            self.channel_id.clone(),
        ))
    }
}
