//! # Legacy Feed Adapters
//!
//! One constructor per legacy call signature. Each builds an
//! [`EngineConfig`] from the old parameters, honors the per-topic
//! rollout flags, and starts a [`SyncEngine`]; the engine's result
//! surface covers everything the old call shapes exposed. Callback
//! identity is irrelevant here: subscriptions key on value equality of
//! topics and filters.

use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::config::EngineConfig;
use crate::engine::{EngineContext, SyncEngine};
use crate::errors::EngineResult;
use crate::fetch::QueryParams;

/// Operations collection
pub const OPERATIONS_TOPIC: &str = "operacao";

/// Participations collection
pub const PARTICIPATIONS_TOPIC: &str = "participacao";

/// Event log collection
pub const EVENT_LOG_TOPIC: &str = "evento";

/// Per-topic rollout switches, passed explicitly to the adapters.
///
/// Realtime starts enabled for every topic; disabling one downgrades
/// its feeds to poll-and-fetch only.
#[derive(Debug, Clone, Default)]
pub struct RolloutFlags {
    realtime_disabled: BTreeSet<String>,
}

impl RolloutFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable push delivery for one topic
    pub fn set_realtime_enabled(&mut self, topic: impl Into<String>, enabled: bool) {
        let topic = topic.into();
        if enabled {
            self.realtime_disabled.remove(&topic);
        } else {
            self.realtime_disabled.insert(topic);
        }
    }

    /// Whether push delivery is enabled for a topic
    pub fn realtime_enabled(&self, topic: &str) -> bool {
        !self.realtime_disabled.contains(topic)
    }
}

/// Live operations for a date window, optionally narrowed by status
pub fn operations_feed(
    ctx: EngineContext,
    flags: &RolloutFlags,
    date_from: NaiveDate,
    date_to: NaiveDate,
    status: Option<&str>,
) -> EngineResult<SyncEngine> {
    SyncEngine::start(ctx, operations_config(flags, date_from, date_to, status))
}

fn operations_config(
    flags: &RolloutFlags,
    date_from: NaiveDate,
    date_to: NaiveDate,
    status: Option<&str>,
) -> EngineConfig {
    let mut query = QueryParams::topic(OPERATIONS_TOPIC).with_date_range(date_from, date_to);
    let mut config =
        EngineConfig::new([OPERATIONS_TOPIC]).realtime(flags.realtime_enabled(OPERATIONS_TOPIC));

    if let Some(status) = status {
        config = config.with_filter(OPERATIONS_TOPIC, format!("status=eq.{}", status));
        query = query.with_filter("status", format!("eq.{}", status));
    }
    config.with_initial_query(query)
}

/// Live participations belonging to a set of operations
pub fn participations_feed(
    ctx: EngineContext,
    flags: &RolloutFlags,
    operation_ids: &[String],
) -> EngineResult<SyncEngine> {
    SyncEngine::start(ctx, participations_config(flags, operation_ids))
}

fn participations_config(flags: &RolloutFlags, operation_ids: &[String]) -> EngineConfig {
    let csv = operation_ids.join(",");
    EngineConfig::new([PARTICIPATIONS_TOPIC])
        .realtime(flags.realtime_enabled(PARTICIPATIONS_TOPIC))
        .with_filter(PARTICIPATIONS_TOPIC, format!("operacao_id=in.({})", csv))
        .with_initial_query(
            QueryParams::topic(PARTICIPATIONS_TOPIC)
                .with_filter("operacao_id", format!("in.({})", csv)),
        )
}

/// Push-only audit trail across the given topics
pub fn event_log_feed(
    ctx: EngineContext,
    flags: &RolloutFlags,
    topics: &[String],
) -> EngineResult<SyncEngine> {
    SyncEngine::start(ctx, event_log_config(flags, topics))
}

fn event_log_config(flags: &RolloutFlags, topics: &[String]) -> EngineConfig {
    // Push delivery only when the rollout allows every topic in the feed
    let realtime = topics.iter().all(|t| flags.realtime_enabled(t));
    EngineConfig::new(topics.iter().cloned())
        .realtime(realtime)
        .polling(false)
        .fetch(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn june() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
        )
    }

    #[test]
    fn test_rollout_flags_default_enabled() {
        let flags = RolloutFlags::new();
        assert!(flags.realtime_enabled(OPERATIONS_TOPIC));
    }

    #[test]
    fn test_rollout_flags_toggle() {
        let mut flags = RolloutFlags::new();
        flags.set_realtime_enabled(OPERATIONS_TOPIC, false);
        assert!(!flags.realtime_enabled(OPERATIONS_TOPIC));
        assert!(flags.realtime_enabled(PARTICIPATIONS_TOPIC));

        flags.set_realtime_enabled(OPERATIONS_TOPIC, true);
        assert!(flags.realtime_enabled(OPERATIONS_TOPIC));
    }

    #[test]
    fn test_operations_config_carries_status_both_ways() {
        let (from, to) = june();
        let config = operations_config(&RolloutFlags::new(), from, to, Some("OPEN"));

        assert_eq!(config.topics, vec![OPERATIONS_TOPIC]);
        assert_eq!(
            config.filters.get(OPERATIONS_TOPIC).map(String::as_str),
            Some("status=eq.OPEN")
        );

        let query = config.initial_query.unwrap();
        assert_eq!(
            query.query_pairs(),
            vec![
                ("date_from".to_string(), "2025-06-01".to_string()),
                ("date_to".to_string(), "2025-06-30".to_string()),
                ("status".to_string(), "eq.OPEN".to_string()),
            ]
        );
    }

    #[test]
    fn test_operations_config_without_status_has_no_filter() {
        let (from, to) = june();
        let config = operations_config(&RolloutFlags::new(), from, to, None);
        assert!(config.filters.is_empty());
        assert!(config.compile().is_ok());
    }

    #[test]
    fn test_operations_config_honors_rollout_flag() {
        let (from, to) = june();
        let mut flags = RolloutFlags::new();
        flags.set_realtime_enabled(OPERATIONS_TOPIC, false);

        let config = operations_config(&flags, from, to, None);
        assert!(!config.enable_realtime);
        assert!(config.enable_polling, "polling still covers the feed");
    }

    #[test]
    fn test_participations_config_filters_by_operation_ids() {
        let ids = vec!["3".to_string(), "7".to_string()];
        let config = participations_config(&RolloutFlags::new(), &ids);

        assert_eq!(
            config.filters.get(PARTICIPATIONS_TOPIC).map(String::as_str),
            Some("operacao_id=in.(3,7)")
        );
        let spec = config.compile().unwrap();
        assert!(spec.filters.contains_key(PARTICIPATIONS_TOPIC));

        let query = config.initial_query.unwrap();
        assert_eq!(
            query.query_pairs(),
            vec![("operacao_id".to_string(), "in.(3,7)".to_string())]
        );
    }

    #[test]
    fn test_event_log_config_is_push_only() {
        let topics = vec![OPERATIONS_TOPIC.to_string(), EVENT_LOG_TOPIC.to_string()];
        let config = event_log_config(&RolloutFlags::new(), &topics);

        assert!(config.enable_realtime);
        assert!(!config.enable_polling);
        assert!(!config.enable_fetch);
        assert!(config.initial_query.is_none());
    }

    #[test]
    fn test_event_log_realtime_needs_every_topic_enabled() {
        let topics = vec![OPERATIONS_TOPIC.to_string(), EVENT_LOG_TOPIC.to_string()];
        let mut flags = RolloutFlags::new();
        flags.set_realtime_enabled(EVENT_LOG_TOPIC, false);

        let config = event_log_config(&flags, &topics);
        assert!(!config.enable_realtime);
    }
}
