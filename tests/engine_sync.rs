//! Engine Merge Semantics Tests
//!
//! Drives whole engines through fetch, push, and poll paths and checks
//! the merged view:
//! - Latest write wins by record timestamp, whatever channel carried it
//! - Superseded fetch generations are dropped unapplied
//! - Fetch errors keep the stale records available
//! - Poll ticks never stack a second request behind an in-flight one

mod common;

use std::sync::Arc;
use std::time::Duration;

use livesync::config::EngineConfig;
use livesync::engine::SyncEngine;
use livesync::errors::FetchError;
use livesync::fetch::{FetchReason, FetchResult, QueryParams};
use livesync::transport::ConnectionState;
use serde_json::json;
use tokio::sync::oneshot;

use common::*;

// =============================================================================
// Helpers
// =============================================================================

fn operacao_config() -> EngineConfig {
    EngineConfig::new(["operacao"]).polling(false)
}

// =============================================================================
// Fetch and Push Reconciliation
// =============================================================================

/// Initial fetch loads the set; a newer push overwrites in place.
#[tokio::test(start_paused = true)]
async fn test_initial_fetch_then_newer_event_wins() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::new([FetchStep::Ok(
        vec![json!({"id": "1", "status": "OPEN"})],
        at_secs(10),
    )]));
    let ctx = build_ctx(Arc::clone(&connector), Arc::clone(&fetcher));

    let engine = SyncEngine::start(
        ctx.clone(),
        operacao_config().with_initial_query(QueryParams::topic("operacao")),
    )
    .unwrap();
    assert!(engine.status().loading, "loading until the initial fetch lands");

    let mut changes = engine.changes();
    let notice = changes.recv().await.unwrap();
    assert!(notice.changed.contains("1"));

    let status = engine.status();
    assert!(!status.loading);
    assert_eq!(status.error, None);
    assert_eq!(status.last_fetch_time, Some(at_secs(10)));
    assert_eq!(status.last_fetch_reason, Some(FetchReason::Initial));

    wait_until(|| engine.connection_state() == ConnectionState::Connected).await;
    connector
        .push(update_event(
            "operacao",
            json!({"id": "1", "status": "CLOSED"}),
            at_secs(20),
        ))
        .await;
    let notice = changes.recv().await.unwrap();
    assert!(notice.changed.contains("1"));

    assert_eq!(
        engine.record("1").unwrap().payload,
        json!({"id": "1", "status": "CLOSED"})
    );
    let status = engine.status();
    assert_eq!(status.events_received, 1);
    assert_eq!(status.last_event_time, Some(at_secs(20)));
}

/// A slow fetch resolving after a newer push must not roll records back.
#[tokio::test(start_paused = true)]
async fn test_stale_fetch_cannot_overwrite_newer_event() {
    let (gate_tx, gate_rx) = oneshot::channel();
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::new([FetchStep::Wait(gate_rx)]));
    let ctx = build_ctx(Arc::clone(&connector), fetcher);

    let engine = SyncEngine::start(
        ctx.clone(),
        operacao_config().with_initial_query(QueryParams::topic("operacao")),
    )
    .unwrap();
    wait_until(|| engine.connection_state() == ConnectionState::Connected).await;

    // Push lands while the fetch is still in flight
    connector
        .push(update_event(
            "operacao",
            json!({"id": "1", "status": "CLOSED"}),
            at_secs(20),
        ))
        .await;
    wait_until(|| engine.record("1").is_some()).await;

    // Release the fetch with an older row for the same id
    gate_tx
        .send(Ok(FetchResult::at(
            vec![json!({"id": "1", "status": "OPEN"})],
            at_secs(10),
        )))
        .unwrap();
    wait_until(|| !engine.status().loading).await;

    assert_eq!(engine.record("1").unwrap().payload["status"], json!("CLOSED"));
    assert_eq!(ctx.metrics().snapshot().merges_discarded_stale, 1);
    assert_eq!(engine.status().last_fetch_reason, Some(FetchReason::Initial));
}

// =============================================================================
// Generation Supersession
// =============================================================================

/// Only the newest in-flight fetch per reason may apply its result.
#[tokio::test(start_paused = true)]
async fn test_second_manual_refetch_supersedes_first() {
    let (gate_tx, gate_rx) = oneshot::channel();
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::new([
        FetchStep::Wait(gate_rx),
        FetchStep::Ok(vec![json!({"id": "1", "rev": 2})], at_secs(30)),
    ]));
    let ctx = build_ctx(Arc::clone(&connector), Arc::clone(&fetcher));

    let engine = SyncEngine::start(ctx.clone(), operacao_config()).unwrap();

    engine.refetch(None).unwrap();
    wait_until(|| fetcher.call_count() == 1).await;
    engine.refetch(None).unwrap();
    wait_until(|| engine.record("1").is_some()).await;

    // First request resolves late with a marker row that must never appear
    gate_tx
        .send(Ok(FetchResult::at(vec![json!({"id": "9"})], at_secs(99))))
        .unwrap();
    wait_until(|| ctx.metrics().snapshot().fetches_superseded == 1).await;

    assert!(engine.record("9").is_none(), "superseded result dropped unapplied");
    assert_eq!(engine.record("1").unwrap().payload["rev"], json!(2));
}

// =============================================================================
// Fetch Errors
// =============================================================================

/// A failed refetch reports the error but keeps the previous records.
#[tokio::test(start_paused = true)]
async fn test_fetch_error_keeps_stale_data_until_next_success() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::new([
        FetchStep::Ok(vec![json!({"id": "1", "status": "OPEN"})], at_secs(10)),
        FetchStep::Err(FetchError::Backend("boom".to_string())),
        FetchStep::Ok(vec![json!({"id": "1", "status": "CLOSED"})], at_secs(30)),
    ]));
    let ctx = build_ctx(Arc::clone(&connector), fetcher);

    let engine = SyncEngine::start(
        ctx.clone(),
        operacao_config().with_initial_query(QueryParams::topic("operacao")),
    )
    .unwrap();
    wait_until(|| !engine.status().loading).await;
    assert_eq!(engine.data().len(), 1);

    engine.refetch(None).unwrap();
    wait_until(|| engine.status().error.is_some()).await;
    assert!(engine.status().error.unwrap().contains("boom"));
    assert_eq!(engine.data().len(), 1, "records retained through the failure");
    assert_eq!(engine.record("1").unwrap().payload["status"], json!("OPEN"));

    engine.refetch(None).unwrap();
    wait_until(|| engine.status().error.is_none()).await;
    assert_eq!(engine.record("1").unwrap().payload["status"], json!("CLOSED"));
    let status = engine.status();
    assert_eq!(status.last_fetch_reason, Some(FetchReason::Manual));
    assert_eq!(status.last_fetch_time, Some(at_secs(30)));
}

// =============================================================================
// Poll Backpressure
// =============================================================================

/// Poll ticks while a poll is in flight are skipped, not queued.
#[tokio::test(start_paused = true)]
async fn test_poll_backpressure_single_in_flight() {
    let (gate_tx, gate_rx) = oneshot::channel();
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::new([FetchStep::Wait(gate_rx)]));
    let ctx = build_ctx(Arc::clone(&connector), Arc::clone(&fetcher));

    let engine = SyncEngine::start(ctx.clone(), EngineConfig::new(["operacao"])).unwrap();
    tokio::task::yield_now().await;

    tokio::time::advance(Duration::from_secs(15)).await;
    wait_until(|| fetcher.call_count() == 1).await;

    tokio::time::advance(Duration::from_secs(15)).await;
    wait_until(|| ctx.metrics().snapshot().polls_skipped == 1).await;
    assert_eq!(fetcher.call_count(), 1, "no second request behind the in-flight one");
    assert_eq!(ctx.metrics().snapshot().polls_ticked, 2);

    gate_tx
        .send(Ok(FetchResult::at(vec![json!({"id": "1"})], at_secs(5))))
        .unwrap();
    wait_until(|| engine.record("1").is_some()).await;

    tokio::time::advance(Duration::from_secs(15)).await;
    wait_until(|| fetcher.call_count() == 2).await;
}

// =============================================================================
// Fetch Toggle
// =============================================================================

/// refetch respects the fetch toggle; force_execute bypasses it.
#[tokio::test(start_paused = true)]
async fn test_refetch_disabled_but_force_executes() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::new([FetchStep::Ok(
        vec![json!({"id": "1"})],
        at_secs(10),
    )]));
    let ctx = build_ctx(Arc::clone(&connector), Arc::clone(&fetcher));

    let engine = SyncEngine::start(ctx.clone(), operacao_config().fetch(false)).unwrap();
    assert!(!engine.status().loading, "no initial load with fetching disabled");

    engine.refetch(None).unwrap();
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(fetcher.call_count(), 0, "refetch is a no-op with fetching disabled");

    engine.force_execute().unwrap();
    wait_until(|| engine.record("1").is_some()).await;
    assert_eq!(fetcher.call_count(), 1);
}

// =============================================================================
// Disconnect and Reconnect
// =============================================================================

/// Disconnect stops delivery but keeps data; reconnect resumes it.
#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_data_reconnect_reattaches() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::empty());
    let ctx = build_ctx(Arc::clone(&connector), fetcher);

    let engine = SyncEngine::start(ctx.clone(), operacao_config().fetch(false)).unwrap();
    wait_until(|| engine.connection_state() == ConnectionState::Connected).await;
    connector
        .push(update_event("operacao", json!({"id": "1"}), at_secs(10)))
        .await;
    wait_until(|| engine.record("1").is_some()).await;

    engine.disconnect().unwrap();
    wait_until(|| engine.connection_state() == ConnectionState::Disconnected).await;
    assert_eq!(engine.data().len(), 1, "records survive the detach");
    assert_eq!(ctx.registry().stats().channel_count, 0);

    // Nothing listens while detached
    connector
        .push(update_event("operacao", json!({"id": "2"}), at_secs(20)))
        .await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(engine.record("2").is_none());
    assert_eq!(engine.status().events_received, 1);

    engine.reconnect().unwrap();
    wait_until(|| engine.connection_state() == ConnectionState::Connected).await;
    assert_eq!(connector.calls(), 2);

    connector
        .push(update_event("operacao", json!({"id": "3"}), at_secs(30)))
        .await;
    wait_until(|| engine.record("3").is_some()).await;
}
