//! Poller Adaptivity Tests
//!
//! Cadence follows the surface signals exposed on the engine facade.
//! The timer rearms with the then-current classification at each tick,
//! so a signal flip lands on the next cycle, never mid-sleep.
//!
//! Engines run polling-only here (no push transport) so every fetch
//! call is a poll.

mod common;

use std::sync::Arc;
use std::time::Duration;

use livesync::config::EngineConfig;
use livesync::engine::SyncEngine;

use common::*;

// =============================================================================
// Helpers
// =============================================================================

fn polling_only() -> EngineConfig {
    EngineConfig::new(["operacao"]).realtime(false)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Visibility
// =============================================================================

/// Hiding the surface mid-cycle keeps the armed 15s timer; the 300s
/// blur interval applies from the next rearm.
#[tokio::test(start_paused = true)]
async fn test_hidden_surface_defers_from_next_cycle() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::empty());
    let ctx = build_ctx(connector, Arc::clone(&fetcher));
    let engine = SyncEngine::start(ctx, polling_only()).unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(10)).await;
    engine.set_visible(false);
    tokio::time::advance(Duration::from_secs(5)).await;
    wait_until(|| fetcher.call_count() == 1).await;

    // Blur cadence now in effect: nothing for another 300s
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(fetcher.call_count(), 1);

    tokio::time::advance(Duration::from_secs(240)).await;
    wait_until(|| fetcher.call_count() == 2).await;
}

// =============================================================================
// Focus
// =============================================================================

/// An unfocused surface polls at the 60s inactive cadence.
#[tokio::test(start_paused = true)]
async fn test_unfocused_surface_polls_inactive_cadence() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::empty());
    let ctx = build_ctx(connector, Arc::clone(&fetcher));
    let engine = SyncEngine::start(ctx, polling_only()).unwrap();
    engine.set_focused(false);
    settle().await;

    tokio::time::advance(Duration::from_secs(59)).await;
    settle().await;
    assert_eq!(fetcher.call_count(), 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    wait_until(|| fetcher.call_count() == 1).await;

    tokio::time::advance(Duration::from_secs(60)).await;
    wait_until(|| fetcher.call_count() == 2).await;
}

/// Regaining focus with a fresh interaction speeds polling up to the
/// 15s focus cadence, which decays to 30s once the interaction ages
/// past the activity window.
#[tokio::test(start_paused = true)]
async fn test_activity_restores_focus_cadence() {
    let connector = Arc::new(MockConnector::always_up());
    let fetcher = Arc::new(ScriptedFetcher::empty());
    let ctx = build_ctx(connector, Arc::clone(&fetcher));
    let engine = SyncEngine::start(ctx, polling_only()).unwrap();
    engine.set_focused(false);
    settle().await;

    // User comes back at 10s; the armed 60s timer still runs out first
    tokio::time::advance(Duration::from_secs(10)).await;
    engine.set_focused(true);
    engine.mark_activity();
    tokio::time::advance(Duration::from_secs(50)).await;
    wait_until(|| fetcher.call_count() == 1).await;

    // Interaction at 10s is still inside the 60s window at the rearm
    tokio::time::advance(Duration::from_secs(15)).await;
    wait_until(|| fetcher.call_count() == 2).await;

    // By now it has aged out; cadence decays to the 30s active interval
    tokio::time::advance(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(fetcher.call_count(), 2);

    tokio::time::advance(Duration::from_secs(15)).await;
    wait_until(|| fetcher.call_count() == 3).await;
}
