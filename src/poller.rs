//! # Adaptive Poller
//!
//! Periodic refresh ticks whose cadence follows how attentively the
//! consuming surface is being used. Hidden surfaces poll rarely,
//! focused ones with recent interaction poll fastest.
//!
//! The timer is rearmed after every tick using the then-current
//! classification, so visibility and focus changes take effect on the
//! next cycle (bounded staleness).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Poll cadence per surface class
#[derive(Debug, Clone)]
pub struct PollIntervals {
    /// Visible and focused
    pub active: Duration,

    /// Visible but not focused
    pub inactive: Duration,

    /// Focused with a recent interaction
    pub focus: Duration,

    /// Not visible at all
    pub blur: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            active: Duration::from_secs(30),
            inactive: Duration::from_secs(60),
            focus: Duration::from_secs(15),
            blur: Duration::from_secs(300),
        }
    }
}

impl PollIntervals {
    /// Interval for one classification
    pub fn for_class(&self, class: SurfaceClass) -> Duration {
        match class {
            SurfaceClass::Focus => self.focus,
            SurfaceClass::Active => self.active,
            SurfaceClass::Inactive => self.inactive,
            SurfaceClass::Blur => self.blur,
        }
    }
}

/// Surface attention classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceClass {
    /// Focused with a recent interaction
    Focus,
    /// Visible and focused, no recent interaction
    Active,
    /// Visible but not focused
    Inactive,
    /// Hidden
    Blur,
}

impl SurfaceClass {
    /// Priority rule: hidden beats everything, then unfocused, then
    /// interaction recency
    pub fn classify(visible: bool, focused: bool, recently_active: bool) -> Self {
        if !visible {
            return SurfaceClass::Blur;
        }
        if !focused {
            return SurfaceClass::Inactive;
        }
        if recently_active {
            return SurfaceClass::Focus;
        }
        SurfaceClass::Active
    }
}

/// Shared surface signals, written by the facade and read by the
/// poller task. Starts visible, focused, and just-interacted.
#[derive(Debug)]
pub struct SurfaceSignals {
    visible: AtomicBool,
    focused: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Default for SurfaceSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceSignals {
    pub fn new() -> Self {
        Self {
            visible: AtomicBool::new(true),
            focused: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::Relaxed);
    }

    /// Record a user interaction now
    pub fn mark_activity(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    /// Whether an interaction happened within the window
    pub fn recently_active(&self, window: Duration) -> bool {
        self.last_activity
            .lock()
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false)
    }

    /// Classify the surface as of now
    pub fn classify(&self, activity_window: Duration) -> SurfaceClass {
        SurfaceClass::classify(
            self.visible.load(Ordering::Relaxed),
            self.focused.load(Ordering::Relaxed),
            self.recently_active(activity_window),
        )
    }
}

/// Spawn the tick producer.
///
/// Each cycle classifies the surface, sleeps the interval for that
/// class, then offers a tick on the bounded channel. A full buffer
/// means the previous tick was not consumed yet; the tick is skipped
/// and the timer rearmed, never queued behind.
pub fn spawn_poller(
    intervals: PollIntervals,
    signals: Arc<SurfaceSignals>,
    activity_window: Duration,
    ticks: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let class = signals.classify(activity_window);
            let interval = intervals.for_class(class);
            tokio::time::sleep(interval).await;

            match ticks.try_send(()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(())) => {
                    tracing::debug!(?class, "poll tick skipped, previous one still pending");
                }
                Err(mpsc::error::TrySendError::Closed(())) => return,
            }
        }
    })
}
