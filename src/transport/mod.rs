//! # Push Transport
//!
//! Connection lifecycle for the push delivery channel. A background
//! task owns the physical link and handles:
//!
//! - Dialing through a [`Connector`], the seam between engine logic
//!   and the physical protocol
//! - Automatic reconnection with capped exponential backoff
//! - The restricted connection state machine surfaced to callers
//! - Immediate retry on an explicit reconnect command
//!
//! The task never merges data itself; it forwards change events and
//! state transitions to the channel registry's fan-out.

pub mod backoff;
pub mod websocket;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::errors::EngineResult;
use crate::event::ChangeEvent;
use crate::filter::FilterExpr;
use backoff::{Backoff, BackoffPolicy};

/// Connection lifecycle state surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Initial dial in progress, never yet connected
    Connecting,
    /// Link established, events flowing
    Connected,
    /// Dial failed or link lost, retrying with backoff
    Reconnecting,
    /// Retry budget spent or explicitly detached; stays here until an
    /// explicit reconnect
    Disconnected,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition
    pub fn can_transition(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Disconnected {
            return true;
        }
        matches!(
            (self, next),
            (Connecting, Connected)
                // A failed dial retries just like a dropped link
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                // Explicit reconnect restarts the machine
                | (Disconnected, Connecting)
        )
    }

    /// Whether the state only changes via an explicit reconnect
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Messages emitted by an open link
#[derive(Debug)]
pub enum LinkEvent {
    /// A change notification from the backend
    Change(ChangeEvent),
    /// The link dropped with a reason; the transport task decides
    /// whether to retry
    Dropped(String),
}

/// An open push connection handed out by a [`Connector`].
///
/// Events arrive through [`TransportLink::recv`]. Dropping the handle
/// (or calling [`TransportLink::close`]) signals the producer to tear
/// the physical connection down.
pub struct TransportLink {
    events: mpsc::Receiver<LinkEvent>,
    closer: Option<oneshot::Sender<()>>,
}

impl TransportLink {
    /// Wrap a producer's event stream and close signal
    pub fn new(events: mpsc::Receiver<LinkEvent>, closer: oneshot::Sender<()>) -> Self {
        Self {
            events,
            closer: Some(closer),
        }
    }

    /// Next event, or `None` once the producer side has gone away
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Tear the connection down
    pub fn close(mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }
}

/// Opens physical push connections.
///
/// Implemented by [`websocket::WebSocketConnector`] in production and
/// by in-memory connectors in tests.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial and subscribe to the given topics, with optional per-topic
    /// server-side predicates
    async fn connect(
        &self,
        topics: &[String],
        filters: &BTreeMap<String, FilterExpr>,
    ) -> EngineResult<TransportLink>;
}

/// Commands accepted by a channel's transport task
#[derive(Debug)]
pub(crate) enum TransportCommand {
    /// Reset the attempt budget and retry immediately
    Reconnect,
    /// Close the link and end the task
    Close,
}

/// Output of the transport task toward the registry fan-out
#[derive(Debug)]
pub(crate) enum TransportUpdate {
    State(ConnectionState),
    Event(ChangeEvent),
}

/// Spawn the background task owning one channel's push connection.
///
/// The task starts in `Connecting` (the registry's birth state for a
/// channel, not re-emitted here) and only sends legal transitions.
pub(crate) fn spawn_transport_task(
    connector: Arc<dyn Connector>,
    channel_id: String,
    topics: Vec<String>,
    filters: BTreeMap<String, FilterExpr>,
    policy: BackoffPolicy,
    updates: mpsc::UnboundedSender<TransportUpdate>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
) -> JoinHandle<()> {
    tokio::spawn(transport_task(
        connector, channel_id, topics, filters, policy, updates, commands,
    ))
}

async fn transport_task(
    connector: Arc<dyn Connector>,
    channel_id: String,
    topics: Vec<String>,
    filters: BTreeMap<String, FilterExpr>,
    policy: BackoffPolicy,
    updates: mpsc::UnboundedSender<TransportUpdate>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
) {
    let mut state = ConnectionState::Connecting;
    let mut backoff = Backoff::new(policy);
    let mut link: Option<TransportLink> = None;

    loop {
        if let Some(active) = link.as_mut() {
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    // Already connected, nothing to do
                    Some(TransportCommand::Reconnect) => {}
                    Some(TransportCommand::Close) | None => {
                        if let Some(l) = link.take() {
                            l.close();
                        }
                        return;
                    }
                },

                event = active.recv() => match event {
                    Some(LinkEvent::Change(change)) => {
                        if updates.send(TransportUpdate::Event(change)).is_err() {
                            // Fan-out gone, channel is being torn down
                            return;
                        }
                    }
                    Some(LinkEvent::Dropped(reason)) => {
                        tracing::warn!(channel = %channel_id, %reason, "push link dropped");
                        link = None;
                        advance(&mut state, ConnectionState::Reconnecting, &updates);
                    }
                    None => {
                        tracing::warn!(channel = %channel_id, "push link ended");
                        link = None;
                        advance(&mut state, ConnectionState::Reconnecting, &updates);
                    }
                },
            }
        } else if state.is_terminal() {
            // Stay down until an explicit reconnect
            match commands.recv().await {
                Some(TransportCommand::Reconnect) => {
                    backoff.reset();
                    advance(&mut state, ConnectionState::Connecting, &updates);
                }
                Some(TransportCommand::Close) | None => return,
            }
        } else {
            // Connecting or Reconnecting: dial
            match connector.connect(&topics, &filters).await {
                Ok(l) => {
                    tracing::debug!(channel = %channel_id, "push link established");
                    link = Some(l);
                    backoff.reset();
                    advance(&mut state, ConnectionState::Connected, &updates);
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %channel_id,
                        attempt = backoff.attempts() + 1,
                        error = %e,
                        "connect failed"
                    );

                    match backoff.next_delay() {
                        Some(delay) => {
                            advance(&mut state, ConnectionState::Reconnecting, &updates);

                            let sleep = tokio::time::sleep(delay);
                            tokio::pin!(sleep);

                            // Honor commands while waiting out the delay
                            loop {
                                tokio::select! {
                                    biased;

                                    cmd = commands.recv() => match cmd {
                                        Some(TransportCommand::Reconnect) => {
                                            backoff.reset();
                                            break;
                                        }
                                        Some(TransportCommand::Close) | None => return,
                                    },

                                    _ = &mut sleep => break,
                                }
                            }
                        }
                        None => {
                            tracing::warn!(
                                channel = %channel_id,
                                "retry budget spent, going disconnected"
                            );
                            advance(&mut state, ConnectionState::Disconnected, &updates);
                        }
                    }
                }
            }
        }
    }
}

/// Record and emit a state transition, suppressing no-ops and anything
/// the state machine does not allow
fn advance(
    state: &mut ConnectionState,
    next: ConnectionState,
    updates: &mpsc::UnboundedSender<TransportUpdate>,
) {
    if *state == next {
        return;
    }
    if !state.can_transition(next) {
        tracing::debug!(from = %state, to = %next, "suppressed connection state transition");
        return;
    }
    *state = next;
    let _ = updates.send(TransportUpdate::State(next));
}
