//! # WebSocket Connector
//!
//! Production [`Connector`] dialing the portal's realtime endpoint
//! over WebSocket. One frame per topic subscribes the channel; change
//! frames are decoded into [`ChangeEvent`]s and pumped into the
//! transport link until the socket closes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::errors::{EngineError, EngineResult};
use crate::event::{ChangeEvent, ChangeKind};
use crate::filter::FilterExpr;
use crate::transport::{Connector, LinkEvent, TransportLink};

/// Events buffered per link before the pump applies backpressure
const LINK_EVENT_BUFFER: usize = 256;

/// WebSocket connector configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Realtime endpoint, e.g. `wss://portal.example/realtime`
    pub url: String,

    /// Token appended as a `token` query parameter when present
    pub auth_token: Option<String>,

    /// Handshake timeout
    pub connect_timeout: Duration,
}

impl WebSocketConfig {
    /// Configuration for the given endpoint with default timeouts
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Attach an auth token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::new("ws://localhost:4000/realtime")
    }
}

/// Frame sent to the realtime endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    /// Subscribe to one topic, optionally narrowed by a predicate
    Subscribe {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
}

/// Frame received from the realtime endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    /// Subscription acknowledged
    Subscribed { topic: String },

    /// A record changed
    Change {
        topic: String,
        kind: ChangeKind,
        #[serde(default)]
        before: Option<Value>,
        #[serde(default)]
        after: Option<Value>,
        #[serde(default)]
        observed_at: Option<DateTime<Utc>>,
    },

    /// Server keepalive
    Heartbeat {},

    /// Informational message
    System { message: String },

    /// Fatal channel error; the link is dropped
    Error { message: String },
}

/// Production connector for the realtime WebSocket endpoint
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector for the configured endpoint
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Endpoint with the auth token attached when configured
    fn effective_url(&self) -> String {
        match &self.config.auth_token {
            Some(token) => {
                let sep = if self.config.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.config.url, sep, token)
            }
            None => self.config.url.clone(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        topics: &[String],
        filters: &BTreeMap<String, FilterExpr>,
    ) -> EngineResult<TransportLink> {
        let url = self.effective_url();

        let handshake = tokio::time::timeout(self.config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                EngineError::Connection(format!(
                    "handshake timeout after {:?}",
                    self.config.connect_timeout
                ))
            })?;
        let (mut ws, _response) =
            handshake.map_err(|e| EngineError::Connection(format!("handshake failed: {e}")))?;

        for topic in topics {
            let frame = ClientFrame::Subscribe {
                topic: topic.clone(),
                filter: filters.get(topic).map(|f| f.canonical()),
            };
            let payload = serde_json::to_string(&frame)
                .map_err(|e| EngineError::Internal(format!("encode subscribe: {e}")))?;
            ws.send(Message::Text(payload))
                .await
                .map_err(|e| EngineError::Connection(format!("send subscribe: {e}")))?;
        }

        let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = ws.send(Message::Close(None)).await;
                        break;
                    }

                    frame = ws.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(ServerFrame::Change { topic, kind, before, after, observed_at }) => {
                                    let event = ChangeEvent {
                                        topic,
                                        kind,
                                        before,
                                        after,
                                        observed_at: observed_at.unwrap_or_else(Utc::now),
                                    };
                                    if event_tx.send(LinkEvent::Change(event)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(ServerFrame::Error { message }) => {
                                    let _ = event_tx.send(LinkEvent::Dropped(message)).await;
                                    break;
                                }
                                Ok(ServerFrame::Subscribed { topic }) => {
                                    tracing::debug!(%topic, "subscription acknowledged");
                                }
                                Ok(ServerFrame::Heartbeat {}) | Ok(ServerFrame::System { .. }) => {}
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparsable realtime frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = event_tx
                                .send(LinkEvent::Dropped("connection closed".to_string()))
                                .await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = event_tx.send(LinkEvent::Dropped(e.to_string())).await;
                            break;
                        }
                    }
                }
            }
        });

        Ok(TransportLink::new(event_rx, close_tx))
    }
}
