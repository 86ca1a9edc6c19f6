//! # Change Events
//!
//! Change notifications delivered by the push transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// New record inserted
    Insert,
    /// Existing record updated
    Update,
    /// Record deleted
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A change notification for a single record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Topic the change belongs to
    pub topic: String,

    /// Kind of change
    pub kind: ChangeKind,

    /// Record body before the change (for UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,

    /// Record body after the change (for INSERT/UPDATE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,

    /// When the engine observed the change
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an INSERT event
    pub fn insert(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            kind: ChangeKind::Insert,
            before: None,
            after: Some(data),
            observed_at: Utc::now(),
        }
    }

    /// Create an UPDATE event
    pub fn update(topic: impl Into<String>, before: Value, after: Value) -> Self {
        Self {
            topic: topic.into(),
            kind: ChangeKind::Update,
            before: Some(before),
            after: Some(after),
            observed_at: Utc::now(),
        }
    }

    /// Create a DELETE event
    pub fn delete(topic: impl Into<String>, before: Value) -> Self {
        Self {
            topic: topic.into(),
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
            observed_at: Utc::now(),
        }
    }

    /// Pin the observation timestamp (defaults to now)
    pub fn observed(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// Record body carrying this change: `after` for INSERT/UPDATE,
    /// `before` for DELETE, with fallback when the preferred side is
    /// missing.
    pub fn record_body(&self) -> Option<&Value> {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                self.after.as_ref().or(self.before.as_ref())
            }
            ChangeKind::Delete => self.before.as_ref().or(self.after.as_ref()),
        }
    }
}
