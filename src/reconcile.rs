//! # Record Reconciliation
//!
//! Merges the three delivery paths (push events, poll fetches, manual
//! fetches) into one keyed record set. This is the core of
//! determinism: every datum carries an observation timestamp, and a
//! record entry is only replaced by a datum that is not older than the
//! entry that produced it.
//!
//! # Algorithm
//!
//! 1. Extract the record id from the datum body (string or integer)
//! 2. Compare the datum timestamp against the entry's `last_applied_at`
//! 3. Apply if not older; drop silently (but counted) if stale
//! 4. Report the set of changed ids so callers re-render once per batch
//!
//! Fetches only upsert: a record absent from a fetch result is never
//! removed, since a fetch is a range query and not a full snapshot of
//! the subscription.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::event::{ChangeEvent, ChangeKind};
use crate::fetch::FetchResult;

/// A reconciled record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Stable record id, stringified
    pub id: String,

    /// Record body as delivered by the backend
    pub payload: Value,

    /// Timestamp of the datum that produced the current value.
    /// Maintained by the reconciler, never read from the payload.
    pub last_applied_at: DateTime<Utc>,
}

impl Record {
    /// Build a record entry
    pub fn new(id: impl Into<String>, payload: Value, last_applied_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload,
            last_applied_at,
        }
    }
}

/// Outcome of one merge call, coalesced per batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Ids whose visible value changed
    pub changed: BTreeSet<String>,

    /// Data dropped because the existing entry was newer
    pub stale_dropped: u64,

    /// Data skipped because no usable id could be extracted
    pub missing_id: u64,
}

impl MergeReport {
    /// Whether anything visible changed
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Keyed record set with last-writer-wins-by-timestamp merges.
///
/// Kept in a `BTreeMap` so [`RecordStore::records`] returns a
/// deterministic id-ordered view regardless of arrival order.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<String, Record>,
}

impl RecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load records wholesale, e.g. from a cached snapshot
    pub fn seed(&mut self, records: Vec<Record>) {
        for record in records {
            self.records.insert(record.id.clone(), record);
        }
    }

    /// Merge one push event.
    ///
    /// INSERT and UPDATE upsert the `after` body; DELETE removes the
    /// id unless the existing entry is strictly newer than the event.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> MergeReport {
        let mut report = MergeReport::default();

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(after) = event.after.as_ref() else {
                    report.missing_id += 1;
                    return report;
                };
                let id = match record_id(after)
                    .or_else(|| event.before.as_ref().and_then(record_id))
                {
                    Some(id) => id,
                    None => {
                        report.missing_id += 1;
                        return report;
                    }
                };

                self.upsert(id, after, event.observed_at, &mut report);
            }
            ChangeKind::Delete => {
                let id = match event.record_body().and_then(record_id) {
                    Some(id) => id,
                    None => {
                        report.missing_id += 1;
                        return report;
                    }
                };

                match self.records.get(&id) {
                    // A delete not older than the entry removes it
                    Some(existing) if existing.last_applied_at > event.observed_at => {
                        report.stale_dropped += 1;
                    }
                    Some(_) => {
                        self.records.remove(&id);
                        report.changed.insert(id);
                    }
                    // Deleting an id we never saw is a no-op
                    None => {}
                }
            }
        }

        report
    }

    /// Merge one fetch result.
    ///
    /// Every returned record is stamped with the fetch time. An entry
    /// produced by a newer datum than the fetch survives untouched, so
    /// a slow fetch can only fill gaps, never roll records back.
    pub fn apply_fetch(&mut self, result: &FetchResult) -> MergeReport {
        let mut report = MergeReport::default();

        for payload in &result.records {
            let Some(id) = record_id(payload) else {
                report.missing_id += 1;
                continue;
            };

            self.upsert(id, payload, result.fetched_at, &mut report);
        }

        report
    }

    fn upsert(&mut self, id: String, payload: &Value, at: DateTime<Utc>, report: &mut MergeReport) {
        match self.records.get_mut(&id) {
            Some(existing) if existing.last_applied_at > at => {
                report.stale_dropped += 1;
            }
            Some(existing) => {
                // Equal timestamps re-apply, keeping merges idempotent
                if existing.payload == *payload {
                    existing.last_applied_at = at;
                } else {
                    existing.payload = payload.clone();
                    existing.last_applied_at = at;
                    report.changed.insert(id);
                }
            }
            None => {
                self.records
                    .insert(id.clone(), Record::new(id.clone(), payload.clone(), at));
                report.changed.insert(id);
            }
        }
    }

    /// Record for one id
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// All records, ordered by id
    pub fn records(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Extract the stable record id from a body. The backend emits both
/// string and integer ids; both stringify to the same key space.
pub fn record_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
