//! livesync - unified data-synchronization engine for live collections
//!
//! Merges three delivery paths (push events, adaptive polling, and
//! on-demand fetches) into one consistent keyed record set per engine
//! instance, while multiplexing identical subscriptions onto shared
//! physical connections.
//!
//! ## Architecture
//!
//! - **Transport**: connection state machine with capped backoff
//! - **Channels**: refcounted dedup of identical subscriptions
//! - **Poller**: surface-aware cadence (visible, focused, active)
//! - **Fetch**: reason-tagged range queries, last-request-wins
//! - **Reconcile**: last-writer-wins merge into the record store
//! - **Engine**: single-task merge loop behind the `SyncEngine` facade

pub mod adapter;
pub mod channel;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event;
pub mod fetch;
pub mod filter;
pub mod metrics;
pub mod poller;
pub mod reconcile;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{ChangeNotice, EngineContext, EngineStatus, SyncEngine};
pub use errors::{EngineError, EngineResult, FetchError};
pub use event::{ChangeEvent, ChangeKind};
pub use fetch::{FetchReason, FetchResult, Fetcher, QueryParams};
pub use reconcile::Record;
pub use transport::ConnectionState;
