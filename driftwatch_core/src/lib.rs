//! Resource snapshot & history engine.
//!
//! Pulls inventories of external resources through paginated sources,
//! diffs them against the last known state, upserts a current-state
//! snapshot table and maintains an append-only SCD2 history with
//! tombstoning of resources no longer observed.

pub mod diff;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod models;
pub mod retry;
pub mod schedule;
pub mod store;

pub use diff::diff;
pub use engine::{FetchContext, SyncEngine, SyncReport, SyncUnit, UnitConfig};
pub use error::{Error, Result};
pub use fetch::{Heartbeat, Page, PageCursor, PageSource, fetch_all};
pub use models::{
    CanonicalRecord, ConversionPolicy, DiffResult, FieldValue, HistoryRow, ListQuery,
    ScopeConfig, SnapshotRow, SyncRun, SyncRunQuery, SyncRunStatus,
};
pub use retry::RetryPolicy;
pub use schedule::{SyncScheduler, UnitSchedule};
pub use store::{ApplyStats, MemorySnapshotStore, ReapStats, SnapshotStore, SqliteSnapshotStore};
