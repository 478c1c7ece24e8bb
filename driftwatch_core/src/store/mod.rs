//! Snapshot/history persistence.
//!
//! The SCD2 algorithm lives inside the store implementations so that
//! atomicity is owned by the transaction boundary: `apply_batch` is
//! all-or-nothing per batch, `reap_stale` runs in its own transaction.

mod memory;
mod sqlite;

pub use memory::MemorySnapshotStore;
pub use sqlite::SqliteSnapshotStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CanonicalRecord, HistoryRow, ListQuery, SnapshotRow, SyncRun, SyncRunQuery,
};
use crate::{Error, Result};

/// Counts from one `apply_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyStats {
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
}

/// Counts from one `reap_stale` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReapStats {
    pub reaped: u64,
}

/// Transactional current-state + history store for one or more
/// resource types. Each resource type owns its identity namespace, so
/// concurrent units of different types never conflict.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Apply one run's canonical records for `resource_type`:
    /// unchanged rows get a `collected_at` touch, new rows get a
    /// snapshot plus an open history interval, changed rows get an
    /// in-place snapshot update plus a close-and-append on history.
    /// Atomic: a failure leaves no partial writes visible.
    async fn apply_batch(
        &self,
        resource_type: &str,
        records: &[CanonicalRecord],
    ) -> Result<ApplyStats>;

    /// Tombstone snapshots not observed in the current run
    /// (`collected_at` strictly older than `run_started_at`): close
    /// their open history interval at `now` and delete the snapshot.
    async fn reap_stale(
        &self,
        resource_type: &str,
        run_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReapStats>;

    /// Absence is not an error.
    async fn get_snapshot(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<SnapshotRow>>;

    async fn list_snapshots(
        &self,
        resource_type: &str,
        query: ListQuery,
    ) -> Result<Vec<SnapshotRow>>;

    /// All versions for one identity, oldest first.
    async fn list_history(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<HistoryRow>>;

    /// The version whose validity interval contains `at`, if any.
    async fn history_as_of(
        &self,
        resource_type: &str,
        resource_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryRow>>;

    /// Insert or update a durable run record by `run_id`.
    async fn record_run(&self, run: &SyncRun) -> Result<()>;

    /// Most recent first.
    async fn list_runs(&self, query: SyncRunQuery) -> Result<Vec<SyncRun>>;
}

/// Every record in a batch must belong to the batch's resource type.
pub(crate) fn ensure_batch_type(resource_type: &str, records: &[CanonicalRecord]) -> Result<()> {
    if resource_type.trim().is_empty() {
        return Err(Error::InvalidInput("resource_type is empty".to_string()));
    }
    for rec in records {
        if rec.resource_type != resource_type {
            return Err(Error::InvalidInput(format!(
                "record '{}' has resource_type '{}', batch is '{}'",
                rec.resource_id, rec.resource_type, resource_type
            )));
        }
    }
    Ok(())
}
