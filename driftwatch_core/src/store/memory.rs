use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ApplyStats, ReapStats, SnapshotStore, ensure_batch_type};
use crate::diff::diff;
use crate::models::{
    CanonicalRecord, HistoryRow, ListQuery, SnapshotRow, SyncRun, SyncRunQuery,
};
use crate::Result;

/// In-memory SnapshotStore for local development and unit tests.
///
/// Batch atomicity is provided by mutating a staged clone of the state
/// and swapping it in only once the whole batch has applied cleanly.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone, Default)]
struct Inner {
    snapshots: HashMap<(String, String), SnapshotRow>,
    history: Vec<HistoryRow>,
    runs: Vec<SyncRun>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn apply_batch(
        &self,
        resource_type: &str,
        records: &[CanonicalRecord],
    ) -> Result<ApplyStats> {
        ensure_batch_type(resource_type, records)?;

        let mut inner = self.inner.lock().await;
        let mut staged = inner.clone();
        let mut stats = ApplyStats::default();

        for rec in records {
            let key = (resource_type.to_string(), rec.resource_id.clone());
            let old = staged.snapshots.get(&key).cloned();
            let outcome = diff(old.as_ref(), rec);

            match old {
                None => {
                    staged.snapshots.insert(
                        key,
                        SnapshotRow {
                            resource_type: resource_type.to_string(),
                            resource_id: rec.resource_id.clone(),
                            fields: rec.fields.clone(),
                            collected_at: rec.collected_at,
                            first_collected_at: rec.collected_at,
                        },
                    );
                    staged.history.push(open_history(rec, rec.collected_at));
                    stats.new += 1;
                }
                Some(old) if outcome.is_changed() => {
                    let first_collected_at = old.first_collected_at;
                    staged.snapshots.insert(
                        key,
                        SnapshotRow {
                            resource_type: resource_type.to_string(),
                            resource_id: rec.resource_id.clone(),
                            fields: rec.fields.clone(),
                            collected_at: rec.collected_at,
                            first_collected_at,
                        },
                    );
                    close_open(&mut staged.history, resource_type, &rec.resource_id, rec.collected_at);
                    staged.history.push(open_history(rec, first_collected_at));
                    stats.changed += 1;
                }
                Some(old) => {
                    staged.snapshots.insert(
                        key,
                        SnapshotRow {
                            collected_at: rec.collected_at,
                            ..old
                        },
                    );
                    stats.unchanged += 1;
                }
            }
        }

        *inner = staged;
        Ok(stats)
    }

    async fn reap_stale(
        &self,
        resource_type: &str,
        run_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReapStats> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .snapshots
            .values()
            .filter(|s| s.resource_type == resource_type && s.collected_at < run_started_at)
            .map(|s| s.resource_id.clone())
            .collect();

        for resource_id in &stale {
            close_open(&mut inner.history, resource_type, resource_id, now);
            inner
                .snapshots
                .remove(&(resource_type.to_string(), resource_id.clone()));
        }
        Ok(ReapStats {
            reaped: stale.len() as u64,
        })
    }

    async fn get_snapshot(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<SnapshotRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .get(&(resource_type.to_string(), resource_id.to_string()))
            .cloned())
    }

    async fn list_snapshots(
        &self,
        resource_type: &str,
        query: ListQuery,
    ) -> Result<Vec<SnapshotRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SnapshotRow> = inner
            .snapshots
            .values()
            .filter(|s| s.resource_type == resource_type)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn list_history(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<HistoryRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<HistoryRow> = inner
            .history
            .iter()
            .filter(|h| h.resource_type == resource_type && h.resource_id == resource_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.valid_from);
        Ok(rows)
    }

    async fn history_as_of(
        &self,
        resource_type: &str,
        resource_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryRow>> {
        let rows = self.list_history(resource_type, resource_id).await?;
        Ok(rows
            .into_iter()
            .filter(|h| h.valid_from <= at && h.valid_to.map(|to| to > at).unwrap_or(true))
            .next_back())
    }

    async fn record_run(&self, run: &SyncRun) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            *existing = run.clone();
        } else {
            inner.runs.push(run.clone());
        }
        Ok(())
    }

    async fn list_runs(&self, query: SyncRunQuery) -> Result<Vec<SyncRun>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<SyncRun> = inner
            .runs
            .iter()
            .filter(|r| {
                query
                    .resource_type
                    .as_ref()
                    .map(|rt| &r.resource_type == rt)
                    .unwrap_or(true)
                    && query.status.map(|s| r.status == s).unwrap_or(true)
                    && query.since.map(|s| r.started_at >= s).unwrap_or(true)
                    && query.until.map(|u| r.started_at <= u).unwrap_or(true)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

fn open_history(rec: &CanonicalRecord, first_collected_at: DateTime<Utc>) -> HistoryRow {
    HistoryRow {
        id: Uuid::new_v4(),
        resource_type: rec.resource_type.clone(),
        resource_id: rec.resource_id.clone(),
        fields: rec.fields.clone(),
        valid_from: rec.collected_at,
        valid_to: None,
        collected_at: rec.collected_at,
        first_collected_at,
    }
}

fn close_open(
    history: &mut [HistoryRow],
    resource_type: &str,
    resource_id: &str,
    at: DateTime<Utc>,
) {
    for row in history.iter_mut() {
        if row.resource_type == resource_type
            && row.resource_id == resource_id
            && row.valid_to.is_none()
        {
            row.valid_to = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn record(id: &str, name: &str, collected_at: DateTime<Utc>) -> CanonicalRecord {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Text(name.to_string()));
        CanonicalRecord::new("server", id, fields, collected_at).unwrap()
    }

    #[tokio::test]
    async fn open_interval_invariant_holds_across_changes() {
        let store = MemorySnapshotStore::new();
        let t = Utc::now();
        for (i, name) in ["a", "b", "c", "c", "d"].iter().enumerate() {
            store
                .apply_batch(
                    "server",
                    &[record("srv-1", name, t + Duration::minutes(i as i64))],
                )
                .await
                .unwrap();
        }
        let history = store.list_history("server", "srv-1").await.unwrap();
        let open = history.iter().filter(|h| h.valid_to.is_none()).count();
        assert_eq!(open, 1);
        // a -> b -> c -> d: four versions, "c" repeated did not append.
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_writes() {
        let store = MemorySnapshotStore::new();
        let t = Utc::now();
        // Second record's type mismatches the batch; nothing must land.
        let good = record("srv-1", "x", t);
        let mut bad = record("srv-2", "y", t);
        bad.resource_type = "volume".to_string();

        let err = store.apply_batch("server", &[good, bad]).await;
        assert!(err.is_err());
        assert!(store.get_snapshot("server", "srv-1").await.unwrap().is_none());
        assert!(store.list_history("server", "srv-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_listing_pages_with_limit_and_offset() {
        let store = MemorySnapshotStore::new();
        let t = Utc::now();
        for i in 0..3 {
            let run = SyncRun::new_running("server", "proj-1", 1, t + Duration::minutes(i))
                .unwrap();
            store.record_run(&run).await.unwrap();
        }

        let query = SyncRunQuery {
            limit: 1,
            offset: 1,
            ..Default::default()
        };
        let runs = store.list_runs(query).await.unwrap();
        assert_eq!(runs.len(), 1);
        // Newest first; offset 1 lands on the middle run.
        assert_eq!(runs[0].started_at, t + Duration::minutes(1));
    }

    #[tokio::test]
    async fn reap_only_touches_the_requested_resource_type() {
        let store = MemorySnapshotStore::new();
        let t1 = Utc::now();
        store.apply_batch("server", &[record("srv-1", "x", t1)]).await.unwrap();

        let mut vol = record("vol-1", "x", t1);
        vol.resource_type = "volume".to_string();
        store.apply_batch("volume", &[vol]).await.unwrap();

        let later = t1 + Duration::minutes(1);
        let stats = store
            .reap_stale("server", later, later + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stats.reaped, 1);
        assert!(store.get_snapshot("volume", "vol-1").await.unwrap().is_some());
    }
}
