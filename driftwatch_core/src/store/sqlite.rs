//! SQLite-backed SnapshotStore implementation.
//!
//! Single WAL-mode SQLite file. Suitable for single-node deployments
//! and local development; timestamps are stored as RFC 3339 TEXT and
//! field maps as JSON TEXT.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{ApplyStats, ReapStats, SnapshotStore, ensure_batch_type};
use crate::diff::diff;
use crate::models::{
    CanonicalRecord, FieldValue, HistoryRow, ListQuery, SnapshotRow, SyncRun, SyncRunQuery,
    SyncRunStatus,
};
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// Create (or open) the store at the given file path. Creates the
    /// file and parent directories if missing and runs the internal
    /// schema migration on startup.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_snapshot_store mkdir", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_snapshot_store connect options", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
  resource_type TEXT NOT NULL,
  resource_id TEXT NOT NULL,
  fields TEXT NOT NULL,
  collected_at TEXT NOT NULL,
  first_collected_at TEXT NOT NULL,
  PRIMARY KEY (resource_type, resource_id)
);
CREATE INDEX IF NOT EXISTS snapshots_type_collected_idx
  ON snapshots(resource_type, collected_at);

CREATE TABLE IF NOT EXISTS history (
  id TEXT PRIMARY KEY,
  resource_type TEXT NOT NULL,
  resource_id TEXT NOT NULL,
  fields TEXT NOT NULL,
  valid_from TEXT NOT NULL,
  valid_to TEXT NULL,
  collected_at TEXT NOT NULL,
  first_collected_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS history_identity_idx
  ON history(resource_type, resource_id, valid_from);
-- Enforces the open-interval invariant at the storage layer: at most
-- one row with valid_to IS NULL per resource identity.
CREATE UNIQUE INDEX IF NOT EXISTS history_open_idx
  ON history(resource_type, resource_id) WHERE valid_to IS NULL;

CREATE TABLE IF NOT EXISTS sync_runs (
  run_id TEXT PRIMARY KEY,
  resource_type TEXT NOT NULL,
  scope TEXT NOT NULL,
  status TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT NULL,
  attempt INTEGER NOT NULL,
  records_fetched INTEGER NOT NULL,
  records_skipped INTEGER NOT NULL,
  new_count INTEGER NOT NULL,
  changed_count INTEGER NOT NULL,
  unchanged_count INTEGER NOT NULL,
  reaped_count INTEGER NOT NULL,
  error_message TEXT NULL
);
CREATE INDEX IF NOT EXISTS sync_runs_type_started_idx
  ON sync_runs(resource_type, started_at DESC);
"#;

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    #[tracing::instrument(level = "debug", skip(self, records), fields(batch = records.len()))]
    async fn apply_batch(
        &self,
        resource_type: &str,
        records: &[CanonicalRecord],
    ) -> Result<ApplyStats> {
        ensure_batch_type(resource_type, records)?;

        // Transaction rolls back on drop unless committed; commit only
        // happens on the success path below.
        let mut tx = self.pool.begin().await?;
        let mut stats = ApplyStats::default();

        for rec in records {
            let row = sqlx::query(
                r#"
SELECT resource_type, resource_id, fields, collected_at, first_collected_at
FROM snapshots
WHERE resource_type = ?1 AND resource_id = ?2
"#,
            )
            .bind(resource_type)
            .bind(&rec.resource_id)
            .fetch_optional(&mut *tx)
            .await?;
            let old = row.as_ref().map(snapshot_from_row).transpose()?;

            let outcome = diff(old.as_ref(), rec);
            let fields_json = encode_fields(&rec.fields)?;
            let collected = rec.collected_at.to_rfc3339();

            match old {
                None => {
                    sqlx::query(
                        r#"
INSERT INTO snapshots (resource_type, resource_id, fields, collected_at, first_collected_at)
VALUES (?1, ?2, ?3, ?4, ?4)
"#,
                    )
                    .bind(resource_type)
                    .bind(&rec.resource_id)
                    .bind(&fields_json)
                    .bind(&collected)
                    .execute(&mut *tx)
                    .await?;

                    insert_open_history(&mut tx, rec, &fields_json, rec.collected_at).await?;
                    stats.new += 1;
                }
                Some(old) if outcome.is_changed() => {
                    // first_collected_at is deliberately left untouched.
                    sqlx::query(
                        r#"
UPDATE snapshots SET fields = ?3, collected_at = ?4
WHERE resource_type = ?1 AND resource_id = ?2
"#,
                    )
                    .bind(resource_type)
                    .bind(&rec.resource_id)
                    .bind(&fields_json)
                    .bind(&collected)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query(
                        r#"
UPDATE history SET valid_to = ?3
WHERE resource_type = ?1 AND resource_id = ?2 AND valid_to IS NULL
"#,
                    )
                    .bind(resource_type)
                    .bind(&rec.resource_id)
                    .bind(&collected)
                    .execute(&mut *tx)
                    .await?;

                    insert_open_history(&mut tx, rec, &fields_json, old.first_collected_at)
                        .await?;
                    stats.changed += 1;
                }
                Some(_) => {
                    // Liveness touch only.
                    sqlx::query(
                        r#"
UPDATE snapshots SET collected_at = ?3
WHERE resource_type = ?1 AND resource_id = ?2
"#,
                    )
                    .bind(resource_type)
                    .bind(&rec.resource_id)
                    .bind(&collected)
                    .execute(&mut *tx)
                    .await?;
                    stats.unchanged += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reap_stale(
        &self,
        resource_type: &str,
        run_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReapStats> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
SELECT resource_id FROM snapshots
WHERE resource_type = ?1 AND collected_at < ?2
"#,
        )
        .bind(resource_type)
        .bind(run_started_at.to_rfc3339())
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = 0u64;
        for row in rows {
            let resource_id: String = row.get("resource_id");

            sqlx::query(
                r#"
UPDATE history SET valid_to = ?3
WHERE resource_type = ?1 AND resource_id = ?2 AND valid_to IS NULL
"#,
            )
            .bind(resource_type)
            .bind(&resource_id)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "DELETE FROM snapshots WHERE resource_type = ?1 AND resource_id = ?2",
            )
            .bind(resource_type)
            .bind(&resource_id)
            .execute(&mut *tx)
            .await?;
            reaped += 1;
        }

        tx.commit().await?;
        Ok(ReapStats { reaped })
    }

    async fn get_snapshot(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<SnapshotRow>> {
        let row = sqlx::query(
            r#"
SELECT resource_type, resource_id, fields, collected_at, first_collected_at
FROM snapshots
WHERE resource_type = ?1 AND resource_id = ?2
"#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(
        &self,
        resource_type: &str,
        query: ListQuery,
    ) -> Result<Vec<SnapshotRow>> {
        let rows = sqlx::query(
            r#"
SELECT resource_type, resource_id, fields, collected_at, first_collected_at
FROM snapshots
WHERE resource_type = ?1
ORDER BY resource_id ASC
LIMIT ?2 OFFSET ?3
"#,
        )
        .bind(resource_type)
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn list_history(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<HistoryRow>> {
        let rows = sqlx::query(
            r#"
SELECT id, resource_type, resource_id, fields, valid_from, valid_to, collected_at, first_collected_at
FROM history
WHERE resource_type = ?1 AND resource_id = ?2
ORDER BY valid_from ASC
"#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn history_as_of(
        &self,
        resource_type: &str,
        resource_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryRow>> {
        let at = at.to_rfc3339();
        let row = sqlx::query(
            r#"
SELECT id, resource_type, resource_id, fields, valid_from, valid_to, collected_at, first_collected_at
FROM history
WHERE resource_type = ?1 AND resource_id = ?2
  AND valid_from <= ?3
  AND (valid_to IS NULL OR valid_to > ?3)
ORDER BY valid_from DESC
LIMIT 1
"#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(&at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn record_run(&self, run: &SyncRun) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO sync_runs
  (run_id, resource_type, scope, status, started_at, finished_at, attempt,
   records_fetched, records_skipped, new_count, changed_count, unchanged_count,
   reaped_count, error_message)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
ON CONFLICT(run_id) DO UPDATE SET
  status = excluded.status,
  finished_at = excluded.finished_at,
  attempt = excluded.attempt,
  records_fetched = excluded.records_fetched,
  records_skipped = excluded.records_skipped,
  new_count = excluded.new_count,
  changed_count = excluded.changed_count,
  unchanged_count = excluded.unchanged_count,
  reaped_count = excluded.reaped_count,
  error_message = excluded.error_message
"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.resource_type)
        .bind(&run.scope)
        .bind(status_to_str(run.status))
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.map(|d| d.to_rfc3339()))
        .bind(run.attempt as i64)
        .bind(run.records_fetched as i64)
        .bind(run.records_skipped as i64)
        .bind(run.new_count as i64)
        .bind(run.changed_count as i64)
        .bind(run.unchanged_count as i64)
        .bind(run.reaped_count as i64)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, query: SyncRunQuery) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
SELECT run_id, resource_type, scope, status, started_at, finished_at, attempt,
       records_fetched, records_skipped, new_count, changed_count, unchanged_count,
       reaped_count, error_message
FROM sync_runs
ORDER BY started_at DESC
"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matched = 0usize;
        let mut out = Vec::new();
        for row in rows {
            let run = run_from_row(&row)?;
            if let Some(rt) = &query.resource_type {
                if &run.resource_type != rt {
                    continue;
                }
            }
            if let Some(status) = query.status {
                if run.status != status {
                    continue;
                }
            }
            if let Some(since) = query.since {
                if run.started_at < since {
                    continue;
                }
            }
            if let Some(until) = query.until {
                if run.started_at > until {
                    continue;
                }
            }
            // Offset counts matching rows, not raw rows.
            matched += 1;
            if matched <= query.offset {
                continue;
            }
            out.push(run);
            if out.len() >= query.limit {
                break;
            }
        }
        Ok(out)
    }
}

async fn insert_open_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    rec: &CanonicalRecord,
    fields_json: &str,
    first_collected_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
INSERT INTO history
  (id, resource_type, resource_id, fields, valid_from, valid_to, collected_at, first_collected_at)
VALUES
  (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)
"#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&rec.resource_type)
    .bind(&rec.resource_id)
    .bind(fields_json)
    .bind(rec.collected_at.to_rfc3339())
    .bind(rec.collected_at.to_rfc3339())
    .bind(first_collected_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn encode_fields(fields: &BTreeMap<String, FieldValue>) -> Result<String> {
    serde_json::to_string(fields).map_err(|e| Error::backend("serialize fields", e))
}

fn decode_fields(s: &str) -> Result<BTreeMap<String, FieldValue>> {
    serde_json::from_str(s).map_err(|e| Error::backend("decode fields", e))
}

fn snapshot_from_row(row: &SqliteRow) -> Result<SnapshotRow> {
    let fields: String = row.get("fields");
    Ok(SnapshotRow {
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        fields: decode_fields(&fields)?,
        collected_at: parse_dt(row.get::<String, _>("collected_at").as_str())?,
        first_collected_at: parse_dt(row.get::<String, _>("first_collected_at").as_str())?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryRow> {
    let fields: String = row.get("fields");
    let valid_to: Option<String> = row.get("valid_to");
    let id: String = row.get("id");
    Ok(HistoryRow {
        id: Uuid::parse_str(&id).map_err(|e| Error::backend("parse history id", e))?,
        resource_type: row.get("resource_type"),
        resource_id: row.get("resource_id"),
        fields: decode_fields(&fields)?,
        valid_from: parse_dt(row.get::<String, _>("valid_from").as_str())?,
        valid_to: valid_to.as_deref().map(parse_dt).transpose()?,
        collected_at: parse_dt(row.get::<String, _>("collected_at").as_str())?,
        first_collected_at: parse_dt(row.get::<String, _>("first_collected_at").as_str())?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<SyncRun> {
    let run_id: String = row.get("run_id");
    let finished_at: Option<String> = row.get("finished_at");
    Ok(SyncRun {
        run_id: Uuid::parse_str(&run_id).map_err(|e| Error::backend("parse run id", e))?,
        resource_type: row.get("resource_type"),
        scope: row.get("scope"),
        status: status_from_str(row.get::<String, _>("status").as_str())?,
        started_at: parse_dt(row.get::<String, _>("started_at").as_str())?,
        finished_at: finished_at.as_deref().map(parse_dt).transpose()?,
        attempt: row.get::<i64, _>("attempt").max(1) as u32,
        records_fetched: row.get::<i64, _>("records_fetched").max(0) as u64,
        records_skipped: row.get::<i64, _>("records_skipped").max(0) as u64,
        new_count: row.get::<i64, _>("new_count").max(0) as u64,
        changed_count: row.get::<i64, _>("changed_count").max(0) as u64,
        unchanged_count: row.get::<i64, _>("unchanged_count").max(0) as u64,
        reaped_count: row.get::<i64, _>("reaped_count").max(0) as u64,
        error_message: row.get("error_message"),
    })
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::backend("parse datetime", e))
}

fn status_to_str(v: SyncRunStatus) -> &'static str {
    match v {
        SyncRunStatus::Running => "running",
        SyncRunStatus::Succeeded => "succeeded",
        SyncRunStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> Result<SyncRunStatus> {
    match s {
        "running" => Ok(SyncRunStatus::Running),
        "succeeded" => Ok(SyncRunStatus::Succeeded),
        "failed" => Ok(SyncRunStatus::Failed),
        _ => Err(Error::BackendMessage(format!("unknown run status: {s}"))),
    }
}
