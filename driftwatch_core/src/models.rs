use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// One typed field of a canonical record.
///
/// `Blob` holds an opaque pre-serialized JSON string; the engine never
/// interprets it and compares it byte-for-byte. `Keyed` is a
/// sub-collection keyed by a stable sub-identity (e.g. backends of a
/// load-balanced service); each member value is an opaque blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Blob(String),
    Keyed(BTreeMap<String, String>),
}

impl FieldValue {
    /// Serialize a nested structure into an opaque blob.
    pub fn blob<T: Serialize>(value: &T) -> Result<Self> {
        let s = serde_json::to_string(value)
            .map_err(|e| Error::backend("serialize field blob", e))?;
        Ok(Self::Blob(s))
    }

    /// Serialize a keyed sub-collection; keys must be stable
    /// sub-identities, never mutable attributes.
    pub fn keyed<T: Serialize>(
        members: impl IntoIterator<Item = (String, T)>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (key, member) in members {
            if key.trim().is_empty() {
                return Err(Error::InvalidInput("keyed member key is empty".to_string()));
            }
            let s = serde_json::to_string(&member)
                .map_err(|e| Error::backend("serialize keyed member", e))?;
            map.insert(key, s);
        }
        Ok(Self::Keyed(map))
    }

    /// Nullable text helper: `None` becomes `Null`.
    pub fn opt_text(value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => Self::Text(v.into()),
            None => Self::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// The converted form of one external resource for the current run.
///
/// Ephemeral: recomputed every run, never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub resource_type: String,
    /// Stable identifier, globally unique within its resource type.
    /// Must derive from stable identifying fields of the raw record.
    pub resource_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Timestamp of the run that observed this record.
    pub collected_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        fields: BTreeMap<String, FieldValue>,
        collected_at: DateTime<Utc>,
    ) -> Result<Self> {
        let resource_type = resource_type.into();
        if resource_type.trim().is_empty() {
            return Err(Error::InvalidInput("resource_type is empty".to_string()));
        }
        let resource_id = resource_id.into();
        if resource_id.trim().is_empty() {
            return Err(Error::InvalidInput("resource_id is empty".to_string()));
        }
        Ok(Self {
            resource_type,
            resource_id,
            fields,
            collected_at,
        })
    }
}

/// Persisted current state: exactly one row per live resource identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub resource_type: String,
    pub resource_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Last run that observed this resource.
    pub collected_at: DateTime<Utc>,
    /// Set once at creation, never mutated afterwards.
    pub first_collected_at: DateTime<Utc>,
}

/// One version of a resource in the append-only SCD2 history.
///
/// `valid_to == None` marks the open interval: the currently-active
/// version. At most one open row exists per resource identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    /// Carried forward unchanged across all versions of the resource.
    pub first_collected_at: DateTime<Utc>,
}

/// Transient classification of a canonical record against the stored
/// snapshot. Computed fresh each run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffResult {
    pub is_new: bool,
    /// Field names that differ from the stored snapshot.
    pub changed_fields: Vec<String>,
}

impl DiffResult {
    pub fn is_changed(&self) -> bool {
        !self.changed_fields.is_empty()
    }

    pub fn is_unchanged(&self) -> bool {
        !self.is_new && self.changed_fields.is_empty()
    }
}

/// Source scope passed to fetch and convert: which account / project /
/// zone the unit is pulling, plus connector-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Scope identifier in the external system, e.g. a project or zone id.
    pub scope: String,
    /// Opaque page size forwarded to the source.
    pub page_size: u32,
    /// Connector-specific configuration blob (filters, endpoints, etc.).
    pub settings: serde_json::Value,
}

impl ScopeConfig {
    pub fn new(
        scope: impl Into<String>,
        page_size: u32,
        settings: serde_json::Value,
    ) -> Result<Self> {
        let scope = scope.into();
        if scope.trim().is_empty() {
            return Err(Error::InvalidInput("scope is empty".to_string()));
        }
        if page_size == 0 {
            return Err(Error::InvalidInput("page_size must be > 0".to_string()));
        }
        Ok(Self {
            scope,
            page_size,
            settings,
        })
    }
}

/// What to do when converting a single raw record fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPolicy {
    /// Skip the offending record, log a warning, continue the run.
    #[default]
    SkipAndLog,
    /// Abort the whole unit on the first bad record.
    FailRun,
}

/// Paging parameters for list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Succeeded,
    Failed,
}

/// A single sync execution record (durable, queryable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub resource_type: String,
    pub scope: String,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub records_fetched: u64,
    pub records_skipped: u64,
    pub new_count: u64,
    pub changed_count: u64,
    pub unchanged_count: u64,
    pub reaped_count: u64,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub fn new_running(
        resource_type: impl Into<String>,
        scope: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let resource_type = resource_type.into();
        if resource_type.trim().is_empty() {
            return Err(Error::InvalidInput("resource_type is empty".to_string()));
        }
        let scope = scope.into();
        if scope.trim().is_empty() {
            return Err(Error::InvalidInput("scope is empty".to_string()));
        }
        if attempt == 0 {
            return Err(Error::InvalidInput("attempt must be >= 1".to_string()));
        }
        Ok(Self {
            run_id: Uuid::new_v4(),
            resource_type,
            scope,
            status: SyncRunStatus::Running,
            started_at,
            finished_at: None,
            attempt,
            records_fetched: 0,
            records_skipped: 0,
            new_count: 0,
            changed_count: 0,
            unchanged_count: 0,
            reaped_count: 0,
            error_message: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunQuery {
    pub resource_type: Option<String>,
    pub status: Option<SyncRunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SyncRunQuery {
    fn default() -> Self {
        Self {
            resource_type: None,
            status: None,
            since: None,
            until: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_record_rejects_empty_identity() {
        let err = CanonicalRecord::new("", "abc", BTreeMap::new(), Utc::now());
        assert!(matches!(err, Err(Error::InvalidInput(_))));
        let err = CanonicalRecord::new("server", "  ", BTreeMap::new(), Utc::now());
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn blob_is_deterministic_for_equal_values() {
        #[derive(Serialize)]
        struct Nested {
            a: u32,
            b: Vec<&'static str>,
        }
        let one = FieldValue::blob(&Nested {
            a: 1,
            b: vec!["x", "y"],
        })
        .unwrap();
        let two = FieldValue::blob(&Nested {
            a: 1,
            b: vec!["x", "y"],
        })
        .unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn keyed_rejects_empty_member_key() {
        let err = FieldValue::keyed(vec![(String::new(), 1u32)]);
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn scope_config_requires_positive_page_size() {
        let err = ScopeConfig::new("proj-1", 0, serde_json::json!({}));
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }
}
