//! Structural differencer: canonical record vs. stored snapshot.
//!
//! Pure comparison over tracked fields only. `collected_at` and
//! `first_collected_at` are bookkeeping, not resource state; they live
//! outside the field map and are never compared here.

use std::collections::BTreeSet;

use crate::models::{CanonicalRecord, DiffResult, FieldValue, SnapshotRow};

/// Classify `new` against the previously persisted state.
///
/// A field present on one side and absent on the other is compared as
/// `Null` on the absent side: both-null is equal, one-null-one-set is
/// unequal. Blobs compare byte-for-byte on their serialized form;
/// keyed sub-collections compare by size and per-member equality.
pub fn diff(old: Option<&SnapshotRow>, new: &CanonicalRecord) -> DiffResult {
    let Some(old) = old else {
        return DiffResult {
            is_new: true,
            changed_fields: Vec::new(),
        };
    };

    let keys: BTreeSet<&String> = old.fields.keys().chain(new.fields.keys()).collect();
    let mut changed_fields = Vec::new();
    for key in keys {
        let old_value = old.fields.get(key).unwrap_or(&FieldValue::Null);
        let new_value = new.fields.get(key).unwrap_or(&FieldValue::Null);
        if old_value != new_value {
            changed_fields.push(key.clone());
        }
    }

    DiffResult {
        is_new: false,
        changed_fields,
    }
}
