use crate::error::SabhaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordered field-name to value mapping.
///
/// `BTreeMap` keeps serialization deterministic, which matters because
/// snapshots are compared byte-for-byte when a change is reverted.
pub type FieldSnapshot = BTreeMap<String, Value>;

/// Proposed/original field pair captured when a change request is created.
///
/// `original` is the immutable record of the target's fields at proposal time
/// and is the only source of truth for revert. One value object replaces the
/// per-kind "original_*" column pairs so apply/revert is a single algorithm
/// across all request kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub proposed: FieldSnapshot,
    pub original: FieldSnapshot,
}

impl FieldDiff {
    pub fn proposing(proposed: FieldSnapshot) -> Self {
        Self {
            proposed,
            original: FieldSnapshot::new(),
        }
    }

    /// Field names the proposal wants to change.
    pub fn proposed_fields(&self) -> Vec<String> {
        self.proposed.keys().cloned().collect()
    }

    /// Every proposed field must have a captured original, otherwise revert
    /// cannot be exact. Additions (empty proposal target) skip this check by
    /// carrying an empty original.
    pub fn verify_snapshot_complete(&self) -> Result<(), SabhaError> {
        for field in self.proposed.keys() {
            if !self.original.contains_key(field) {
                return Err(SabhaError::Validation(format!(
                    "snapshot is missing original value for field '{field}'"
                )));
            }
        }
        Ok(())
    }

    /// True when no proposed value differs from the captured current value.
    pub fn is_noop(&self, current: &FieldSnapshot) -> bool {
        self.proposed
            .iter()
            .all(|(field, value)| current.get(field) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, Value)]) -> FieldSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn incomplete_snapshot_is_rejected() {
        let diff = FieldDiff {
            proposed: snapshot(&[("name", json!("NEW")), ("dob", json!("2001-04-02"))]),
            original: snapshot(&[("name", json!("OLD"))]),
        };

        let err = diff.verify_snapshot_complete().unwrap_err();
        assert!(err.to_string().contains("dob"));
    }

    #[test]
    fn complete_snapshot_passes() {
        let diff = FieldDiff {
            proposed: snapshot(&[("name", json!("NEW"))]),
            original: snapshot(&[("name", json!("OLD")), ("dob", json!("2001-04-02"))]),
        };

        assert!(diff.verify_snapshot_complete().is_ok());
    }

    #[test]
    fn noop_detection_compares_against_current_values() {
        let current = snapshot(&[("name", json!("SAME")), ("blood_group", json!("O+"))]);
        let noop = FieldDiff::proposing(snapshot(&[("name", json!("SAME"))]));
        let real = FieldDiff::proposing(snapshot(&[("name", json!("CHANGED"))]));

        assert!(noop.is_noop(&current));
        assert!(!real.is_noop(&current));
    }
}
