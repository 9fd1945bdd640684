//! Per-category sync watermarks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::record::RecordKind;

/// Watermark for one entity category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryVersion {
    /// Highest remote version absorbed for this category
    pub last_synced_version: i64,
    /// When it was absorbed (Unix ms)
    pub last_synced_at: i64,
}

/// Per-category watermarks sent with every pull so the remote can answer
/// with a delta instead of the full dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncVersions {
    #[serde(default)]
    pub categories: BTreeMap<RecordKind, CategoryVersion>,
}

impl SyncVersions {
    /// Watermark for a category; zero when the category was never synced
    #[must_use]
    pub fn watermark(&self, kind: RecordKind) -> CategoryVersion {
        self.categories.get(&kind).copied().unwrap_or_default()
    }

    /// Record that `kind` has been absorbed up to `version`.
    /// Watermarks never move backwards.
    pub fn advance(&mut self, kind: RecordKind, version: i64, at: i64) {
        let entry = self.categories.entry(kind).or_default();
        if version >= entry.last_synced_version {
            entry.last_synced_version = version;
            entry.last_synced_at = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_defaults_to_zero() {
        let versions = SyncVersions::default();
        assert_eq!(versions.watermark(RecordKind::Stock).last_synced_version, 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut versions = SyncVersions::default();
        versions.advance(RecordKind::Expenses, 7, 100);
        versions.advance(RecordKind::Expenses, 3, 200);

        let mark = versions.watermark(RecordKind::Expenses);
        assert_eq!(mark.last_synced_version, 7);
        assert_eq!(mark.last_synced_at, 100);
    }
}
