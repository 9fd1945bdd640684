//! Merge Engine
//!
//! Pure functions that combine two Document views (or a Document and a
//! change list) into one. Per-record conflicts resolve last-writer-wins
//! by `last_modified`; collections merge as a union of ids with deletion
//! markers excluding anything not strictly newer than its tombstone. No
//! storage or network is touched here, which keeps every rule
//! independently testable.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{
    ChangeAction, Document, Expense, PendingChange, RateSettings, RecordId, Replicated, WorkEntry,
};

/// Deterministically combine two Documents.
///
/// Commutative and idempotent on normalized Documents: the result set is
/// the union of record ids on either side, each resolved last-writer-wins;
/// tombstones are unioned with their newest timestamp; the settings
/// scalars follow whichever side has the newer Document `last_modified`
/// (whole-Document granularity, a deliberate simplification).
#[must_use]
pub fn merge_documents(local: &Document, remote: &Document) -> Document {
    let deleted = merge_tombstones(&local.deleted, &remote.deleted);

    let expenses = merge_union(
        local
            .expenses
            .values()
            .flatten()
            .chain(remote.expenses.values().flatten()),
        &deleted,
    );
    let projects = merge_union(local.projects.iter().chain(remote.projects.iter()), &deleted);
    let stock = merge_union(local.stock.iter().chain(remote.stock.iter()), &deleted);
    let work = merge_union(
        local
            .work_weeks
            .values()
            .flatten()
            .chain(remote.work_weeks.values().flatten()),
        &deleted,
    );

    Document {
        expenses: group_by_key(expenses, |expense: &Expense| expense.owner.clone()),
        projects,
        stock,
        work_weeks: group_by_key(work, |entry: &WorkEntry| entry.week_start.to_string()),
        deleted,
        settings: settings_winner(local, remote),
        last_modified: local.last_modified.max(remote.last_modified),
        last_sync: local.last_sync.max(remote.last_sync),
        version: local.version.max(remote.version),
        updated_at: local.updated_at.max(remote.updated_at),
    }
}

/// Apply a change list on top of a base Document, returning a new one.
///
/// This is the path shared by sync passes (consolidated ledger entries)
/// and the realtime listener (converted feed events). Replaying the same
/// change twice yields the same Document. Malformed changes are skipped
/// with a warning; they never abort the rest of the list.
#[must_use]
pub fn apply_changes(base: &Document, changes: &[PendingChange]) -> Document {
    let mut doc = base.clone();

    // Creation order within a device; deterministic across duplicates
    let mut ordered: Vec<&PendingChange> = changes.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.change_id.cmp(&b.change_id))
    });

    for change in ordered {
        match change.action {
            ChangeAction::Delete => {
                doc.mark_deleted(change.record_id, change.timestamp);
            }
            ChangeAction::Create | ChangeAction::Update => {
                let Some(payload) = &change.payload else {
                    tracing::warn!(
                        "skipping {} change {} with no payload",
                        change.action.as_str(),
                        change.change_id
                    );
                    continue;
                };
                if payload.record_id() != change.record_id {
                    tracing::warn!(
                        "skipping change {}: payload id does not match record id",
                        change.change_id
                    );
                    continue;
                }
                // Deletion is monotonic: only a strictly newer revision
                // may re-create a tombstoned id
                if doc
                    .tombstone(payload.record_id())
                    .is_some_and(|tomb| payload.last_modified() <= tomb)
                {
                    continue;
                }
                // An existing newer revision wins over the incoming one
                if doc
                    .last_modified_of(payload.record_id())
                    .is_some_and(|existing| existing > payload.last_modified())
                {
                    continue;
                }
                doc.upsert(payload);
            }
        }
    }
    doc
}

/// Pick the newer of two revisions of the same record. Equal timestamps
/// are resolved by comparing the serialized records: a fixed, arbitrary
/// total order chosen purely for determinism, not correctness.
fn newer_wins<'a, T: Replicated + Serialize>(held: &'a T, candidate: &'a T) -> &'a T {
    match candidate.last_modified().cmp(&held.last_modified()) {
        Ordering::Greater => candidate,
        Ordering::Less => held,
        Ordering::Equal => {
            let held_form = serde_json::to_string(held).unwrap_or_default();
            let candidate_form = serde_json::to_string(candidate).unwrap_or_default();
            if candidate_form > held_form {
                candidate
            } else {
                held
            }
        }
    }
}

/// Union-by-id over all records from both sides, newest revision per id,
/// tombstoned ids excluded unless strictly newer than their tombstone.
/// Output is sorted by record id.
fn merge_union<'a, T, I>(records: I, tombstones: &BTreeMap<RecordId, i64>) -> Vec<T>
where
    T: Replicated + Serialize + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut by_id: BTreeMap<RecordId, &T> = BTreeMap::new();
    for record in records {
        let id = record.record_id();
        let winner = match by_id.get(&id) {
            Some(&held) => newer_wins(held, record),
            None => record,
        };
        by_id.insert(id, winner);
    }

    by_id
        .into_values()
        .filter(|record| {
            tombstones
                .get(&record.record_id())
                .map_or(true, |&tomb| record.last_modified() > tomb)
        })
        .cloned()
        .collect()
}

/// Regroup a merged, id-sorted collection under its map key. Rebuilding
/// the map from the records themselves means a record that moved keys
/// (owner rename) cannot survive under both keys.
fn group_by_key<T>(records: Vec<T>, key: impl Fn(&T) -> String) -> BTreeMap<String, Vec<T>> {
    let mut grouped: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for record in records {
        grouped.entry(key(&record)).or_default().push(record);
    }
    grouped
}

/// Union of deletion markers, keeping the newest timestamp per id
fn merge_tombstones(
    a: &BTreeMap<RecordId, i64>,
    b: &BTreeMap<RecordId, i64>,
) -> BTreeMap<RecordId, i64> {
    let mut merged = a.clone();
    for (&id, &ts) in b {
        let entry = merged.entry(id).or_insert(ts);
        *entry = (*entry).max(ts);
    }
    merged
}

/// Whole-Document LWW for the settings scalars; serialized-form tie-break
fn settings_winner(local: &Document, remote: &Document) -> RateSettings {
    match local.last_modified.cmp(&remote.last_modified) {
        Ordering::Greater => local.settings,
        Ordering::Less => remote.settings,
        Ordering::Equal => {
            let local_form = serde_json::to_string(&local.settings).unwrap_or_default();
            let remote_form = serde_json::to_string(&remote.settings).unwrap_or_default();
            if remote_form > local_form {
                remote.settings
            } else {
                local.settings
            }
        }
    }
}
