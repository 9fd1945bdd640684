//! The Document aggregate
//!
//! The whole application dataset synchronized as one logical unit. Every
//! component treats it as copy-on-write: mutations build a new Document
//! and hand it to the durable store, nothing mutates a shared instance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::pending::RecordPayload;
use super::record::{Expense, Project, RecordId, Replicated, StockItem, WorkEntry};

/// The two rate-like settings scalars, merged at whole-Document
/// granularity (see the merge engine)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSettings {
    pub bonus_rate: f64,
    pub default_day_rate: f64,
}

/// The full application dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Expenses grouped by owner name
    #[serde(default)]
    pub expenses: BTreeMap<String, Vec<Expense>>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub stock: Vec<StockItem>,
    /// Work entries grouped by week-start date (`YYYY-MM-DD`)
    #[serde(default)]
    pub work_weeks: BTreeMap<String, Vec<WorkEntry>>,
    /// Deletion markers: record id to deletion timestamp (Unix ms).
    /// Required because absence in a pulled snapshot is ambiguous under
    /// union merge.
    #[serde(default)]
    pub deleted: BTreeMap<RecordId, i64>,
    #[serde(default)]
    pub settings: RateSettings,
    /// Timestamp of the newest change anywhere in the Document (Unix ms)
    #[serde(default)]
    pub last_modified: i64,
    /// Server timestamp of the last absorbed sync (Unix ms)
    #[serde(default)]
    pub last_sync: i64,
    /// Monotonic save counter, maintained by the durable store
    #[serde(default)]
    pub version: u64,
    /// When the store last persisted this Document (Unix ms)
    #[serde(default)]
    pub updated_at: i64,
}

impl Document {
    /// An empty Document with `last_sync = 0`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any collection contains a record with this id
    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.last_modified_of(id).is_some()
    }

    /// Deletion timestamp for this id, if it is tombstoned
    #[must_use]
    pub fn tombstone(&self, id: RecordId) -> Option<i64> {
        self.deleted.get(&id).copied()
    }

    /// Last-modified timestamp of the record with this id, if present
    #[must_use]
    pub fn last_modified_of(&self, id: RecordId) -> Option<i64> {
        find_ts(self.expenses.values().flatten(), id)
            .or_else(|| find_ts(self.projects.iter(), id))
            .or_else(|| find_ts(self.stock.iter(), id))
            .or_else(|| find_ts(self.work_weeks.values().flatten(), id))
    }

    /// Insert or replace the carried record in the right collection.
    ///
    /// Any previous record with the same id is removed first, so a record
    /// that moved between keys (an expense whose owner changed) does not
    /// leave a stale copy behind. Collections stay sorted by record id,
    /// which keeps Document equality independent of insertion order.
    pub fn upsert(&mut self, payload: &RecordPayload) {
        self.remove(payload.record_id());
        match payload {
            RecordPayload::Expense(expense) => {
                let records = self.expenses.entry(expense.owner.clone()).or_default();
                records.push(expense.clone());
                records.sort_by_key(Replicated::record_id);
            }
            RecordPayload::Project(project) => {
                self.projects.push(project.clone());
                self.projects.sort_by_key(Replicated::record_id);
            }
            RecordPayload::Stock(item) => {
                self.stock.push(item.clone());
                self.stock.sort_by_key(Replicated::record_id);
            }
            RecordPayload::Work(entry) => {
                let records = self
                    .work_weeks
                    .entry(entry.week_start.to_string())
                    .or_default();
                records.push(entry.clone());
                records.sort_by_key(Replicated::record_id);
            }
        }
        self.touch(payload.last_modified());
    }

    /// Remove the record with this id from whichever collection holds it.
    /// Returns whether anything was removed. Emptied map keys are pruned.
    pub fn remove(&mut self, id: RecordId) -> bool {
        let mut removed = false;
        for records in self.expenses.values_mut() {
            removed |= remove_by_id(records, id);
        }
        self.expenses.retain(|_, records| !records.is_empty());

        removed |= remove_by_id(&mut self.projects, id);
        removed |= remove_by_id(&mut self.stock, id);

        for records in self.work_weeks.values_mut() {
            removed |= remove_by_id(records, id);
        }
        self.work_weeks.retain(|_, records| !records.is_empty());

        removed
    }

    /// Tombstone this id at `timestamp` and drop any record revision that
    /// is not strictly newer than the tombstone. Tombstones only advance.
    pub fn mark_deleted(&mut self, id: RecordId, timestamp: i64) {
        let tombstone = self.deleted.entry(id).or_insert(timestamp);
        *tombstone = (*tombstone).max(timestamp);

        if self.last_modified_of(id).is_some_and(|ts| ts <= timestamp) {
            self.remove(id);
        }
        self.touch(timestamp);
    }

    /// Advance `last_modified`; it never moves backwards
    pub fn touch(&mut self, timestamp: i64) {
        self.last_modified = self.last_modified.max(timestamp);
    }

    /// Total number of records across all collections
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.expenses.values().map(Vec::len).sum::<usize>()
            + self.projects.len()
            + self.stock.len()
            + self.work_weeks.values().map(Vec::len).sum::<usize>()
    }

    /// Sum of all expense amounts, in cents
    #[must_use]
    pub fn total_expense_cents(&self) -> i64 {
        self.expenses
            .values()
            .flatten()
            .map(|expense| expense.amount_cents)
            .sum()
    }
}

fn find_ts<'a, T: Replicated + 'a>(
    mut records: impl Iterator<Item = &'a T>,
    id: RecordId,
) -> Option<i64> {
    records.find(|record| record.record_id() == id).map(Replicated::last_modified)
}

fn remove_by_id<T: Replicated>(records: &mut Vec<T>, id: RecordId) -> bool {
    let before = records.len();
    records.retain(|record| record.record_id() != id);
    records.len() != before
}
