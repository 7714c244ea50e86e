//! Sparse, index-addressable row cache for one open document.
//!
//! Slots are addressed by `row_num - 1`. Every index below [`RowCache::len`]
//! is either a [`Slot::Full`] row or a [`Slot::Placeholder`]; indices at or
//! past `len` are absent.
//!
//! A full slot is only ever replaced by a fresher full row (page re-fetch),
//! an optimistic local edit, or a reconciled remote update for the same id.
//! It is never turned back into a placeholder; only [`RowCache::clear`] and
//! a shrinking total drop it.
//!
//! Each full slot carries a local `revision` that increases whenever its
//! content actually changes, so an edit can tell whether someone else wrote
//! the row while it was open.

use std::collections::{BTreeMap, HashMap};

use rowsync_types::{Row, RowId, RowStatus};
use tracing::trace;

use crate::height::RowHeightEstimator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRow {
    pub row: Row,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Known to exist, not yet fetched.
    Placeholder { row_num: u64 },
    Full(CachedRow),
}

impl Slot {
    pub fn row(&self) -> Option<&Row> {
        match self {
            Slot::Full(cached) => Some(&cached.row),
            Slot::Placeholder { .. } => None,
        }
    }
}

/// What [`RowCache::put_row`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Placeholder became a full row.
    Filled,
    /// Full row replaced with different content.
    Refreshed,
    /// Same content already cached.
    Unchanged,
}

/// What [`RowCache::patch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied { revision: u64 },
    Unchanged,
    /// Row is a placeholder or not in the cache.
    NotLoaded,
}

#[derive(Debug, Clone)]
pub struct RowCache {
    slots: Vec<Slot>,
    by_id: HashMap<RowId, usize>,
    estimator: RowHeightEstimator,
    loaded: usize,
    loaded_height: u64,
}

impl RowCache {
    pub fn new(estimator: RowHeightEstimator) -> Self {
        Self {
            slots: Vec::new(),
            by_id: HashMap::new(),
            estimator,
            loaded: 0,
            loaded_height: 0,
        }
    }

    /// Number of slots (the document's known total).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of full rows.
    pub fn loaded_count(&self) -> usize {
        self.loaded
    }

    pub fn estimator(&self) -> &RowHeightEstimator {
        &self.estimator
    }

    /// Resize to `total` slots. New slots are placeholders.
    pub fn set_total(&mut self, total: usize) {
        let current = self.slots.len();
        if total > current {
            self.slots.extend(
                (current..total).map(|i| Slot::Placeholder { row_num: i as u64 + 1 }),
            );
        } else if total < current {
            for (index, slot) in (total..).zip(self.slots.drain(total..)) {
                if let Slot::Full(cached) = slot {
                    self.loaded -= 1;
                    self.loaded_height -= u64::from(self.estimator.estimate(Some(&cached.row)));
                    if self.by_id.get(&cached.row.id) == Some(&index) {
                        self.by_id.remove(&cached.row.id);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_id.clear();
        self.loaded = 0;
        self.loaded_height = 0;
    }

    /// Write a fetched row at `row_num - 1`, growing the cache if needed.
    pub fn put_row(&mut self, row: Row) -> PutOutcome {
        let Some(index) = row.row_num.checked_sub(1).map(|i| i as usize) else {
            trace!("ignoring row {} with row_num 0", row.id);
            return PutOutcome::Unchanged;
        };
        if index >= self.slots.len() {
            self.set_total(index + 1);
        }

        let height = u64::from(self.estimator.estimate(Some(&row)));
        match &self.slots[index] {
            Slot::Full(existing) if existing.row == row => return PutOutcome::Unchanged,
            Slot::Full(existing) => {
                let old_height = u64::from(self.estimator.estimate(Some(&existing.row)));
                let revision = if existing.row.id == row.id {
                    existing.revision + 1
                } else {
                    if self.by_id.get(&existing.row.id) == Some(&index) {
                        self.by_id.remove(&existing.row.id);
                    }
                    0
                };
                self.loaded_height = self.loaded_height - old_height + height;
                self.by_id.insert(row.id, index);
                self.slots[index] = Slot::Full(CachedRow { row, revision });
                PutOutcome::Refreshed
            }
            Slot::Placeholder { .. } => {
                self.loaded += 1;
                self.loaded_height += height;
                self.by_id.insert(row.id, index);
                self.slots[index] = Slot::Full(CachedRow { row, revision: 0 });
                PutOutcome::Filled
            }
        }
    }

    /// Replace a loaded row's mutable fields, addressed by identity.
    pub fn patch(&mut self, row_id: RowId, target: &str, status: RowStatus) -> PatchOutcome {
        let Some(&index) = self.by_id.get(&row_id) else {
            return PatchOutcome::NotLoaded;
        };
        let Some(Slot::Full(cached)) = self.slots.get_mut(index) else {
            return PatchOutcome::NotLoaded;
        };
        if cached.row.target == target && cached.row.status == status {
            return PatchOutcome::Unchanged;
        }

        let old_height = u64::from(self.estimator.estimate(Some(&cached.row)));
        cached.row.target = target.to_string();
        cached.row.status = status;
        cached.revision += 1;
        let new_height = u64::from(self.estimator.estimate(Some(&cached.row)));
        let revision = cached.revision;
        self.loaded_height = self.loaded_height - old_height + new_height;
        PatchOutcome::Applied { revision }
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Full row at `index`, if loaded.
    pub fn get(&self, index: usize) -> Option<&Row> {
        self.slots.get(index).and_then(Slot::row)
    }

    pub fn index_of(&self, row_id: RowId) -> Option<usize> {
        self.by_id.get(&row_id).copied()
    }

    pub fn get_by_id(&self, row_id: RowId) -> Option<&Row> {
        self.index_of(row_id).and_then(|i| self.get(i))
    }

    pub fn revision(&self, row_id: RowId) -> Option<u64> {
        match self.index_of(row_id).and_then(|i| self.slots.get(i)) {
            Some(Slot::Full(cached)) => Some(cached.revision),
            _ => None,
        }
    }

    pub fn height_at(&self, index: usize) -> u32 {
        self.estimator.estimate(self.get(index))
    }

    /// Mean height of loaded rows; `min_height` before anything loads.
    ///
    /// Placeholders are excluded so they don't drag the estimate down.
    pub fn avg_height(&self) -> f64 {
        if self.loaded == 0 {
            f64::from(self.estimator.min_height)
        } else {
            self.loaded_height as f64 / self.loaded as f64
        }
    }

    /// Loaded rows at their estimated height plus placeholders at `min_height`.
    pub fn estimated_total_height(&self) -> u64 {
        let placeholders = (self.slots.len() - self.loaded) as u64;
        self.loaded_height + placeholders * u64::from(self.estimator.min_height)
    }

    /// Pixel offset that puts `index` at the top of the viewport.
    ///
    /// Inverse of the window mapping, so it uses the same average height.
    pub fn offset_of(&self, index: usize) -> f64 {
        index.min(self.slots.len()) as f64 * self.avg_height()
    }

    /// Loaded rows per status. Every status is present.
    pub fn status_counts(&self) -> BTreeMap<RowStatus, usize> {
        let mut counts: BTreeMap<RowStatus, usize> =
            RowStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in self.slots.iter().filter_map(Slot::row) {
            *counts.entry(row.status).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(id: u64, row_num: u64, target: &str) -> Row {
        Row {
            id: RowId(id),
            row_num,
            string_id: format!("k{id}"),
            source: format!("source {id}"),
            target: target.to_string(),
            status: RowStatus::Pending,
        }
    }

    fn cache() -> RowCache {
        RowCache::new(RowHeightEstimator::default())
    }

    #[test]
    fn test_placeholders_then_fill() {
        let mut c = cache();
        c.set_total(5);
        assert_eq!(c.slot(2), Some(&Slot::Placeholder { row_num: 3 }));
        assert!(c.slot(5).is_none());

        assert_eq!(c.put_row(row(30, 3, "")), PutOutcome::Filled);
        assert_eq!(c.get(2).unwrap().id, RowId(30));
        assert_eq!(c.get_by_id(RowId(30)).unwrap().row_num, 3);
        assert_eq!(c.loaded_count(), 1);
    }

    #[test]
    fn test_refetch_same_content_is_unchanged() {
        let mut c = cache();
        c.put_row(row(1, 1, "a"));
        assert_eq!(c.put_row(row(1, 1, "a")), PutOutcome::Unchanged);
        assert_eq!(c.revision(RowId(1)), Some(0));
        assert_eq!(c.put_row(row(1, 1, "b")), PutOutcome::Refreshed);
        assert_eq!(c.revision(RowId(1)), Some(1));
    }

    #[test]
    fn test_full_slot_never_downgraded() {
        let mut c = cache();
        c.put_row(row(1, 1, "a"));
        // Growing the total keeps existing rows.
        c.set_total(10);
        assert!(matches!(c.slot(0), Some(Slot::Full(_))));
        assert_eq!(c.loaded_count(), 1);
    }

    #[test]
    fn test_patch_by_identity() {
        let mut c = cache();
        c.set_total(3);
        c.put_row(row(7, 2, ""));

        assert_eq!(
            c.patch(RowId(7), "Hola", RowStatus::Translated),
            PatchOutcome::Applied { revision: 1 }
        );
        assert_eq!(c.patch(RowId(7), "Hola", RowStatus::Translated), PatchOutcome::Unchanged);
        assert_eq!(c.patch(RowId(99), "x", RowStatus::Pending), PatchOutcome::NotLoaded);
        assert_eq!(c.get(1).unwrap().target, "Hola");
    }

    #[test]
    fn test_avg_height_ignores_placeholders() {
        let mut c = cache();
        c.set_total(1000);
        assert_eq!(c.avg_height(), 40.0);

        let mut tall = row(1, 1, "");
        tall.source = "line\n".repeat(3);
        c.put_row(tall);
        c.put_row(row(2, 2, ""));
        // (100 + 40) / 2
        assert_eq!(c.avg_height(), 70.0);
        assert_eq!(c.estimated_total_height(), 140 + 998 * 40);
    }

    #[test]
    fn test_height_sums_track_patches_and_shrink() {
        let mut c = cache();
        c.put_row(row(1, 1, ""));
        c.put_row(row(2, 2, ""));
        c.patch(RowId(2), &"w".repeat(121), RowStatus::Translated);
        assert_eq!(c.estimated_total_height(), 40 + 80);

        c.set_total(1);
        assert_eq!(c.loaded_count(), 1);
        assert_eq!(c.estimated_total_height(), 40);
        assert!(c.get_by_id(RowId(2)).is_none());
    }

    #[test]
    fn test_status_counts() {
        let mut c = cache();
        c.set_total(4);
        c.put_row(row(1, 1, ""));
        c.put_row(row(2, 2, ""));
        c.patch(RowId(2), "done", RowStatus::Approved);

        let counts = c.status_counts();
        assert_eq!(counts[&RowStatus::Pending], 1);
        assert_eq!(counts[&RowStatus::Approved], 1);
        assert_eq!(counts[&RowStatus::Reviewed], 0);
        assert_eq!(counts.values().sum::<usize>(), 2);
    }

    #[test]
    fn test_offset_of() {
        let mut c = cache();
        c.set_total(100);
        assert_eq!(c.offset_of(10), 400.0);
        assert_eq!(c.offset_of(500), 4000.0);
    }

    #[test]
    fn test_clear() {
        let mut c = cache();
        c.put_row(row(1, 1, ""));
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.loaded_count(), 0);
        assert!(c.get_by_id(RowId(1)).is_none());
    }
}
