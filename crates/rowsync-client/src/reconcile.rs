//! Applying remote row updates to the local cache.
//!
//! Updates are matched by durable row id, never by position. Rows that are
//! placeholders or not cached are skipped; the server already has the new
//! value and the page fetch will bring it in. Applying the same batch twice
//! leaves the cache exactly as applying it once.

use rowsync_types::{RowId, RowUpdate};
use tracing::trace;

use crate::cache::{PatchOutcome, RowCache};

/// What one batch did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows whose content changed.
    pub applied: Vec<RowId>,
    /// Rows already holding these values.
    pub unchanged: usize,
    /// Rows not loaded.
    pub dropped: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Patch every loaded row named in `updates`. Last applied write wins.
pub fn apply_updates(cache: &mut RowCache, updates: &[RowUpdate]) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for update in updates {
        match cache.patch(update.row_id, &update.target, update.status) {
            PatchOutcome::Applied { revision } => {
                trace!(
                    "row {} updated by {} (revision {})",
                    update.row_id, update.updated_by.username, revision
                );
                report.applied.push(update.row_id);
            }
            PatchOutcome::Unchanged => report.unchanged += 1,
            PatchOutcome::NotLoaded => report.dropped += 1,
        }
    }
    report
}
