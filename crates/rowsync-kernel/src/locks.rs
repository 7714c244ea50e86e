//! Per-row exclusive edit locks.
//!
//! At most one [`LockEntry`] exists per `(document, row)` at any instant; the
//! DashMap entry API makes check-and-insert atomic per key. A lock is owned by
//! the connection that acquired it, not by the user: two tabs of the same user
//! are two owners. The holder's [`UserRef`] is kept for display only.
//!
//! Locks are destroyed on explicit release, when the owning connection goes
//! away, or by [`LockTable::expire_idle`] when the owner stops heartbeating.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rowsync_types::{DocumentId, RowId, RowLock, UserRef};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::hub::ConnId;

/// A held lock.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub owner: ConnId,
    pub holder: UserRef,
    pub acquired_at: Instant,
    /// Last acquire or heartbeat from the owner.
    pub last_seen: Instant,
}

/// Outcome of [`LockTable::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// New lock created.
    Created,
    /// This connection already held it; refreshed.
    Reentered,
    /// Held by another connection, possibly of the same user.
    Denied(UserRef),
}

#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<(DocumentId, RowId), LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &self,
        doc_id: DocumentId,
        row_id: RowId,
        owner: ConnId,
        user: &UserRef,
        now: Instant,
    ) -> AcquireOutcome {
        match self.locks.entry((doc_id, row_id)) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.owner == owner {
                    entry.last_seen = now;
                    AcquireOutcome::Reentered
                } else {
                    trace!("lock {}:{} denied to {} ({:?})", doc_id, row_id, user.username, owner);
                    AcquireOutcome::Denied(entry.holder.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    owner,
                    holder: user.clone(),
                    acquired_at: now,
                    last_seen: now,
                });
                debug!("lock {}:{} granted to {} ({:?})", doc_id, row_id, user.username, owner);
                AcquireOutcome::Created
            }
        }
    }

    /// Release if owned by `owner`. Returns whether a lock was removed.
    pub fn release(&self, doc_id: DocumentId, row_id: RowId, owner: ConnId) -> bool {
        let removed = self
            .locks
            .remove_if(&(doc_id, row_id), |_, entry| entry.owner == owner)
            .is_some();
        if removed {
            debug!("lock {}:{} released", doc_id, row_id);
        }
        removed
    }

    /// Release every lock `owner` holds in `doc_id`.
    pub fn release_all(&self, doc_id: DocumentId, owner: ConnId) -> Vec<RowId> {
        let keys: Vec<(DocumentId, RowId)> = self
            .locks
            .iter()
            .filter(|e| e.key().0 == doc_id && e.value().owner == owner)
            .map(|e| *e.key())
            .collect();
        keys.into_iter()
            .filter(|key| self.locks.remove_if(key, |_, e| e.owner == owner).is_some())
            .map(|(_, row_id)| row_id)
            .collect()
    }

    /// Refresh every lock `owner` holds in `doc_id`. Returns how many.
    pub fn heartbeat(&self, doc_id: DocumentId, owner: ConnId, now: Instant) -> usize {
        let mut refreshed = 0;
        for mut entry in self.locks.iter_mut() {
            if entry.key().0 == doc_id && entry.value().owner == owner {
                entry.value_mut().last_seen = now;
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Remove locks whose owner has been silent for longer than `ttl`.
    pub fn expire_idle(&self, now: Instant, ttl: Duration) -> Vec<(DocumentId, RowLock)> {
        let is_idle = |e: &LockEntry| now.saturating_duration_since(e.last_seen) > ttl;
        let keys: Vec<(DocumentId, RowId)> =
            self.locks.iter().filter(|e| is_idle(e.value())).map(|e| *e.key()).collect();

        keys.into_iter()
            .filter_map(|key| self.locks.remove_if(&key, |_, e| is_idle(e)))
            .map(|((doc_id, row_id), entry)| (doc_id, RowLock { row_id, locked_by: entry.holder }))
            .collect()
    }

    pub fn get(&self, doc_id: DocumentId, row_id: RowId) -> Option<LockEntry> {
        self.locks.get(&(doc_id, row_id)).map(|e| e.value().clone())
    }

    pub fn holder(&self, doc_id: DocumentId, row_id: RowId) -> Option<UserRef> {
        self.locks.get(&(doc_id, row_id)).map(|e| e.holder.clone())
    }

    /// All locks in a document, ordered by row id.
    pub fn snapshot(&self, doc_id: DocumentId) -> Vec<RowLock> {
        let mut locks: Vec<RowLock> = self
            .locks
            .iter()
            .filter(|e| e.key().0 == doc_id)
            .map(|e| RowLock { row_id: e.key().1, locked_by: e.value().holder.clone() })
            .collect();
        locks.sort_by_key(|l| l.row_id);
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
