//! Client proxy for the server's per-row lock table.
//!
//! The mirror is advisory. It lets `acquire` fail fast when the row is known
//! to be held by someone else, but the server's answer always wins. After a
//! disconnect the mirror is marked stale and every `acquire` goes to the
//! server until [`LockManager::reset`] installs a fresh snapshot.
//!
//! "Mine" means granted to this session, not to this user. A lock held by
//! the same user in another tab is `LockedByOther` like anyone else's.
//!
//! ```text
//!   Unlocked ──acquire ok──▶ LockedByMe ──release/commit/disconnect──▶ Unlocked
//!   Unlocked ──LockAcquired(other)──▶ LockedByOther ──LockReleased──▶ Unlocked
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rowsync_types::{DocumentId, LockGrant, RowId, RowLock, Transport, TransportError, UserRef};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockedByMe,
    LockedByOther(UserRef),
}

/// Outcome of [`LockManager::acquire`]. Only `Granted` means the lock is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    Granted,
    Denied { locked_by: Option<UserRef> },
    TimedOut,
    Failed(TransportError),
}

impl AcquireResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireResult::Granted)
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    me: UserRef,
    locks: HashMap<RowId, UserRef>,
    /// Rows this session was granted.
    mine: HashSet<RowId>,
    stale: bool,
    acquire_timeout: Duration,
}

impl LockManager {
    /// Starts stale: nothing is known until the first snapshot.
    pub fn new(me: UserRef, acquire_timeout: Duration) -> Self {
        Self { me, locks: HashMap::new(), mine: HashSet::new(), stale: true, acquire_timeout }
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Pure read of the mirror.
    pub fn is_locked(&self, row_id: RowId) -> Option<&UserRef> {
        self.locks.get(&row_id)
    }

    pub fn state(&self, row_id: RowId) -> LockState {
        match self.locks.get(&row_id) {
            None => LockState::Unlocked,
            Some(_) if self.mine.contains(&row_id) => LockState::LockedByMe,
            Some(holder) => LockState::LockedByOther(holder.clone()),
        }
    }

    pub fn holds(&self, row_id: RowId) -> bool {
        self.state(row_id) == LockState::LockedByMe
    }

    /// Rows this client believes it holds, ascending.
    pub fn held_by_me(&self) -> Vec<RowId> {
        let mut rows: Vec<RowId> =
            self.mine.iter().copied().filter(|row_id| self.locks.contains_key(row_id)).collect();
        rows.sort();
        rows
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Ask the server for `row_id`.
    ///
    /// Denied without a round trip when the fresh mirror already shows
    /// another holder. A timeout counts as not granted, and a best-effort
    /// release is sent in case the server granted it after all.
    pub async fn acquire(
        &mut self,
        transport: &Arc<dyn Transport>,
        doc_id: DocumentId,
        row_id: RowId,
    ) -> AcquireResult {
        if !self.stale {
            if let LockState::LockedByOther(holder) = self.state(row_id) {
                debug!("row {} is held by {}; not asking", row_id, holder.username);
                return AcquireResult::Denied { locked_by: Some(holder) };
            }
        }

        let already_mine = self.holds(row_id);
        match tokio::time::timeout(self.acquire_timeout, transport.acquire(doc_id, row_id)).await {
            Ok(Ok(LockGrant::Granted)) => {
                self.locks.insert(row_id, self.me.clone());
                self.mine.insert(row_id);
                debug!("lock on row {} granted", row_id);
                AcquireResult::Granted
            }
            Ok(Ok(LockGrant::Denied { locked_by })) => {
                self.mine.remove(&row_id);
                match &locked_by {
                    Some(holder) => {
                        self.locks.insert(row_id, holder.clone());
                    }
                    None if already_mine => {
                        self.locks.remove(&row_id);
                    }
                    None => {}
                }
                if self.stale || already_mine {
                    warn!("lock on row {} denied; local mirror was out of date", row_id);
                }
                let locked_by = locked_by.or_else(|| match self.state(row_id) {
                    LockState::LockedByOther(holder) => Some(holder),
                    _ => None,
                });
                AcquireResult::Denied { locked_by }
            }
            Ok(Err(err)) => {
                warn!("acquire for row {} failed: {}", row_id, err);
                AcquireResult::Failed(err)
            }
            Err(_) => {
                warn!(
                    "acquire for row {} timed out after {:?}; treating as not granted",
                    row_id, self.acquire_timeout
                );
                if !already_mine {
                    let transport = Arc::clone(transport);
                    tokio::spawn(async move {
                        let _ = transport.release(doc_id, row_id).await;
                    });
                }
                AcquireResult::TimedOut
            }
        }
    }

    /// Release `row_id`. Never fails; releasing a lock that isn't ours is a
    /// no-op on the server. Returns whether the mirror showed it as ours.
    pub async fn release(
        &mut self,
        transport: &Arc<dyn Transport>,
        doc_id: DocumentId,
        row_id: RowId,
    ) -> bool {
        let was_mine = self.forget(row_id);
        if let Err(err) = transport.release(doc_id, row_id).await {
            debug!("release for row {} not delivered: {}", row_id, err);
        }
        was_mine
    }

    /// Drop our own entry without telling the server.
    pub fn forget(&mut self, row_id: RowId) -> bool {
        if self.holds(row_id) {
            self.locks.remove(&row_id);
            self.mine.remove(&row_id);
            true
        } else {
            false
        }
    }

    /// Another connection took the row. Our own acquires are never echoed
    /// back, so this is never ours, even when the holder is our own user.
    pub fn apply_acquired(&mut self, lock: RowLock) {
        trace!("row {} locked by {}", lock.row_id, lock.locked_by.username);
        self.mine.remove(&lock.row_id);
        self.locks.insert(lock.row_id, lock.locked_by);
    }

    pub fn apply_released(&mut self, row_id: RowId) -> Option<UserRef> {
        self.mine.remove(&row_id);
        self.locks.remove(&row_id)
    }

    /// Install the server's snapshot. The mirror is fresh again.
    ///
    /// A snapshot comes with a new connection, which owns nothing yet, so
    /// every lock in it belongs to someone else.
    pub fn reset(&mut self, locks: Vec<RowLock>) {
        self.locks = locks.into_iter().map(|l| (l.row_id, l.locked_by)).collect();
        self.mine.clear();
        self.stale = false;
    }

    /// Channel lost: keep entries for display, stop trusting them.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn clear(&mut self) {
        self.locks.clear();
        self.mine.clear();
        self.stale = true;
    }
}
