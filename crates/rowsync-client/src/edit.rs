//! One user's edit of one row.
//!
//! An [`EditSession`] exists only while its row lock is held. It is created
//! by `DocumentSession::begin_edit` and finished by `commit_edit` or
//! `abandon_edit`, each of which releases the lock exactly once. Dropping an
//! unfinished session hands the release to its `DocumentSession`, which
//! sends it before any later acquire of the same row. Only when the
//! `DocumentSession` is already gone is the release spawned from `Drop`.

use std::sync::Arc;

use rowsync_types::{DocumentId, Row, RowId, RowStatus, Transport, TransportError, UserRef};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Error from an edit operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    /// Row isn't in the cache, so there is nothing to edit.
    #[error("row {0} is not loaded")]
    NotLoaded(RowId),
    /// Another user holds the lock.
    #[error("row is being edited by {}", .0.username)]
    LockedBy(UserRef),
    /// Server refused without naming a holder.
    #[error("lock on row {0} was not granted")]
    LockDenied(RowId),
    #[error("timed out waiting for the lock on row {0}")]
    AcquireTimeout(RowId),
    /// Session already committed or abandoned.
    #[error("edit session for row {0} is already finished")]
    Finished(RowId),
    /// Write refused. Local changes were rolled back; the edit stays open.
    #[error("commit failed: {0}")]
    CommitRejected(TransportError),
    /// Lock is now held elsewhere. The edit was force-abandoned.
    #[error("row {row_id} was taken over by {}", holder_name(.holder))]
    LockLost {
        row_id: RowId,
        holder: Option<UserRef>,
    },
    /// Channel down. Nothing is assumed held until resync.
    #[error("not connected; resync before committing")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

fn holder_name(holder: &Option<UserRef>) -> &str {
    holder.as_ref().map(|h| h.username.as_str()).unwrap_or("another session")
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Row as it now stands in the cache.
    pub row: Row,
    /// A remote write landed on the row while the edit was open.
    pub overlapped: bool,
}

struct ReleaseGuard {
    transport: Arc<dyn Transport>,
    notify: mpsc::UnboundedSender<RowId>,
}

pub struct EditSession {
    doc_id: DocumentId,
    snapshot: Row,
    base_revision: u64,
    last_error: Option<EditError>,
    guard: Option<ReleaseGuard>,
}

impl EditSession {
    pub(crate) fn new(
        doc_id: DocumentId,
        snapshot: Row,
        base_revision: u64,
        transport: Arc<dyn Transport>,
        notify: mpsc::UnboundedSender<RowId>,
    ) -> Self {
        Self {
            doc_id,
            snapshot,
            base_revision,
            last_error: None,
            guard: Some(ReleaseGuard { transport, notify }),
        }
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn row_id(&self) -> RowId {
        self.snapshot.id
    }

    /// Row as it was when the edit opened. Used for display and cancel.
    pub fn snapshot(&self) -> &Row {
        &self.snapshot
    }

    pub fn original_target(&self) -> &str {
        &self.snapshot.target
    }

    pub fn original_status(&self) -> RowStatus {
        self.snapshot.status
    }

    /// Cache revision the edit is based on.
    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    /// Error from the last failed commit, for inline display.
    pub fn last_error(&self) -> Option<&EditError> {
        self.last_error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.guard.is_none()
    }

    pub(crate) fn set_error(&mut self, err: EditError) {
        self.last_error = Some(err);
    }

    pub(crate) fn rebase(&mut self, revision: u64) {
        self.base_revision = revision;
    }

    /// Mark finished. The caller has released (or must not release) the lock.
    pub(crate) fn finish(&mut self) {
        self.guard = None;
    }
}

impl std::fmt::Debug for EditSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditSession")
            .field("doc_id", &self.doc_id)
            .field("row_id", &self.snapshot.id)
            .field("base_revision", &self.base_revision)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for EditSession {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let (doc_id, row_id) = (self.doc_id, self.snapshot.id);
        debug!("edit of row {} dropped unfinished; releasing", row_id);
        if guard.notify.send(row_id).is_ok() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = guard.transport;
                handle.spawn(async move {
                    let _ = transport.release(doc_id, row_id).await;
                });
            }
            Err(_) => warn!("no runtime to release row {}; it will expire on the server", row_id),
        }
    }
}
