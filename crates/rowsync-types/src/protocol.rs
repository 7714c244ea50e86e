//! Wire protocol between a rowsync client and the authoritative server.
//!
//! The client core never talks to a socket directly. It is written against
//! the [`Transport`] trait; the server pushes state changes back through a
//! per-document [`Subscription`] of [`ServerEvent`]s.
//!
//! ```text
//!   client core                 Transport                  server
//!   ┌──────────────┐  fetch_page / write_row   ┌──────────────────────┐
//!   │ DocumentSess │  join / leave             │ row store            │
//!   │              │  acquire / release  ────▶ │ lock table           │
//!   │              │  heartbeat                │ presence registry    │
//!   │              │  ◀──── Subscription ───── │ per-doc fan-out      │
//!   └──────────────┘       (ServerEvent)       └──────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ids::{DocumentId, RowId, UserId};
use crate::row::{Row, RowLock, RowStatus, RowUpdate, UserRef, Viewer};

// ============================================================================
// Requests / Responses
// ============================================================================

/// Largest `page_size` a server accepts.
pub const MAX_PAGE_SIZE: u64 = 1000;

/// Paginated row read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub doc_id: DocumentId,
    /// 1-based page number.
    pub page: u64,
    pub page_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

/// Rows for one page plus the current total row count of the (filtered) view.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    pub rows: Vec<Row>,
    pub total: u64,
}

/// Row write request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowWrite {
    pub doc_id: DocumentId,
    pub row_id: RowId,
    pub target: String,
    pub status: RowStatus,
}

/// Server decision on a lock request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockGrant {
    Granted,
    /// Someone else holds the row. The holder is included when the server knows it.
    Denied { locked_by: Option<UserRef> },
}

impl LockGrant {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockGrant::Granted)
    }
}

/// Authoritative presence and lock state handed back on (re)join.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSnapshot {
    pub viewers: Vec<Viewer>,
    pub locks: Vec<RowLock>,
}

// ============================================================================
// Server Events
// ============================================================================

/// Events pushed from server to client for one joined document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    ViewerJoined { viewer: Viewer },
    ViewerLeft { user_id: UserId },
    LockAcquired { lock: RowLock },
    LockReleased { row_id: RowId },
    /// A batch of committed cell changes from other viewers.
    RowsUpdated { updates: Vec<RowUpdate> },
    /// Server-side state was rebuilt; mirrors must be refreshed via `join`.
    Resync { generation: u64 },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::ViewerJoined { .. } => "viewer.joined",
            ServerEvent::ViewerLeft { .. } => "viewer.left",
            ServerEvent::LockAcquired { .. } => "lock.acquired",
            ServerEvent::LockReleased { .. } => "lock.released",
            ServerEvent::RowsUpdated { .. } => "rows.updated",
            ServerEvent::Resync { .. } => "resync",
        }
    }
}

/// Result of polling a [`Subscription`] without waiting.
#[derive(Debug, PartialEq, Eq)]
pub enum SubscriptionPoll {
    Event(ServerEvent),
    Empty,
    /// The server side went away. Mirrored state is no longer reliable.
    Closed,
}

/// Inbound event stream for one joined document.
///
/// Dropping the subscription unsubscribes; the server prunes the dead sender
/// on its next fan-out.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Subscription {
    /// Create a connected sender/subscription pair.
    pub fn channel() -> (mpsc::UnboundedSender<ServerEvent>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Subscription { rx })
    }

    /// Poll for the next event without waiting.
    pub fn poll_next(&mut self) -> SubscriptionPoll {
        match self.rx.try_recv() {
            Ok(ev) => SubscriptionPoll::Event(ev),
            Err(mpsc::error::TryRecvError::Empty) => SubscriptionPoll::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => SubscriptionPoll::Closed,
        }
    }

    /// Wait for the next event. `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Errors from the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("server unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("document {0} not joined")]
    NotJoined(DocumentId),
    #[error("request timed out")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// The external collaborator the client core is written against.
///
/// One transport belongs to one authenticated user; the user is implicit in
/// every call. Implementations must make `fetch_page` safe to repeat.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Paginated row read.
    async fn fetch_page(&self, req: PageRequest) -> TransportResult<PageResponse>;

    /// Persist a row's target and status. On success other viewers eventually
    /// receive a [`ServerEvent::RowsUpdated`] with the same values.
    async fn write_row(&self, write: RowWrite) -> TransportResult<()>;

    /// Join a document's presence set and subscribe to its events.
    async fn join(&self, doc_id: DocumentId) -> TransportResult<(JoinSnapshot, Subscription)>;

    /// Leave a document's presence set. Idempotent.
    async fn leave(&self, doc_id: DocumentId) -> TransportResult<()>;

    /// Ask for the exclusive edit lock on a row.
    async fn acquire(&self, doc_id: DocumentId, row_id: RowId) -> TransportResult<LockGrant>;

    /// Release a row lock. Releasing a lock not held by this user is a no-op.
    async fn release(&self, doc_id: DocumentId, row_id: RowId) -> TransportResult<()>;

    /// Keep this user's locks on the document alive.
    async fn heartbeat(&self, doc_id: DocumentId) -> TransportResult<()>;
}
