//! Scriptable in-memory transport for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rowsync_types::{
    DocumentId, JoinSnapshot, LockGrant, PageRequest, PageResponse, Row, RowId, RowStatus,
    RowWrite, ServerEvent, Subscription, Transport, TransportError, TransportResult,
};
use tokio::sync::mpsc;

/// How the mock answers `acquire`.
#[derive(Debug, Clone)]
pub enum AcquireMode {
    Grant,
    Deny(LockGrant),
    /// Never answers.
    Hang,
}

pub struct MockTransport {
    total: u64,
    fail_pages: Mutex<HashSet<u64>>,
    acquire_mode: Mutex<AcquireMode>,
    reject_writes: Mutex<bool>,
    fetches: AtomicUsize,
    acquires: AtomicUsize,
    heartbeats: AtomicUsize,
    pub releases: Mutex<Vec<RowId>>,
    pub writes: Mutex<Vec<RowWrite>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>,
}

impl MockTransport {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total,
            fail_pages: Mutex::new(HashSet::new()),
            acquire_mode: Mutex::new(AcquireMode::Grant),
            reject_writes: Mutex::new(false),
            fetches: AtomicUsize::new(0),
            acquires: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn row(n: u64) -> Row {
        Row {
            id: RowId(n),
            row_num: n,
            string_id: format!("k{n}"),
            source: format!("s{n}"),
            target: String::new(),
            status: RowStatus::Pending,
        }
    }

    pub fn fail_page(&self, page: u64) {
        self.fail_pages.lock().unwrap().insert(page);
    }

    pub fn heal_page(&self, page: u64) {
        self.fail_pages.lock().unwrap().remove(&page);
    }

    pub fn set_acquire(&self, mode: AcquireMode) {
        *self.acquire_mode.lock().unwrap() = mode;
    }

    pub fn reject_writes(&self, reject: bool) {
        *self.reject_writes.lock().unwrap() = reject;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.lock().unwrap().len()
    }

    /// Deliver a server event to every joined subscription.
    pub fn emit(&self, event: ServerEvent) {
        for tx in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(event.clone());
        }
    }

    /// Drop every subscription sender, as a lost connection would.
    pub fn close_subscriptions(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_page(&self, req: PageRequest) -> TransportResult<PageResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_pages.lock().unwrap().contains(&req.page) {
            return Err(TransportError::Unavailable(format!("page {} unavailable", req.page)));
        }
        let start = (req.page - 1) * req.page_size + 1;
        let end = (start + req.page_size - 1).min(self.total);
        let rows = (start..=end).map(Self::row).collect();
        Ok(PageResponse { rows, total: self.total })
    }

    async fn write_row(&self, write: RowWrite) -> TransportResult<()> {
        if *self.reject_writes.lock().unwrap() {
            return Err(TransportError::Rejected("write rejected".into()));
        }
        self.writes.lock().unwrap().push(write);
        Ok(())
    }

    async fn join(&self, _doc_id: DocumentId) -> TransportResult<(JoinSnapshot, Subscription)> {
        let (tx, subscription) = Subscription::channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok((JoinSnapshot::default(), subscription))
    }

    async fn leave(&self, _doc_id: DocumentId) -> TransportResult<()> {
        Ok(())
    }

    async fn acquire(&self, _doc_id: DocumentId, _row_id: RowId) -> TransportResult<LockGrant> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        let mode = self.acquire_mode.lock().unwrap().clone();
        match mode {
            AcquireMode::Grant => Ok(LockGrant::Granted),
            AcquireMode::Deny(grant) => Ok(grant),
            AcquireMode::Hang => std::future::pending().await,
        }
    }

    async fn release(&self, _doc_id: DocumentId, row_id: RowId) -> TransportResult<()> {
        self.releases.lock().unwrap().push(row_id);
        Ok(())
    }

    async fn heartbeat(&self, _doc_id: DocumentId) -> TransportResult<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
