//! Page loading for the row cache.
//!
//! [`PageLoader`] turns a [`Window`] into backing page numbers and issues at
//! most one fetch per page. A page is in exactly one of three states:
//! unrequested, in flight, or loaded. Fetches run as spawned tokio tasks and
//! report back through a channel; the owner drains completions on its own
//! loop with [`PageLoader::try_completion`] and hands them to
//! [`PageLoader::apply`].
//!
//! Each completion carries the load generation it was issued under. A full
//! reload bumps the generation, so late completions from the previous
//! generation are recognized and discarded instead of mixing an old view's
//! rows into the new one.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use rowsync_types::{
    DocumentId, PageRequest, PageResponse, Transport, TransportError, TransportResult,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cache::RowCache;
use crate::window::Window;

/// Result of one fetch, delivered back to the owning loop.
#[derive(Debug)]
pub struct PageCompletion {
    pub page: u64,
    pub generation: u64,
    pub result: TransportResult<PageResponse>,
}

/// What [`PageLoader::apply`] did with a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageApplied {
    Loaded { page: u64, rows: usize, total: u64 },
    Failed { page: u64, error: TransportError },
    /// Issued before the last reset; ignored.
    Stale { page: u64 },
}

pub struct PageLoader {
    transport: Arc<dyn Transport>,
    doc_id: DocumentId,
    page_size: u64,
    search: Option<String>,
    loaded: BTreeSet<u64>,
    in_flight: BTreeSet<u64>,
    generation: u64,
    fetches_issued: u64,
    tx: mpsc::UnboundedSender<PageCompletion>,
    rx: mpsc::UnboundedReceiver<PageCompletion>,
}

impl PageLoader {
    pub fn new(transport: Arc<dyn Transport>, doc_id: DocumentId, page_size: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport,
            doc_id,
            page_size: page_size.max(1),
            search: None,
            loaded: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            generation: 0,
            fetches_issued: 0,
            tx,
            rx,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_pages(&self) -> &BTreeSet<u64> {
        &self.loaded
    }

    pub fn in_flight_pages(&self) -> &BTreeSet<u64> {
        &self.in_flight
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Total transport fetches issued over this loader's lifetime.
    pub fn fetches_issued(&self) -> u64 {
        self.fetches_issued
    }

    /// 1-based page holding row index `index`.
    pub fn page_of(&self, index: usize) -> u64 {
        index as u64 / self.page_size + 1
    }

    /// Inclusive page range covering a window. `None` for an empty window.
    pub fn pages_for(&self, window: Window) -> Option<RangeInclusive<u64>> {
        if window.is_empty() {
            return None;
        }
        Some(self.page_of(window.start)..=self.page_of(window.end - 1))
    }

    /// Start a fetch for every page of `window` that is neither loaded nor in
    /// flight. Pages are marked in flight before this returns, so calling it
    /// again with an overlapping window issues nothing new.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_loaded(&mut self, window: Window) -> Vec<u64> {
        let Some(pages) = self.pages_for(window) else {
            return Vec::new();
        };
        let missing: Vec<u64> = pages
            .filter(|p| !self.loaded.contains(p) && !self.in_flight.contains(p))
            .collect();
        for &page in &missing {
            self.spawn_fetch(page);
        }
        if !missing.is_empty() {
            debug!("window {} needs pages {:?}", window, missing);
        }
        missing
    }

    fn spawn_fetch(&mut self, page: u64) {
        self.in_flight.insert(page);
        let req = self.request(page);
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let generation = self.generation;
        self.fetches_issued += 1;

        tokio::spawn(async move {
            let result = transport.fetch_page(req).await;
            // Receiver gone means the session closed; nothing to report to.
            let _ = tx.send(PageCompletion { page, generation, result });
        });
    }

    /// Fetch one page and wait for it. Used for the first page of a view,
    /// which must land before `total` is known.
    pub async fn load_now(&mut self, page: u64, cache: &mut RowCache) -> PageApplied {
        self.in_flight.insert(page);
        self.fetches_issued += 1;
        let result = self.transport.fetch_page(self.request(page)).await;
        let completion = PageCompletion { page, generation: self.generation, result };
        self.apply(completion, cache)
    }

    fn request(&self, page: u64) -> PageRequest {
        PageRequest {
            doc_id: self.doc_id,
            page,
            page_size: self.page_size,
            search: self.search.clone(),
        }
    }

    /// Next finished fetch, without waiting.
    pub fn try_completion(&mut self) -> Option<PageCompletion> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next finished fetch.
    pub async fn next_completion(&mut self) -> Option<PageCompletion> {
        self.rx.recv().await
    }

    /// Record a completion and, on success, write its rows into `cache`.
    pub fn apply(&mut self, completion: PageCompletion, cache: &mut RowCache) -> PageApplied {
        let PageCompletion { page, generation, result } = completion;
        if generation != self.generation {
            trace!("dropping page {} from generation {}", page, generation);
            return PageApplied::Stale { page };
        }
        self.in_flight.remove(&page);

        match result {
            Ok(resp) => {
                let rows = resp.rows.len();
                let total = usize::try_from(resp.total).unwrap_or(usize::MAX);
                cache.set_total(total);
                for row in resp.rows {
                    cache.put_row(row);
                }
                self.loaded.insert(page);
                debug!("page {} loaded: {} rows, total {}", page, rows, resp.total);
                PageApplied::Loaded { page, rows, total: resp.total }
            }
            Err(error) => {
                warn!("page {} failed to load: {}", page, error);
                PageApplied::Failed { page, error }
            }
        }
    }

    /// Forget all page state and start a new generation.
    ///
    /// The caller clears the cache. Fetches already running are not
    /// cancelled; their completions come back stale.
    pub fn reset(&mut self, search: Option<String>) {
        self.generation += 1;
        self.loaded.clear();
        self.in_flight.clear();
        self.search = search.filter(|s| !s.trim().is_empty());
        debug!("page loader reset to generation {}", self.generation);
    }
}
