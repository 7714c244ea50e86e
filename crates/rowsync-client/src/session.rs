//! One open document.
//!
//! [`DocumentSession`] owns everything a client holds for a document: the
//! row cache, the current window, page state, the presence and lock mirrors,
//! and the server event subscription. It has an explicit lifecycle:
//! [`open`](DocumentSession::open) joins and loads page 1,
//! [`close`](DocumentSession::close) releases locks, leaves and unsubscribes.
//!
//! # Event loop
//!
//! The session is driven from a single loop. Nothing it does blocks on
//! scrolling: window changes spawn page fetches and return immediately.
//! Results arrive later and are folded in by
//! [`process_events`](DocumentSession::process_events), which also drains
//! inbound [`ServerEvent`]s:
//!
//! ```text
//!   on_scroll / on_resize ──▶ recompute_window ──▶ PageLoader::ensure_loaded ──▶ spawn fetch
//!                                     ▲                                             │
//!                                     └──── page loaded ◀── process_events ◀────────┘
//!                                                              ▲
//!                         Subscription (viewers, locks, row updates, resync)
//! ```
//!
//! While open, a background task heartbeats the document every
//! [`SessionConfig::heartbeat_interval`] so held locks outlive the server's
//! idle TTL. It stops on [`close`](DocumentSession::close) or drop.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rowsync_types::{
    DocumentId, Row, RowId, RowStatus, RowWrite, ServerEvent, Subscription, SubscriptionPoll,
    Transport, TransportError, UserRef, Viewer,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::cache::RowCache;
use crate::config::SessionConfig;
use crate::edit::{CommitOutcome, EditError, EditSession};
use crate::locks::{AcquireResult, LockManager, LockState};
use crate::pages::{PageApplied, PageCompletion, PageLoader};
use crate::presence::PresenceTracker;
use crate::reconcile::apply_updates;
use crate::window::{Window, WindowCalculator};

/// Error opening or rebuilding a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("failed to join document {doc_id}: {source}")]
    Join {
        doc_id: DocumentId,
        #[source]
        source: TransportError,
    },
    #[error("failed to load first page of {doc_id}: {source}")]
    InitialLoad {
        doc_id: DocumentId,
        #[source]
        source: TransportError,
    },
}

/// Something the UI should react to, returned from
/// [`DocumentSession::process_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PageLoaded { page: u64, rows: usize },
    /// Rows stay placeholders; the page is retried on the next window change.
    PageFailed { page: u64, error: TransportError },
    RowsReconciled { applied: Vec<RowId>, dropped: usize },
    ViewersChanged { count: usize },
    LockChanged { row_id: RowId, locked_by: Option<UserRef> },
    /// Subscription closed. Mirrors are stale until [`DocumentSession::resync`].
    Disconnected,
    /// Server asked every viewer to rebuild its mirrors.
    ResyncRequested { generation: u64 },
    /// An open edit lost its lock and was force-abandoned.
    EditRevoked { row_id: RowId, holder: Option<UserRef> },
}

pub struct DocumentSession {
    doc_id: DocumentId,
    me: UserRef,
    transport: Arc<dyn Transport>,
    config: SessionConfig,

    cache: RowCache,
    calculator: WindowCalculator,
    window: Window,
    scroll_offset: f64,
    viewport_height: f64,
    loader: PageLoader,

    presence: PresenceTracker,
    locks: LockManager,
    subscription: Option<Subscription>,

    /// Rows with an open [`EditSession`].
    open_edits: HashSet<RowId>,
    dropped_tx: mpsc::UnboundedSender<RowId>,
    dropped_rx: mpsc::UnboundedReceiver<RowId>,
    /// Releases for dropped edits that may still be in flight.
    releasing: HashMap<RowId, JoinHandle<()>>,
    /// Stops the heartbeat task when dropped.
    heartbeat: Option<DropGuard>,
}

impl DocumentSession {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Join `doc_id`, load page 1 and compute the first window.
    pub async fn open(
        doc_id: DocumentId,
        me: UserRef,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let (snapshot, subscription) = transport
            .join(doc_id)
            .await
            .map_err(|source| SessionError::Join { doc_id, source })?;

        let mut presence = PresenceTracker::new();
        presence.reset(snapshot.viewers);
        let mut locks = LockManager::new(me.clone(), config.acquire_timeout());
        locks.reset(snapshot.locks);

        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let mut session = Self {
            doc_id,
            me,
            cache: RowCache::new(config.row_height),
            calculator: WindowCalculator::new(
                config.buffer_rows,
                f64::from(config.row_height.min_height),
            ),
            window: Window::default(),
            scroll_offset: 0.0,
            viewport_height: config.viewport_height,
            loader: PageLoader::new(Arc::clone(&transport), doc_id, config.page_size),
            presence,
            locks,
            subscription: Some(subscription),
            open_edits: HashSet::new(),
            dropped_tx,
            dropped_rx,
            releasing: HashMap::new(),
            heartbeat: None,
            transport,
            config,
        };

        if let Err(source) = session.load_first_page().await {
            let _ = session.transport.leave(doc_id).await;
            return Err(SessionError::InitialLoad { doc_id, source });
        }

        let cancel = CancellationToken::new();
        spawn_heartbeat(
            Arc::clone(&session.transport),
            doc_id,
            session.config.heartbeat_interval(),
            cancel.clone(),
        );
        session.heartbeat = Some(cancel.drop_guard());
        info!(
            "opened document {} as {}: {} rows, {} viewers",
            doc_id,
            session.me.username,
            session.total(),
            session.viewer_count()
        );
        Ok(session)
    }

    async fn load_first_page(&mut self) -> Result<(), TransportError> {
        match self.loader.load_now(1, &mut self.cache).await {
            PageApplied::Loaded { .. } | PageApplied::Stale { .. } => {
                self.recompute_window();
                Ok(())
            }
            PageApplied::Failed { error, .. } => Err(error),
        }
    }

    /// Release held locks, leave presence and drop all local state.
    pub async fn close(mut self) {
        self.heartbeat = None;
        self.release_dropped_edits();
        for (row_id, handle) in self.releasing.drain() {
            if let Err(err) = handle.await {
                warn!("release task for row {} failed: {}", row_id, err);
            }
        }

        let held = self.locks.held_by_me();
        let releases = held.iter().map(|&row_id| self.transport.release(self.doc_id, row_id));
        for (row_id, result) in held.iter().zip(join_all(releases).await) {
            if let Err(err) = result {
                debug!("release for row {} not delivered: {}", row_id, err);
            }
        }
        if let Err(err) = self.transport.leave(self.doc_id).await {
            debug!("leave for {} not delivered: {}", self.doc_id, err);
        }
        self.subscription = None;
        self.presence.clear();
        self.locks.clear();
        self.cache.clear();
        info!("closed document {}", self.doc_id);
    }

    /// Full reload, e.g. after the search filter changes.
    ///
    /// Fetches still running from before come back stale and are dropped.
    pub async fn reload(&mut self, search: Option<String>) -> Result<(), SessionError> {
        self.loader.reset(search);
        self.cache.clear();
        self.window = Window::default();
        self.load_first_page()
            .await
            .map_err(|source| SessionError::InitialLoad { doc_id: self.doc_id, source })?;
        info!(
            "reloaded document {} (search {:?}): {} rows",
            self.doc_id,
            self.loader.search(),
            self.total()
        );
        Ok(())
    }

    /// Re-join after a disconnect and rebuild both mirrors from the server.
    ///
    /// Every row this client thought it held is re-confirmed. An open edit
    /// whose row is now locked by someone else is revoked.
    pub async fn resync(&mut self) -> Result<Vec<SessionEvent>, SessionError> {
        let (snapshot, subscription) = self
            .transport
            .join(self.doc_id)
            .await
            .map_err(|source| SessionError::Join { doc_id: self.doc_id, source })?;
        self.subscription = Some(subscription);

        let believed: BTreeSet<RowId> =
            self.locks.held_by_me().into_iter().chain(self.open_edits.iter().copied()).collect();
        self.presence.reset(snapshot.viewers);
        self.locks.reset(snapshot.locks);

        let mut events = vec![SessionEvent::ViewersChanged { count: self.presence.viewer_count() }];
        for row_id in believed {
            if !self.open_edits.contains(&row_id) {
                // Nothing depends on it; let the server's view stand.
                continue;
            }
            let holder = match self.locks.state(row_id) {
                LockState::LockedByMe => continue,
                LockState::LockedByOther(holder) => Some(holder),
                LockState::Unlocked => {
                    match self.locks.acquire(&self.transport, self.doc_id, row_id).await {
                        AcquireResult::Granted => continue,
                        AcquireResult::Denied { locked_by } => locked_by,
                        AcquireResult::TimedOut | AcquireResult::Failed(_) => None,
                    }
                }
            };
            warn!("edit of row {} revoked after resync", row_id);
            self.open_edits.remove(&row_id);
            events.push(SessionEvent::EditRevoked { row_id, holder });
        }
        info!("resynced document {}", self.doc_id);
        Ok(events)
    }

    /// Keep this client's locks alive on the server. The background task
    /// does this on its own; call it to refresh out of band.
    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        self.transport.heartbeat(self.doc_id).await
    }

    // ========================================================================
    // Window
    // ========================================================================

    pub fn on_scroll(&mut self, offset: f64) -> Window {
        self.scroll_offset = offset;
        self.recompute_window()
    }

    pub fn on_resize(&mut self, viewport_height: f64) -> Window {
        self.viewport_height = viewport_height;
        self.recompute_window()
    }

    /// The UI picked a range directly.
    pub fn on_window_change(&mut self, range: Range<usize>) -> Window {
        self.window = Window::from(range).clamp(self.cache.len());
        self.loader.ensure_loaded(self.window);
        self.window
    }

    /// Map scroll state to a window and start fetching any missing pages.
    pub fn recompute_window(&mut self) -> Window {
        self.window = self.calculator.compute(
            self.scroll_offset,
            self.viewport_height,
            self.cache.avg_height(),
            self.cache.len(),
        );
        self.loader.ensure_loaded(self.window);
        self.window
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Fold in finished fetches and inbound server events. Never waits.
    pub fn process_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        while let Some(completion) = self.loader.try_completion() {
            self.handle_completion(completion, &mut events);
        }

        self.release_dropped_edits();

        loop {
            let Some(subscription) = self.subscription.as_mut() else {
                break;
            };
            match subscription.poll_next() {
                SubscriptionPoll::Event(event) => self.handle_server_event(event, &mut events),
                SubscriptionPoll::Empty => break,
                SubscriptionPoll::Closed => {
                    warn!("subscription to {} closed; mirrors are stale", self.doc_id);
                    self.subscription = None;
                    self.presence.mark_disconnected();
                    self.locks.mark_stale();
                    events.push(SessionEvent::Disconnected);
                    break;
                }
            }
        }
        events
    }

    /// Start the release of every edit dropped without commit or abandon.
    fn release_dropped_edits(&mut self) {
        while let Ok(row_id) = self.dropped_rx.try_recv() {
            self.open_edits.remove(&row_id);
            if !self.locks.forget(row_id) {
                continue;
            }
            debug!("releasing row {} after its edit was dropped", row_id);
            let transport = Arc::clone(&self.transport);
            let doc_id = self.doc_id;
            let handle = tokio::spawn(async move {
                if let Err(err) = transport.release(doc_id, row_id).await {
                    debug!("release for row {} not delivered: {}", row_id, err);
                }
            });
            self.releasing.insert(row_id, handle);
        }
        self.releasing.retain(|_, handle| !handle.is_finished());
    }

    /// Wait out a pending release of `row_id`, so the next acquire sees it.
    async fn finish_release(&mut self, row_id: RowId) {
        self.release_dropped_edits();
        if let Some(handle) = self.releasing.remove(&row_id) {
            if let Err(err) = handle.await {
                warn!("release task for row {} failed: {}", row_id, err);
            }
        }
    }

    /// Wait until no page is in flight, processing events along the way.
    pub async fn settle(&mut self) -> Vec<SessionEvent> {
        let mut events = self.process_events();
        while self.loader.has_in_flight() {
            let Some(completion) = self.loader.next_completion().await else {
                break;
            };
            self.handle_completion(completion, &mut events);
            events.extend(self.process_events());
        }
        events
    }

    fn handle_completion(&mut self, completion: PageCompletion, events: &mut Vec<SessionEvent>) {
        match self.loader.apply(completion, &mut self.cache) {
            PageApplied::Loaded { page, rows, .. } => {
                events.push(SessionEvent::PageLoaded { page, rows });
                // Average height moved, so the pixel → row mapping did too.
                self.recompute_window();
            }
            PageApplied::Failed { page, error } => {
                events.push(SessionEvent::PageFailed { page, error });
            }
            PageApplied::Stale { .. } => {}
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent, events: &mut Vec<SessionEvent>) {
        debug!("server event {} on {}", event.kind(), self.doc_id);
        match event {
            ServerEvent::ViewerJoined { viewer } => {
                self.presence.apply_joined(viewer);
                events.push(SessionEvent::ViewersChanged { count: self.presence.viewer_count() });
            }
            ServerEvent::ViewerLeft { user_id } => {
                if self.presence.apply_left(user_id) {
                    events
                        .push(SessionEvent::ViewersChanged { count: self.presence.viewer_count() });
                }
            }
            ServerEvent::LockAcquired { lock } => {
                // Never our own acquire: the server doesn't echo those. The
                // holder may still be our user, in another tab.
                let row_id = lock.row_id;
                let holder = lock.locked_by.clone();
                self.locks.apply_acquired(lock);
                if self.open_edits.remove(&row_id) {
                    error!("row {} locked by {} while we were editing it", row_id, holder.username);
                    events.push(SessionEvent::EditRevoked {
                        row_id,
                        holder: Some(holder.clone()),
                    });
                }
                events.push(SessionEvent::LockChanged { row_id, locked_by: Some(holder) });
            }
            ServerEvent::LockReleased { row_id } => {
                self.locks.apply_released(row_id);
                events.push(SessionEvent::LockChanged { row_id, locked_by: None });
            }
            ServerEvent::RowsUpdated { updates } => {
                let report = apply_updates(&mut self.cache, &updates);
                for row_id in report.applied.iter().filter(|id| self.open_edits.contains(id)) {
                    warn!("row {} changed remotely while being edited here", row_id);
                }
                events.push(SessionEvent::RowsReconciled {
                    applied: report.applied,
                    dropped: report.dropped,
                });
            }
            ServerEvent::Resync { generation } => {
                self.locks.mark_stale();
                events.push(SessionEvent::ResyncRequested { generation });
            }
        }
    }

    // ========================================================================
    // Editing
    // ========================================================================

    /// Lock a loaded row for editing and snapshot its current value.
    pub async fn begin_edit(&mut self, row_id: RowId) -> Result<EditSession, EditError> {
        let row = self.cache.get_by_id(row_id).cloned().ok_or(EditError::NotLoaded(row_id))?;
        self.finish_release(row_id).await;
        let base_revision = self.cache.revision(row_id).unwrap_or_default();

        match self.locks.acquire(&self.transport, self.doc_id, row_id).await {
            AcquireResult::Granted => {}
            AcquireResult::Denied { locked_by: Some(holder) } => {
                info!("row {} is being edited by {}", row_id, holder.username);
                return Err(EditError::LockedBy(holder));
            }
            AcquireResult::Denied { locked_by: None } => return Err(EditError::LockDenied(row_id)),
            AcquireResult::TimedOut => return Err(EditError::AcquireTimeout(row_id)),
            AcquireResult::Failed(err) => return Err(EditError::Transport(err)),
        }

        self.open_edits.insert(row_id);
        debug!("editing row {}", row_id);
        Ok(EditSession::new(
            self.doc_id,
            row,
            base_revision,
            Arc::clone(&self.transport),
            self.dropped_tx.clone(),
        ))
    }

    /// Persist the edit, patch the cache and release the lock.
    ///
    /// On a rejected write the cache is rolled back and the edit stays open
    /// with the error recorded, so the user can retry or abandon. If the lock
    /// now belongs to someone else the edit is force-abandoned and nothing is
    /// written.
    pub async fn commit_edit(
        &mut self,
        edit: &mut EditSession,
        target: impl Into<String>,
        status: RowStatus,
    ) -> Result<CommitOutcome, EditError> {
        let row_id = edit.row_id();
        if edit.is_finished() {
            return Err(EditError::Finished(row_id));
        }

        if !self.open_edits.contains(&row_id) {
            edit.finish();
            let holder = self.locks.is_locked(row_id).cloned();
            return Err(EditError::LockLost { row_id, holder });
        }
        if let LockState::LockedByOther(holder) = self.locks.state(row_id) {
            warn!("row {} is now locked by {}; abandoning edit", row_id, holder.username);
            self.open_edits.remove(&row_id);
            edit.finish();
            return Err(EditError::LockLost { row_id, holder: Some(holder) });
        }
        if self.locks.is_stale() {
            let err = EditError::Disconnected;
            edit.set_error(err.clone());
            return Err(err);
        }

        let target = target.into();
        let before = self.cache.get_by_id(row_id).cloned();
        let overlapped = self.cache.revision(row_id).is_some_and(|r| r != edit.base_revision());
        if overlapped {
            warn!("row {} was changed remotely while being edited; overwriting", row_id);
        }

        // Optimistic.
        self.cache.patch(row_id, &target, status);

        let write = RowWrite { doc_id: self.doc_id, row_id, target: target.clone(), status };
        if let Err(err) = self.transport.write_row(write).await {
            warn!("commit of row {} rejected: {}", row_id, err);
            if let Some(before) = &before {
                self.cache.patch(row_id, &before.target, before.status);
            }
            if let (false, Some(revision)) = (overlapped, self.cache.revision(row_id)) {
                edit.rebase(revision);
            }
            let err = EditError::CommitRejected(err);
            edit.set_error(err.clone());
            return Err(err);
        }

        self.locks.release(&self.transport, self.doc_id, row_id).await;
        self.open_edits.remove(&row_id);
        edit.finish();

        let row = self.cache.get_by_id(row_id).cloned().unwrap_or_else(|| Row {
            target,
            status,
            ..edit.snapshot().clone()
        });
        info!("committed row {} ({})", row_id, status);
        Ok(CommitOutcome { row, overlapped })
    }

    /// Close the editor without writing. Releases the lock; calling it on a
    /// finished edit does nothing.
    pub async fn abandon_edit(&mut self, edit: &mut EditSession) {
        if edit.is_finished() {
            return;
        }
        let row_id = edit.row_id();
        edit.finish();
        self.open_edits.remove(&row_id);
        self.locks.release(&self.transport, self.doc_id, row_id).await;
        debug!("abandoned edit of row {}", row_id);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn user(&self) -> &UserRef {
        &self.me
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn row_at(&self, index: usize) -> Option<&Row> {
        self.cache.get(index)
    }

    pub fn row_by_id(&self, row_id: RowId) -> Option<&Row> {
        self.cache.get_by_id(row_id)
    }

    pub fn cache(&self) -> &RowCache {
        &self.cache
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn total(&self) -> usize {
        self.cache.len()
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    pub fn viewport_height(&self) -> f64 {
        self.viewport_height
    }

    pub fn loaded_pages(&self) -> &BTreeSet<u64> {
        self.loader.loaded_pages()
    }

    pub fn in_flight_pages(&self) -> &BTreeSet<u64> {
        self.loader.in_flight_pages()
    }

    pub fn fetches_issued(&self) -> u64 {
        self.loader.fetches_issued()
    }

    pub fn search(&self) -> Option<&str> {
        self.loader.search()
    }

    pub fn viewer_count(&self) -> usize {
        self.presence.viewer_count()
    }

    pub fn viewer_list(&self) -> Vec<Viewer> {
        self.presence.viewer_list()
    }

    pub fn is_connected(&self) -> bool {
        self.subscription.is_some() && self.presence.is_connected()
    }

    pub fn is_locked(&self, row_id: RowId) -> Option<&UserRef> {
        self.locks.is_locked(row_id)
    }

    pub fn lock_state(&self, row_id: RowId) -> LockState {
        self.locks.state(row_id)
    }

    pub fn is_editing(&self, row_id: RowId) -> bool {
        self.open_edits.contains(&row_id)
    }

    pub fn status_counts(&self) -> BTreeMap<RowStatus, usize> {
        self.cache.status_counts()
    }

    /// Pixel offset to scroll to so `index` is at the top of the viewport.
    pub fn scroll_offset_of(&self, index: usize) -> f64 {
        self.cache.offset_of(index)
    }

    pub fn estimated_total_height(&self) -> u64 {
        self.cache.estimated_total_height()
    }
}

/// Heartbeat `doc_id` every `period` until `cancel` fires.
fn spawn_heartbeat(
    transport: Arc<dyn Transport>,
    doc_id: DocumentId,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = transport.heartbeat(doc_id).await {
                        debug!("heartbeat for {} not delivered: {}", doc_id, err);
                    }
                }
            }
        }
        debug!("heartbeat for {} stopped", doc_id);
    })
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("doc_id", &self.doc_id)
            .field("user", &self.me.username)
            .field("total", &self.cache.len())
            .field("window", &self.window)
            .field("loaded_pages", self.loader.loaded_pages())
            .field("connected", &self.is_connected())
            .finish()
    }
}
