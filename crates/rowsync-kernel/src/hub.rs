//! The authoritative per-process server state.
//!
//! [`Hub`] owns the row store, the lock table and the presence registry, and
//! fans every state change out to the connections joined to a document.
//!
//! ```text
//!   LocalTransport ──▶ Hub ──┬── RowStore        (rows, pages, writes)
//!   (one per user)           ├── LockTable       (row_id → owning ConnId)
//!                            ├── PresenceRegistry (doc → viewers)
//!                            └── connections      (doc → [ConnId, mpsc tx])
//! ```
//!
//! Events are never echoed to the connection that caused them: the caller
//! already knows the outcome from the call's return value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rowsync_types::{
    DocumentId, JoinSnapshot, LockGrant, PageRequest, PageResponse, RowId, RowLock, RowUpdate,
    RowWrite, ServerEvent, Subscription, TransportError, TransportResult, UserRef, Viewer,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::locks::{AcquireOutcome, LockTable};
use crate::presence::PresenceRegistry;
use crate::row_store::RowStore;

/// Identifies one joined connection. Locks are owned per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u64);

#[derive(Debug)]
struct Connection {
    id: ConnId,
    user: UserRef,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Shared handle to a hub.
pub type SharedHub = Arc<Hub>;

pub struct Hub {
    rows: RowStore,
    locks: LockTable,
    presence: PresenceRegistry,
    connections: DashMap<DocumentId, Vec<Connection>>,
    next_conn: AtomicU64,
    generation: AtomicU64,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            rows: RowStore::new(),
            locks: LockTable::new(),
            presence: PresenceRegistry::new(),
            connections: DashMap::new(),
            next_conn: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            config,
        }
    }

    pub fn shared(config: HubConfig) -> SharedHub {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn rows(&self) -> &RowStore {
        &self.rows
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn viewers(&self, doc_id: DocumentId) -> Vec<Viewer> {
        self.presence.viewers(doc_id)
    }

    pub fn connection_count(&self, doc_id: DocumentId) -> usize {
        self.connections.get(&doc_id).map(|c| c.len()).unwrap_or(0)
    }

    // ========================================================================
    // Presence
    // ========================================================================

    /// Join a document: register presence and open an event subscription.
    pub fn join(
        &self,
        doc_id: DocumentId,
        user: &UserRef,
    ) -> TransportResult<(ConnId, JoinSnapshot, Subscription)> {
        if !self.rows.contains(doc_id) {
            return Err(TransportError::Rejected(format!("unknown document {doc_id}")));
        }

        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::SeqCst));
        let (tx, subscription) = Subscription::channel();
        let viewer = Viewer::new(user);
        let previous = self.presence.join(doc_id, viewer.clone());

        self.connections
            .entry(doc_id)
            .or_default()
            .push(Connection { id: conn, user: user.clone(), tx });

        let snapshot = JoinSnapshot {
            viewers: self.presence.viewers(doc_id),
            locks: self.locks.snapshot(doc_id),
        };

        if let Some(previous) = previous {
            self.broadcast(doc_id, ServerEvent::ViewerLeft { user_id: previous.user_id }, Some(conn));
        }
        self.broadcast(doc_id, ServerEvent::ViewerJoined { viewer }, Some(conn));

        info!("{} joined document {} as {:?}", user.username, doc_id, conn);
        Ok((conn, snapshot, subscription))
    }

    /// Polite leave (document switch, close).
    pub fn leave(&self, doc_id: DocumentId, conn: ConnId) -> bool {
        self.drop_connection(doc_id, conn, "leave")
    }

    /// Involuntary loss of a connection. Releases the connection's locks.
    pub fn disconnect(&self, doc_id: DocumentId, conn: ConnId) -> bool {
        self.drop_connection(doc_id, conn, "disconnect")
    }

    fn drop_connection(&self, doc_id: DocumentId, conn: ConnId, reason: &str) -> bool {
        let (user, still_connected) = {
            let Some(mut conns) = self.connections.get_mut(&doc_id) else {
                return false;
            };
            let Some(pos) = conns.iter().position(|c| c.id == conn) else {
                return false;
            };
            let removed = conns.remove(pos);
            let still = conns.iter().any(|c| c.user.user_id == removed.user.user_id);
            (removed.user, still)
        };
        self.connections.remove_if(&doc_id, |_, conns| conns.is_empty());
        info!("{} dropped from document {} ({})", user.username, doc_id, reason);

        for row_id in self.locks.release_all(doc_id, conn) {
            self.broadcast(doc_id, ServerEvent::LockReleased { row_id }, None);
        }
        // Another connection of the same user keeps the user present.
        if still_connected {
            return true;
        }
        if self.presence.leave(doc_id, user.user_id).is_some() {
            self.broadcast(doc_id, ServerEvent::ViewerLeft { user_id: user.user_id }, None);
        }
        true
    }

    fn user_of(&self, doc_id: DocumentId, conn: ConnId) -> TransportResult<UserRef> {
        self.connections
            .get(&doc_id)
            .and_then(|conns| conns.iter().find(|c| c.id == conn).map(|c| c.user.clone()))
            .ok_or(TransportError::NotJoined(doc_id))
    }

    // ========================================================================
    // Locks
    // ========================================================================

    pub fn acquire(
        &self,
        doc_id: DocumentId,
        conn: ConnId,
        row_id: RowId,
    ) -> TransportResult<LockGrant> {
        let user = self.user_of(doc_id, conn)?;
        match self.locks.acquire(doc_id, row_id, conn, &user, Instant::now()) {
            AcquireOutcome::Created => {
                let lock = RowLock { row_id, locked_by: user };
                self.broadcast(doc_id, ServerEvent::LockAcquired { lock }, Some(conn));
                Ok(LockGrant::Granted)
            }
            AcquireOutcome::Reentered => Ok(LockGrant::Granted),
            AcquireOutcome::Denied(holder) => Ok(LockGrant::Denied { locked_by: Some(holder) }),
        }
    }

    /// Release a lock owned by `conn`. Anything else is a no-op.
    pub fn release(&self, doc_id: DocumentId, conn: ConnId, row_id: RowId) {
        if self.locks.release(doc_id, row_id, conn) {
            self.broadcast(doc_id, ServerEvent::LockReleased { row_id }, Some(conn));
        }
    }

    pub fn heartbeat(&self, doc_id: DocumentId, conn: ConnId) -> TransportResult<usize> {
        self.user_of(doc_id, conn)?;
        Ok(self.locks.heartbeat(doc_id, conn, Instant::now()))
    }

    /// Reclaim locks whose holders stopped heartbeating.
    pub fn expire_idle_locks(&self, now: Instant) -> Vec<(DocumentId, RowLock)> {
        let expired = self.locks.expire_idle(now, self.config.lock_ttl());
        for (doc_id, lock) in &expired {
            warn!(
                "lock {}:{} held by {} expired after {}s without heartbeat",
                doc_id,
                lock.row_id,
                lock.locked_by.username,
                self.config.lock_ttl_secs
            );
            self.broadcast(*doc_id, ServerEvent::LockReleased { row_id: lock.row_id }, None);
        }
        expired
    }

    // ========================================================================
    // Rows
    // ========================================================================

    pub fn fetch_page(&self, req: &PageRequest) -> TransportResult<PageResponse> {
        self.rows.fetch_page(req)
    }

    /// Persist a write and broadcast it to every other viewer.
    ///
    /// Writes to a row locked by another connection are rejected.
    pub fn write_row(&self, conn: ConnId, write: &RowWrite) -> TransportResult<()> {
        let user = self.user_of(write.doc_id, conn)?;
        if let Some(lock) = self.locks.get(write.doc_id, write.row_id) {
            if lock.owner != conn {
                return Err(TransportError::Rejected(format!(
                    "row {} is locked by {}",
                    write.row_id, lock.holder.username
                )));
            }
        }

        let row = self.rows.write_row(write)?;
        debug!("row {} written by {}", row.id, user.username);
        let update = RowUpdate {
            row_id: row.id,
            target: row.target,
            status: row.status,
            updated_by: user,
        };
        self.broadcast(write.doc_id, ServerEvent::RowsUpdated { updates: vec![update] }, Some(conn));
        Ok(())
    }

    /// Tell every viewer of a document to rebuild its mirrors.
    pub fn request_resync(&self, doc_id: DocumentId) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.broadcast(doc_id, ServerEvent::Resync { generation }, None);
        generation
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    fn broadcast(&self, doc_id: DocumentId, event: ServerEvent, except: Option<ConnId>) {
        let dead: Vec<ConnId> = match self.connections.get(&doc_id) {
            Some(conns) => conns
                .iter()
                .filter(|c| Some(c.id) != except)
                .filter(|c| c.tx.send(event.clone()).is_err())
                .map(|c| c.id)
                .collect(),
            None => return,
        };
        // A dropped subscription without a leave is a crashed client.
        for conn in dead {
            self.disconnect(doc_id, conn);
        }
    }
}

/// Run [`Hub::expire_idle_locks`] on the configured interval until cancelled.
pub fn spawn_lock_reaper(hub: SharedHub, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hub.config().reaper_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    hub.expire_idle_locks(Instant::now());
                }
            }
        }
        debug!("lock reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rowsync_types::{Row, RowStatus, SubscriptionPoll, UserId};
    use tokio::time::Duration;

    fn seeded_hub(rows: u64) -> (SharedHub, DocumentId) {
        let hub = Hub::shared(HubConfig::default());
        let doc = DocumentId::new();
        let rows = (1..=rows)
            .map(|i| Row {
                id: RowId(i),
                row_num: i,
                string_id: format!("k{i}"),
                source: format!("s{i}"),
                target: String::new(),
                status: RowStatus::Pending,
            })
            .collect();
        hub.rows().insert_document(doc, rows);
        (hub, doc)
    }

    fn user(name: &str) -> UserRef {
        UserRef::new(UserId::new(), name)
    }

    fn drain(sub: &mut Subscription) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let SubscriptionPoll::Event(ev) = sub.poll_next() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_join_unknown_document_rejected() {
        let (hub, _) = seeded_hub(1);
        assert!(hub.join(DocumentId::new(), &user("alice")).is_err());
    }

    #[test]
    fn test_join_broadcasts_to_others_only() {
        let (hub, doc) = seeded_hub(5);
        let (alice, bob) = (user("alice"), user("bob"));

        let (_ca, snap_a, mut sub_a) = hub.join(doc, &alice).unwrap();
        assert_eq!(snap_a.viewers.len(), 1);

        let (_cb, snap_b, mut sub_b) = hub.join(doc, &bob).unwrap();
        assert_eq!(snap_b.viewers.len(), 2);

        let events = drain(&mut sub_a);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerEvent::ViewerJoined { viewer } if viewer.user_id == bob.user_id));
        assert!(drain(&mut sub_b).is_empty());
    }

    #[test]
    fn test_lock_flow_and_broadcast() {
        let (hub, doc) = seeded_hub(50);
        let (alice, bob) = (user("alice"), user("bob"));
        let (ca, _, mut sub_a) = hub.join(doc, &alice).unwrap();
        let (cb, _, mut sub_b) = hub.join(doc, &bob).unwrap();
        drain(&mut sub_a);

        assert_eq!(hub.acquire(doc, ca, RowId(42)).unwrap(), LockGrant::Granted);
        assert_eq!(
            hub.acquire(doc, cb, RowId(42)).unwrap(),
            LockGrant::Denied { locked_by: Some(alice.clone()) }
        );
        assert_eq!(
            drain(&mut sub_b),
            vec![ServerEvent::LockAcquired {
                lock: RowLock { row_id: RowId(42), locked_by: alice.clone() }
            }]
        );

        // Foreign release is a no-op.
        hub.release(doc, cb, RowId(42));
        assert_eq!(hub.locks().holder(doc, RowId(42)), Some(alice));

        hub.release(doc, ca, RowId(42));
        assert_eq!(drain(&mut sub_b), vec![ServerEvent::LockReleased { row_id: RowId(42) }]);
        assert_eq!(hub.acquire(doc, cb, RowId(42)).unwrap(), LockGrant::Granted);
    }

    #[test]
    fn test_write_broadcasts_update_and_respects_locks() {
        let (hub, doc) = seeded_hub(50);
        let (alice, bob) = (user("alice"), user("bob"));
        let (ca, _, _sub_a) = hub.join(doc, &alice).unwrap();
        let (cb, _, mut sub_b) = hub.join(doc, &bob).unwrap();

        hub.acquire(doc, ca, RowId(42)).unwrap();
        drain(&mut sub_b);

        let write = RowWrite {
            doc_id: doc,
            row_id: RowId(42),
            target: "Hola".into(),
            status: RowStatus::Translated,
        };
        assert!(matches!(hub.write_row(cb, &write), Err(TransportError::Rejected(_))));
        hub.write_row(ca, &write).unwrap();

        let events = drain(&mut sub_b);
        assert_eq!(
            events,
            vec![ServerEvent::RowsUpdated {
                updates: vec![RowUpdate {
                    row_id: RowId(42),
                    target: "Hola".into(),
                    status: RowStatus::Translated,
                    updated_by: alice,
                }]
            }]
        );
        assert_eq!(hub.rows().get_row(doc, RowId(42)).unwrap().target, "Hola");
    }

    #[test]
    fn test_disconnect_releases_locks_and_presence() {
        let (hub, doc) = seeded_hub(10);
        let (alice, bob) = (user("alice"), user("bob"));
        let (ca, _, sub_a) = hub.join(doc, &alice).unwrap();
        let (_cb, _, mut sub_b) = hub.join(doc, &bob).unwrap();
        hub.acquire(doc, ca, RowId(3)).unwrap();
        drain(&mut sub_b);

        // Dropping the subscription is noticed on the next fan-out.
        drop(sub_a);
        assert!(hub.disconnect(doc, ca));

        let events = drain(&mut sub_b);
        assert!(events.contains(&ServerEvent::LockReleased { row_id: RowId(3) }));
        assert!(events.contains(&ServerEvent::ViewerLeft { user_id: alice.user_id }));
        assert!(hub.locks().holder(doc, RowId(3)).is_none());
        assert_eq!(hub.viewers(doc).len(), 1);
        assert!(matches!(hub.acquire(doc, ca, RowId(4)), Err(TransportError::NotJoined(_))));
    }

    #[test]
    fn test_dead_subscription_pruned_on_broadcast() {
        let (hub, doc) = seeded_hub(10);
        let (alice, bob) = (user("alice"), user("bob"));
        let (ca, _, sub_a) = hub.join(doc, &alice).unwrap();
        hub.acquire(doc, ca, RowId(1)).unwrap();
        drop(sub_a);

        let (_cb, _, _sub_b) = hub.join(doc, &bob).unwrap();
        assert_eq!(hub.connection_count(doc), 1);
        assert!(hub.locks().holder(doc, RowId(1)).is_none());
    }

    #[test]
    fn test_second_connection_keeps_user_present_but_not_locks() {
        let (hub, doc) = seeded_hub(10);
        let alice = user("alice");
        let (c1, _, _s1) = hub.join(doc, &alice).unwrap();
        let (_c2, _, mut s2) = hub.join(doc, &alice).unwrap();
        hub.acquire(doc, c1, RowId(2)).unwrap();
        drain(&mut s2);

        hub.leave(doc, c1);
        assert_eq!(hub.viewers(doc).len(), 1);
        assert!(hub.locks().holder(doc, RowId(2)).is_none());
        assert_eq!(drain(&mut s2), vec![ServerEvent::LockReleased { row_id: RowId(2) }]);
    }

    #[test]
    fn test_locks_are_per_connection_not_per_user() {
        let (hub, doc) = seeded_hub(10);
        let alice = user("alice");
        let (tab1, _, _s1) = hub.join(doc, &alice).unwrap();
        let (tab2, _, mut s2) = hub.join(doc, &alice).unwrap();

        assert_eq!(hub.acquire(doc, tab1, RowId(5)).unwrap(), LockGrant::Granted);
        assert_eq!(
            hub.acquire(doc, tab2, RowId(5)).unwrap(),
            LockGrant::Denied { locked_by: Some(alice.clone()) }
        );
        assert_eq!(
            drain(&mut s2),
            vec![ServerEvent::LockAcquired {
                lock: RowLock { row_id: RowId(5), locked_by: alice.clone() }
            }]
        );

        // The other tab can't write, release, or keep the lock alive.
        let write = RowWrite {
            doc_id: doc,
            row_id: RowId(5),
            target: "x".into(),
            status: RowStatus::Translated,
        };
        assert!(matches!(hub.write_row(tab2, &write), Err(TransportError::Rejected(_))));
        hub.release(doc, tab2, RowId(5));
        assert_eq!(hub.heartbeat(doc, tab2).unwrap(), 0);
        assert_eq!(hub.heartbeat(doc, tab1).unwrap(), 1);
        assert!(hub.locks().holder(doc, RowId(5)).is_some());

        hub.release(doc, tab1, RowId(5));
        assert_eq!(hub.acquire(doc, tab2, RowId(5)).unwrap(), LockGrant::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_silent_holder() {
        let config = HubConfig { lock_ttl_secs: 30, reaper_interval_secs: 5 };
        let hub = Hub::shared(config);
        let doc = DocumentId::new();
        hub.rows().insert_document(doc, Vec::new());
        let (alice, bob) = (user("alice"), user("bob"));
        let (ca, _, _sa) = hub.join(doc, &alice).unwrap();
        let (_cb, _, mut sub_b) = hub.join(doc, &bob).unwrap();
        hub.acquire(doc, ca, RowId(9)).unwrap();
        drain(&mut sub_b);

        let cancel = CancellationToken::new();
        let reaper = spawn_lock_reaper(Arc::clone(&hub), cancel.clone());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(hub.heartbeat(doc, ca).unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(hub.locks().holder(doc, RowId(9)).is_some());

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(hub.locks().holder(doc, RowId(9)).is_none());
        assert_eq!(drain(&mut sub_b), vec![ServerEvent::LockReleased { row_id: RowId(9) }]);

        cancel.cancel();
        reaper.await.unwrap();
    }

    #[test]
    fn test_request_resync_reaches_everyone() {
        let (hub, doc) = seeded_hub(1);
        let (_ca, _, mut sub_a) = hub.join(doc, &user("alice")).unwrap();
        let generation = hub.request_resync(doc);
        assert_eq!(drain(&mut sub_a), vec![ServerEvent::Resync { generation }]);
    }
}
