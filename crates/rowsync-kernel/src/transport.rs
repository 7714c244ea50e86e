//! In-process [`Transport`] backed by a shared [`Hub`].
//!
//! Each `LocalTransport` is one user's connection to the hub. It remembers
//! which connection it holds per document so calls can be routed without the
//! client seeing connection ids.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rowsync_types::{
    DocumentId, JoinSnapshot, LockGrant, PageRequest, PageResponse, RowId, RowWrite, Subscription,
    Transport, TransportError, TransportResult, UserRef,
};
use tracing::debug;

use crate::hub::{ConnId, SharedHub};

pub struct LocalTransport {
    hub: SharedHub,
    user: UserRef,
    conns: Mutex<HashMap<DocumentId, ConnId>>,
}

impl LocalTransport {
    pub fn new(hub: SharedHub, user: UserRef) -> Self {
        Self { hub, user, conns: Mutex::new(HashMap::new()) }
    }

    pub fn shared(hub: SharedHub, user: UserRef) -> Arc<Self> {
        Arc::new(Self::new(hub, user))
    }

    pub fn user(&self) -> &UserRef {
        &self.user
    }

    pub fn hub(&self) -> &SharedHub {
        &self.hub
    }

    /// Drop the connection to `doc_id` as if the network went away.
    ///
    /// The hub releases this connection's locks and the subscription reports closed.
    pub fn sever(&self, doc_id: DocumentId) -> bool {
        let conn = self.conns.lock().remove(&doc_id);
        match conn {
            Some(conn) => {
                debug!("{} severed from {}", self.user.username, doc_id);
                self.hub.disconnect(doc_id, conn)
            }
            None => false,
        }
    }

    fn conn(&self, doc_id: DocumentId) -> TransportResult<ConnId> {
        self.conns.lock().get(&doc_id).copied().ok_or(TransportError::NotJoined(doc_id))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch_page(&self, req: PageRequest) -> TransportResult<PageResponse> {
        self.hub.fetch_page(&req)
    }

    async fn write_row(&self, write: RowWrite) -> TransportResult<()> {
        let conn = self.conn(write.doc_id)?;
        self.hub.write_row(conn, &write)
    }

    async fn join(&self, doc_id: DocumentId) -> TransportResult<(JoinSnapshot, Subscription)> {
        // Re-joining replaces the previous connection.
        let stale = self.conns.lock().remove(&doc_id);
        if let Some(stale) = stale {
            self.hub.leave(doc_id, stale);
        }
        let (conn, snapshot, subscription) = self.hub.join(doc_id, &self.user)?;
        self.conns.lock().insert(doc_id, conn);
        Ok((snapshot, subscription))
    }

    async fn leave(&self, doc_id: DocumentId) -> TransportResult<()> {
        let conn = self.conns.lock().remove(&doc_id);
        if let Some(conn) = conn {
            self.hub.leave(doc_id, conn);
        }
        Ok(())
    }

    async fn acquire(&self, doc_id: DocumentId, row_id: RowId) -> TransportResult<LockGrant> {
        let conn = self.conn(doc_id)?;
        self.hub.acquire(doc_id, conn, row_id)
    }

    async fn release(&self, doc_id: DocumentId, row_id: RowId) -> TransportResult<()> {
        // Nothing to release once the connection is gone; the hub already did.
        if let Ok(conn) = self.conn(doc_id) {
            self.hub.release(doc_id, conn, row_id);
        }
        Ok(())
    }

    async fn heartbeat(&self, doc_id: DocumentId) -> TransportResult<()> {
        let conn = self.conn(doc_id)?;
        self.hub.heartbeat(doc_id, conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use rowsync_types::{Row, RowStatus, ServerEvent, SubscriptionPoll, UserId};

    fn setup() -> (SharedHub, DocumentId) {
        let hub = Hub::shared(HubConfig::default());
        let doc = DocumentId::new();
        let rows = (1..=10)
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

    #[tokio::test]
    async fn test_calls_before_join_are_not_joined() {
        let (hub, doc) = setup();
        let t = LocalTransport::new(hub, UserRef::new(UserId::new(), "alice"));
        assert_eq!(t.acquire(doc, RowId(1)).await, Err(TransportError::NotJoined(doc)));
        assert_eq!(t.heartbeat(doc).await, Err(TransportError::NotJoined(doc)));
        // Release is always safe.
        assert_eq!(t.release(doc, RowId(1)).await, Ok(()));
        // Reads don't need a join.
        assert!(t.fetch_page(PageRequest {
            doc_id: doc,
            page: 1,
            page_size: 5,
            search: None
        })
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn test_sever_closes_subscription_and_frees_locks() {
        let (hub, doc) = setup();
        let alice = LocalTransport::new(Arc::clone(&hub), UserRef::new(UserId::new(), "alice"));
        let bob = LocalTransport::new(Arc::clone(&hub), UserRef::new(UserId::new(), "bob"));

        let (_, mut sub_a) = alice.join(doc).await.unwrap();
        let (_, mut sub_b) = bob.join(doc).await.unwrap();
        assert!(alice.acquire(doc, RowId(4)).await.unwrap().is_granted());

        assert!(alice.sever(doc));
        // Bob's join is still queued ahead of the close.
        assert!(matches!(sub_a.poll_next(), SubscriptionPoll::Event(ServerEvent::ViewerJoined { .. })));
        assert_eq!(sub_a.poll_next(), SubscriptionPoll::Closed);
        assert!(bob.acquire(doc, RowId(4)).await.unwrap().is_granted());

        let mut saw_release = false;
        while let SubscriptionPoll::Event(ev) = sub_b.poll_next() {
            if ev == (ServerEvent::LockReleased { row_id: RowId(4) }) {
                saw_release = true;
            }
        }
        assert!(saw_release);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_connection() {
        let (hub, doc) = setup();
        let alice = LocalTransport::new(Arc::clone(&hub), UserRef::new(UserId::new(), "alice"));
        let (_, mut first) = alice.join(doc).await.unwrap();
        let (snapshot, _second) = alice.join(doc).await.unwrap();
        assert_eq!(hub.connection_count(doc), 1);
        assert_eq!(snapshot.viewers.len(), 1);
        assert_eq!(first.poll_next(), SubscriptionPoll::Closed);
    }
}
