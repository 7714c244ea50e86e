//! Who is viewing which document.
//!
//! Viewer sets are append/remove only: a re-join removes the old entry and
//! inserts a fresh one, so observers never see an entry mutate in place.

use dashmap::DashMap;
use indexmap::IndexMap;
use rowsync_types::{DocumentId, UserId, Viewer};

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    docs: DashMap<DocumentId, IndexMap<UserId, Viewer>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a viewer. Returns the previous entry if the user was already present.
    pub fn join(&self, doc_id: DocumentId, viewer: Viewer) -> Option<Viewer> {
        let mut viewers = self.docs.entry(doc_id).or_default();
        let previous = viewers.shift_remove(&viewer.user_id);
        viewers.insert(viewer.user_id, viewer);
        previous
    }

    /// Remove a viewer. Returns the removed entry.
    pub fn leave(&self, doc_id: DocumentId, user_id: UserId) -> Option<Viewer> {
        let removed = self.docs.get_mut(&doc_id)?.shift_remove(&user_id);
        self.docs.remove_if(&doc_id, |_, viewers| viewers.is_empty());
        removed
    }

    /// Viewers of a document in join order.
    pub fn viewers(&self, doc_id: DocumentId) -> Vec<Viewer> {
        self.docs.get(&doc_id).map(|v| v.values().cloned().collect()).unwrap_or_default()
    }

    pub fn contains(&self, doc_id: DocumentId, user_id: UserId) -> bool {
        self.docs.get(&doc_id).is_some_and(|v| v.contains_key(&user_id))
    }
}
