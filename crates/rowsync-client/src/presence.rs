//! Client mirror of a document's viewer set.
//!
//! Display only: nothing here may gate editing.

use indexmap::IndexMap;
use rowsync_types::{UserId, Viewer};
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    viewers: IndexMap<UserId, Viewer>,
    connected: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mirror with the server's authoritative list.
    pub fn reset(&mut self, viewers: Vec<Viewer>) {
        self.viewers = viewers.into_iter().map(|v| (v.user_id, v)).collect();
        self.connected = true;
    }

    /// A viewer joined. An existing entry for the same user is removed first.
    pub fn apply_joined(&mut self, viewer: Viewer) {
        trace!("viewer joined: {}", viewer.username);
        self.viewers.shift_remove(&viewer.user_id);
        self.viewers.insert(viewer.user_id, viewer);
    }

    pub fn apply_left(&mut self, user_id: UserId) -> bool {
        self.viewers.shift_remove(&user_id).is_some()
    }

    /// The channel dropped. The list is kept for display but is no longer
    /// trusted until the next [`reset`](Self::reset).
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub fn clear(&mut self) {
        self.viewers.clear();
        self.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewer_list(&self) -> Vec<Viewer> {
        self.viewers.values().cloned().collect()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.viewers.contains_key(&user_id)
    }
}
