//! # rowsync-client
//!
//! Client core for browsing and editing one very large row document
//! alongside other users.
//!
//! Two concerns live here:
//!
//! - **Virtualized row cache**: [`RowCache`] holds a sparse, lazily paged
//!   view of the document. [`WindowCalculator`] maps scroll position to a
//!   row range using [`RowHeightEstimator`] heights, and [`PageLoader`]
//!   fills the gaps, one fetch per page.
//! - **Collaboration**: [`PresenceTracker`] and [`LockManager`] mirror the
//!   server's viewer set and lock table, [`apply_updates`] folds remote
//!   commits into the cache by row id, and [`EditSession`] carries one edit
//!   from lock to commit or abandon.
//!
//! [`DocumentSession`] ties them together behind an explicit open/close
//! lifecycle. It talks to the server only through
//! [`rowsync_types::Transport`].

pub mod cache;
pub mod config;
pub mod constants;
pub mod edit;
pub mod height;
pub mod locks;
pub mod pages;
pub mod presence;
pub mod reconcile;
pub mod session;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CachedRow, PatchOutcome, PutOutcome, RowCache, Slot};
pub use config::{ConfigError, SessionConfig};
pub use edit::{CommitOutcome, EditError, EditSession};
pub use height::{RowHeightEstimator, count_line_breaks};
pub use locks::{AcquireResult, LockManager, LockState};
pub use pages::{PageApplied, PageCompletion, PageLoader};
pub use presence::PresenceTracker;
pub use reconcile::{ReconcileReport, apply_updates};
pub use session::{DocumentSession, SessionError, SessionEvent};
pub use window::{Window, WindowCalculator};
