//! # rowsync-kernel
//!
//! The authoritative side of rowsync.
//!
//! The kernel owns what clients only mirror:
//! - Row storage with paginated, optionally filtered reads
//! - The lock table (one holder per row, heartbeat expiry)
//! - Per-document presence
//! - Event fan-out to every joined connection
//!
//! [`LocalTransport`] exposes a [`Hub`] through the
//! [`rowsync_types::Transport`] trait, so client code runs unchanged
//! against an in-process kernel.

pub mod config;
pub mod constants;
pub mod hub;
pub mod locks;
pub mod presence;
pub mod row_store;
pub mod transport;

pub use config::{ConfigError, HubConfig};
pub use hub::{ConnId, Hub, SharedHub, spawn_lock_reaper};
pub use locks::{AcquireOutcome, LockEntry, LockTable};
pub use presence::PresenceRegistry;
pub use row_store::{DocumentRows, RowStore};
pub use transport::LocalTransport;
