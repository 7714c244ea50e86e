//! Server-side defaults.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// How long a lock survives without a heartbeat from its holder.
///
/// Three missed client heartbeats (see the client's heartbeat interval).
pub const DEFAULT_LOCK_TTL_SECS: u64 = 90;

/// How often the reaper scans for idle locks.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 15;

/// Largest page a client may request. Clients validate against the same cap.
pub use rowsync_types::MAX_PAGE_SIZE;
