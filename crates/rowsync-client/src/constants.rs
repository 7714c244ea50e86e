//! Client-side defaults.
//!
//! Centralizes hardcoded values for easier configuration and documentation.
//! Every value here can be overridden through [`crate::SessionConfig`].

// ============================================================================
// Paging & windowing
// ============================================================================

/// Rows per backing page.
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// Extra rows kept loaded above and below the viewport.
pub const DEFAULT_BUFFER_ROWS: usize = 10;

/// Viewport height (px) assumed until the UI reports one.
pub const DEFAULT_VIEWPORT_HEIGHT: f64 = 600.0;

// ============================================================================
// Row heights (px)
// ============================================================================

/// Height of a single-line row. Also used for placeholders.
pub const MIN_ROW_HEIGHT: u32 = 40;

/// Tallest a row is ever estimated.
pub const MAX_ROW_HEIGHT: u32 = 200;

/// Added per wrapped or explicit line beyond the first.
pub const LINE_HEIGHT: u32 = 20;

/// Characters that fit on one rendered line.
pub const CHARS_PER_LINE: usize = 60;

// ============================================================================
// Locks
// ============================================================================

/// How long `acquire` waits for the server before treating the lock as
/// not granted.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// How often a session should heartbeat its held locks.
///
/// The server reclaims a lock after three missed heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
