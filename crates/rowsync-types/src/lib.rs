//! # rowsync-types
//!
//! Shared identity, row and wire types for rowsync.
//!
//! Every other rowsync crate depends on this one. It has no knowledge of
//! caching or windowing; it only describes *what* travels between a client
//! and the authoritative server:
//!
//! - **Identity**: [`DocumentId`], [`UserId`] (UUIDv7) and [`RowId`] (durable numeric row id)
//! - **Rows**: [`Row`], [`RowStatus`], [`RowUpdate`]
//! - **Collaboration**: [`Viewer`], [`UserRef`], [`RowLock`], [`LockGrant`]
//! - **Protocol**: [`PageRequest`]/[`PageResponse`], [`RowWrite`], [`ServerEvent`],
//!   [`Subscription`], and the [`Transport`] trait the client core is written against

pub mod ids;
pub mod protocol;
pub mod row;

pub use ids::{DocumentId, RowId, UserId};
pub use protocol::{
    JoinSnapshot, LockGrant, MAX_PAGE_SIZE, PageRequest, PageResponse, RowWrite, ServerEvent, Subscription,
    SubscriptionPoll, Transport, TransportError, TransportResult,
};
pub use row::{Row, RowLock, RowStatus, RowUpdate, UserRef, Viewer, now_millis};
