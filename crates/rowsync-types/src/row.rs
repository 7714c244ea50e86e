//! Rows, review status, and the people who touch them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::{RowId, UserId};

/// Review status of a row.
///
/// A small closed set, used for display and for completion statistics.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum RowStatus {
    /// Not yet translated.
    #[default]
    #[strum(serialize = "pending", serialize = "new")]
    Pending,
    /// Translated, awaiting review.
    #[strum(serialize = "translated", serialize = "draft")]
    Translated,
    /// Checked by a reviewer.
    Reviewed,
    /// Signed off.
    #[strum(serialize = "approved", serialize = "final")]
    Approved,
}

impl RowStatus {
    /// All variants, in workflow order.
    pub const ALL: [RowStatus; 4] = [
        RowStatus::Pending,
        RowStatus::Translated,
        RowStatus::Reviewed,
        RowStatus::Approved,
    ];

    /// Parse from string (case-insensitive, accepts aliases).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Translated => "translated",
            RowStatus::Reviewed => "reviewed",
            RowStatus::Approved => "approved",
        }
    }

    /// Counts toward document completion.
    pub fn is_complete(&self) -> bool {
        matches!(self, RowStatus::Reviewed | RowStatus::Approved)
    }
}

impl std::fmt::Display for RowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One translation segment of a document.
///
/// `row_num` is a 1-based dense ordinal within the (possibly filtered) view;
/// `id` is the durable identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub row_num: u64,
    pub string_id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub status: RowStatus,
}

impl Row {
    /// Zero-based cache slot for this row.
    pub fn index(&self) -> usize {
        usize::try_from(self.row_num.saturating_sub(1)).unwrap_or(usize::MAX)
    }
}

/// Who did something: enough to show a name and correlate by id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: UserId,
    pub username: String,
}

impl UserRef {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self { user_id, username: username.into() }
    }
}

/// A user currently viewing a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: UserId,
    pub username: String,
    /// Unix millis.
    pub connected_at: u64,
}

impl Viewer {
    pub fn new(user: &UserRef) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username.clone(),
            connected_at: now_millis(),
        }
    }

    pub fn user_ref(&self) -> UserRef {
        UserRef::new(self.user_id, self.username.clone())
    }
}

/// An exclusive edit right on one row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLock {
    pub row_id: RowId,
    pub locked_by: UserRef,
}

/// A committed cell change, as broadcast to other viewers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub row_id: RowId,
    pub target: String,
    pub status: RowStatus,
    pub updated_by: UserRef,
}

/// Current wall-clock time in Unix millis.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
