//! Dialog states — where a user is inside a partially completed flow.
//!
//! Each mid-flow variant carries the draft data collected so far, so a
//! half-finished flow cannot exist without the fields it depends on.

use crate::model::ItemField;
use crate::search::QueryKind;

/// The per-user dialog position.
///
/// Flows progress linearly and always end back at `Idle`. State is held
/// in memory only; a process restart resets every user to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DialogState {
    /// No flow in progress; menu entries and list buttons are accepted.
    #[default]
    Idle,

    // ── Profile creation ────────────────────────────────────────────
    /// Waiting for the user's display name.
    ProfileName,
    /// Waiting for the user's contact string.
    ProfileContact { name: String },

    // ── Item upload ─────────────────────────────────────────────────
    /// Waiting for the item photo.
    UploadPhoto,
    /// Waiting for the item name.
    UploadName { photo_ref: String },
    /// Waiting for the item category.
    UploadCategory { photo_ref: String, name: String },
    /// Waiting for the item description.
    UploadDescription {
        photo_ref: String,
        name: String,
        category: String,
    },
    /// Waiting for the wanted-in-return description.
    UploadWanted {
        photo_ref: String,
        name: String,
        category: String,
        description: String,
    },

    // ── Item edit ───────────────────────────────────────────────────
    /// Waiting for the user to pick which field to edit.
    EditField { item_id: i64 },
    /// Waiting for the new field value.
    EditValue { item_id: i64, field: ItemField },

    // ── Search ──────────────────────────────────────────────────────
    /// Waiting for the user to pick what to search by.
    SearchKind,
    /// Waiting for the search keyword.
    SearchQuery { kind: QueryKind },
    /// Swiping through the result sequence.
    SearchBrowse,
}

impl DialogState {
    /// Short name of the flow this state belongs to, for logs.
    pub fn flow(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ProfileName | Self::ProfileContact { .. } => "profile",
            Self::UploadPhoto
            | Self::UploadName { .. }
            | Self::UploadCategory { .. }
            | Self::UploadDescription { .. }
            | Self::UploadWanted { .. } => "upload",
            Self::EditField { .. } | Self::EditValue { .. } => "edit",
            Self::SearchKind | Self::SearchQuery { .. } | Self::SearchBrowse => "search",
        }
    }

    /// What kind of event this state is waiting for, for rejection
    /// messages when the user sends something else.
    pub fn expects(&self) -> &'static str {
        match self {
            Self::Idle => "a menu option",
            Self::ProfileName
            | Self::ProfileContact { .. }
            | Self::UploadName { .. }
            | Self::UploadCategory { .. }
            | Self::UploadDescription { .. }
            | Self::UploadWanted { .. }
            | Self::SearchQuery { .. }
            | Self::EditValue { .. } => "a text message",
            Self::UploadPhoto => "a photo",
            Self::EditField { .. } | Self::SearchKind | Self::SearchBrowse => "a button press",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.flow())
    }
}
