//! Domain types — profiles, items, and the editable item field set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A user's exchange profile.
///
/// Created once the profile dialog completes. Re-creating replaces the
/// whole record; there is no partial profile edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    pub contact: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(user_id: &str, display_name: &str, contact: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            contact: contact.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// An item offered for exchange.
///
/// `id` is assigned by the repository and never reused. `contact` is a
/// snapshot of the owner's contact string at creation time, not a live
/// link to the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub owner_id: String,
    pub photo_ref: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub wanted: String,
    pub contact: String,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Caption rendered under the item photo in lists and search results.
    pub fn caption(&self) -> String {
        format!(
            "📦 *{}*\n🏷 Category: {}\n📝 {}\n🎯 Wants: {}\n📞 Contact: {}",
            self.name, self.category, self.description, self.wanted, self.contact,
        )
    }
}

/// Field bundle for creating a new item. The repository assigns the id
/// and fills the contact snapshot from the owner's profile.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub owner_id: String,
    pub photo_ref: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub wanted: String,
}

/// The set of item fields a user may edit after creation.
///
/// Ownership and the photo are immutable; everything else is edited
/// field-by-field through the edit dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemField {
    Name,
    Category,
    Description,
    Wanted,
}

impl ItemField {
    /// Parse a field tag (as carried in edit-flow button presses).
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "name" => Ok(Self::Name),
            "category" => Ok(Self::Category),
            "description" => Ok(Self::Description),
            "wanted" => Ok(Self::Wanted),
            other => Err(StoreError::InvalidField(other.to_string())),
        }
    }

    /// Column name in the items table.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Category => "category",
            Self::Description => "description",
            Self::Wanted => "wanted",
        }
    }

    /// Human-readable label for prompts and confirmations.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::Category => "Category",
            Self::Description => "Description",
            Self::Wanted => "Wanted Item",
        }
    }
}

impl std::fmt::Display for ItemField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.column())
    }
}
