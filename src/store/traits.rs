//! Backend-agnostic `Store` trait — the durable-store contract the dialog
//! engine programs against.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Item, ItemField, NewItem, Profile};

/// Durable storage for profiles and items.
///
/// Implementations must serialize mutations: two concurrent mutating calls
/// never interleave, readers never observe a partially applied write, and
/// item ids are never reused. List operations return snapshot copies in
/// insertion order.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Profiles ────────────────────────────────────────────────────

    /// Create or replace a user's profile (idempotent overwrite).
    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError>;

    /// Look up a profile by user id.
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError>;

    // ── Items ───────────────────────────────────────────────────────

    /// Insert a new item and return its assigned stable id.
    ///
    /// Fails with `ProfileNotFound` if the owner has no profile. The
    /// existence check is advisory: a profile removed between the check
    /// and the insert is an accepted race, not an error the caller can
    /// distinguish.
    async fn insert_item(&self, item: NewItem) -> Result<i64, StoreError>;

    /// All items, snapshot copy, insertion order.
    async fn list_items(&self) -> Result<Vec<Item>, StoreError>;

    /// Items owned by `owner_id`, same relative order as `list_items`.
    /// Each returned item carries its stable id; callers must never derive
    /// identity from a position in this list.
    async fn list_items_by_owner(&self, owner_id: &str) -> Result<Vec<Item>, StoreError>;

    /// Look up an item by its stable id.
    async fn get_item(&self, id: i64) -> Result<Option<Item>, StoreError>;

    /// Replace exactly one field of an item, all others untouched.
    ///
    /// Fails with `ItemNotFound` if the id is absent and `NotOwner` if
    /// `caller_id` does not match the item's owner.
    async fn update_item_field(
        &self,
        id: i64,
        field: ItemField,
        value: &str,
        caller_id: &str,
    ) -> Result<(), StoreError>;

    /// Permanently remove an item.
    ///
    /// Fails with `ItemNotFound` if the id is absent (including a second
    /// delete of the same id) and `NotOwner` for a non-owner caller.
    async fn delete_item(&self, id: i64, caller_id: &str) -> Result<(), StoreError>;
}
