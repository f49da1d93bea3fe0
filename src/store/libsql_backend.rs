//! libSQL backend — async `Store` implementation over a local database.
//!
//! A single connection is reused for all operations; SQLite serializes
//! mutations on it, which gives the single-writer guarantee the `Store`
//! contract requires. Item ids come from `INTEGER PRIMARY KEY
//! AUTOINCREMENT`, so they are monotonic and never reused, and inserts use
//! `RETURNING id` so concurrent creates each read their own id atomically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::{DatabaseError, StoreError};
use crate::model::{Item, ItemField, NewItem, Profile};
use crate::store::traits::Store;

/// libSQL store backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create tables and indexes. Idempotent.
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS profiles (
                    user_id TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    contact TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id TEXT NOT NULL,
                    photo_ref TEXT NOT NULL,
                    name TEXT NOT NULL,
                    category TEXT NOT NULL,
                    description TEXT NOT NULL,
                    wanted TEXT NOT NULL,
                    contact TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_items_owner ON items(owner_id);",
            )
            .await
            .map_err(|e| DatabaseError::Migration(format!("Schema init failed: {e}")))?;

        debug!("Database schema ready");
        Ok(())
    }

    /// Look up just the owner of an item, if it still exists.
    async fn item_owner(&self, id: i64) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT owner_id FROM items WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("item_owner: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let owner: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("item_owner row parse: {e}")))?;
                Ok(Some(owner))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("item_owner: {e}"))),
        }
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const ITEM_COLUMNS: &str =
    "id, owner_id, photo_ref, name, category, description, wanted, contact, created_at";

const PROFILE_COLUMNS: &str = "user_id, display_name, contact, created_at, updated_at";

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_item(row: &libsql::Row) -> Result<Item, libsql::Error> {
    let created_str: String = row.get(8)?;
    Ok(Item {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        photo_ref: row.get(2)?,
        name: row.get(3)?,
        category: row.get(4)?,
        description: row.get(5)?,
        wanted: row.get(6)?,
        contact: row.get(7)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_profile(row: &libsql::Row) -> Result<Profile, libsql::Error> {
    let created_str: String = row.get(3)?;
    let updated_str: String = row.get(4)?;
    Ok(Profile {
        user_id: row.get(0)?,
        display_name: row.get(1)?,
        contact: row.get(2)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_items(mut rows: libsql::Rows, op: &str) -> Result<Vec<Item>, StoreError> {
    let mut items = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let item = row_to_item(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                items.push(item);
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}")).into()),
        }
    }
    Ok(items)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlBackend {
    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO profiles (user_id, display_name, contact, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     display_name = excluded.display_name,
                     contact = excluded.contact,
                     updated_at = excluded.updated_at",
                params![
                    profile.user_id.clone(),
                    profile.display_name.clone(),
                    profile.contact.clone(),
                    profile.created_at.to_rfc3339(),
                    profile.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_profile: {e}")))?;

        debug!(user_id = %profile.user_id, "Profile upserted");
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let profile = row_to_profile(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_profile row parse: {e}")))?;
                Ok(Some(profile))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_profile: {e}")).into()),
        }
    }

    async fn insert_item(&self, item: NewItem) -> Result<i64, StoreError> {
        // Advisory owner check. A profile removed between this check and
        // the insert is an accepted race, not an error.
        if self.get_profile(&item.owner_id).await?.is_none() {
            return Err(StoreError::ProfileNotFound {
                user_id: item.owner_id,
            });
        }

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO items (owner_id, photo_ref, name, category, description, wanted, contact, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, contact, ?7 FROM profiles WHERE user_id = ?1
                 RETURNING id",
                params![
                    item.owner_id.clone(),
                    item.photo_ref,
                    item.name,
                    item.category,
                    item.description,
                    item.wanted,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("insert_item id parse: {e}")))?;
                debug!(item_id = id, owner_id = %item.owner_id, "Item inserted");
                Ok(id)
            }
            // INSERT ... SELECT matched no profile row: the owner's profile
            // vanished after the advisory check. Surface it the same way.
            Ok(None) => Err(StoreError::ProfileNotFound {
                user_id: item.owner_id,
            }),
            Err(e) => Err(DatabaseError::Query(format!("insert_item: {e}")).into()),
        }
    }

    async fn list_items(&self) -> Result<Vec<Item>, StoreError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_items: {e}")))?;
        collect_items(rows, "list_items").await
    }

    async fn list_items_by_owner(&self, owner_id: &str) -> Result<Vec<Item>, StoreError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE owner_id = ?1 ORDER BY id ASC"),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_items_by_owner: {e}")))?;
        collect_items(rows, "list_items_by_owner").await
    }

    async fn get_item(&self, id: i64) -> Result<Option<Item>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let item = row_to_item(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_item row parse: {e}")))?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_item: {e}")).into()),
        }
    }

    async fn update_item_field(
        &self,
        id: i64,
        field: ItemField,
        value: &str,
        caller_id: &str,
    ) -> Result<(), StoreError> {
        match self.item_owner(id).await? {
            None => return Err(StoreError::ItemNotFound { id }),
            Some(owner) if owner != caller_id => {
                return Err(StoreError::NotOwner {
                    id,
                    user_id: caller_id.to_string(),
                });
            }
            Some(_) => {}
        }

        // `field.column()` comes from a closed enum, so the interpolation
        // cannot inject arbitrary SQL.
        let affected = self
            .conn()
            .execute(
                &format!(
                    "UPDATE items SET {} = ?1 WHERE id = ?2 AND owner_id = ?3",
                    field.column()
                ),
                params![value, id, caller_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_item_field: {e}")))?;

        // Item vanished between the owner check and the update.
        if affected == 0 {
            return Err(StoreError::ItemNotFound { id });
        }

        debug!(item_id = id, field = %field, "Item field updated");
        Ok(())
    }

    async fn delete_item(&self, id: i64, caller_id: &str) -> Result<(), StoreError> {
        match self.item_owner(id).await? {
            None => return Err(StoreError::ItemNotFound { id }),
            Some(owner) if owner != caller_id => {
                return Err(StoreError::NotOwner {
                    id,
                    user_id: caller_id.to_string(),
                });
            }
            Some(_) => {}
        }

        let affected = self
            .conn()
            .execute(
                "DELETE FROM items WHERE id = ?1 AND owner_id = ?2",
                params![id, caller_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_item: {e}")))?;

        if affected == 0 {
            return Err(StoreError::ItemNotFound { id });
        }

        debug!(item_id = id, "Item deleted");
        Ok(())
    }
}
