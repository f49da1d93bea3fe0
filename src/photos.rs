//! Photo store — opaque photo refs backed by files on local disk.
//!
//! The rest of the system treats a `photo_ref` as an opaque string; only
//! this module knows it is a file name under the photo directory.

use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::PhotoError;

/// Filesystem-backed photo storage.
pub struct PhotoStore {
    dir: PathBuf,
}

impl PhotoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the photo directory if it doesn't exist.
    pub async fn ensure_dir(&self) -> Result<(), PhotoError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Store photo bytes and return the opaque ref for them.
    pub async fn store(&self, user_id: &str, bytes: &[u8]) -> Result<String, PhotoError> {
        let photo_ref = format!("{}_{}.jpg", sanitize(user_id), Uuid::new_v4());
        tokio::fs::write(self.dir.join(&photo_ref), bytes).await?;
        debug!(photo_ref = %photo_ref, size = bytes.len(), "Photo stored");
        Ok(photo_ref)
    }

    /// Load the bytes behind a previously issued ref.
    pub async fn load(&self, photo_ref: &str) -> Result<Vec<u8>, PhotoError> {
        validate_ref(photo_ref)?;
        Ok(tokio::fs::read(self.dir.join(photo_ref)).await?)
    }
}

/// Reduce a user id to filesystem-safe characters.
fn sanitize(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Refs are plain file names; anything that could escape the photo
/// directory is rejected.
fn validate_ref(photo_ref: &str) -> Result<(), PhotoError> {
    let is_plain_name = Path::new(photo_ref)
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
        && !photo_ref.contains('/')
        && !photo_ref.contains('\\')
        && photo_ref != ".."
        && !photo_ref.is_empty();

    if is_plain_name {
        Ok(())
    } else {
        Err(PhotoError::InvalidRef(photo_ref.to_string()))
    }
}
