//! Error types for Barter Bot.

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Photo error: {0}")]
    Photo(#[from] PhotoError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors (backend plumbing, not domain outcomes).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Domain outcomes of store operations.
///
/// `ProfileNotFound`/`ItemNotFound`/`NotOwner`/`InvalidField` are
/// recoverable and reported to the user; `Database` means the underlying
/// operation failed and nothing was written.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No profile found for user {user_id}")]
    ProfileNotFound { user_id: String },

    #[error("Item {id} not found")]
    ItemNotFound { id: i64 },

    #[error("Item {id} is not owned by user {user_id}")]
    NotOwner { id: i64, user_id: String },

    #[error("Invalid item field: {0}")]
    InvalidField(String),

    #[error("Storage failure: {0}")]
    Database(#[from] DatabaseError),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Photo store errors.
#[derive(Debug, thiserror::Error)]
pub enum PhotoError {
    #[error("Invalid photo ref: {0}")]
    InvalidRef(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the bot.
pub type Result<T> = std::result::Result<T, Error>;
