//! Configuration — environment-driven bot settings.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Bot configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram Bot API token.
    pub bot_token: String,
    /// Allowed Telegram usernames or numeric ids; `*` allows everyone.
    pub allowed_users: Vec<String>,
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Directory for stored item photos.
    pub photo_dir: PathBuf,
    /// Long-poll timeout for getUpdates, in seconds.
    pub poll_timeout_secs: u64,
}

impl BotConfig {
    /// Build config from environment variables.
    ///
    /// `TELEGRAM_BOT_TOKEN` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".to_string()))?;

        let allowed_users = parse_allowed_users(
            &std::env::var("TELEGRAM_ALLOWED_USERS").unwrap_or_else(|_| "*".to_string()),
        );

        let db_path = std::env::var("BARTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/barter-bot.db"));

        let photo_dir = std::env::var("BARTER_PHOTO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/photos"));

        let poll_timeout_secs = match std::env::var("BARTER_POLL_TIMEOUT_SECS") {
            Ok(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "BARTER_POLL_TIMEOUT_SECS".to_string(),
                message: format!("not a valid number of seconds: {s}"),
            })?,
            Err(_) => 30,
        };

        Ok(Self {
            bot_token,
            allowed_users,
            db_path,
            photo_dir,
            poll_timeout_secs,
        })
    }
}

/// Split a comma-separated allowlist, dropping empty entries.
fn parse_allowed_users(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_users_splits_and_trims() {
        assert_eq!(
            parse_allowed_users("alice, bob ,123456789"),
            vec!["alice", "bob", "123456789"]
        );
    }

    #[test]
    fn allowed_users_drops_empty_entries() {
        assert_eq!(parse_allowed_users("alice,,  ,bob"), vec!["alice", "bob"]);
        assert!(parse_allowed_users("").is_empty());
    }

    #[test]
    fn allowed_users_wildcard() {
        assert_eq!(parse_allowed_users("*"), vec!["*"]);
    }
}
