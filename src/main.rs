use std::sync::Arc;

use barter_bot::bot::Bot;
use barter_bot::channels::TelegramChannel;
use barter_bot::config::BotConfig;
use barter_bot::dialog::DialogEngine;
use barter_bot::photos::PhotoStore;
use barter_bot::store::{LibSqlBackend, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TELEGRAM_BOT_TOKEN=123456:ABC-...");
        std::process::exit(1);
    });

    eprintln!("🤝 Barter Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Photos:   {}", config.photo_dir.display());
    eprintln!(
        "   Allowed:  {}",
        if config.allowed_users.iter().any(|u| u == "*") {
            "everyone".to_string()
        } else {
            config.allowed_users.join(", ")
        }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Photo storage ────────────────────────────────────────────────────
    let photos = PhotoStore::new(&config.photo_dir);
    photos.ensure_dir().await.unwrap_or_else(|e| {
        eprintln!(
            "Error: Failed to create photo directory at {}: {}",
            config.photo_dir.display(),
            e
        );
        std::process::exit(1);
    });

    // ── Channel + engine ─────────────────────────────────────────────────
    let channel = Arc::new(TelegramChannel::new(
        config.bot_token.clone(),
        config.allowed_users.clone(),
        config.poll_timeout_secs,
    ));

    let engine = DialogEngine::new(store);
    let bot = Bot::new(engine, photos, channel);

    bot.run().await?;

    Ok(())
}
