use std::sync::Arc;

use courier::channels::{Channel, CliChannel, TelegramChannel};
use courier::config::CourierConfig;
use courier::dispatcher::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CourierConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export COURIER_PRIMARY_ID=... COURIER_SECONDARY_ID=...");
        std::process::exit(1);
    });

    eprintln!("📦 Courier v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Work dir: {}", config.work_dir.display());
    eprintln!("   Max resolution: {}p", config.fetch.max_height);
    eprintln!(
        "   Lyrics: {}",
        if config.gemini.api_key.is_some() {
            config.gemini.model.as_str()
        } else {
            "disabled (GEMINI_API_KEY not set)"
        }
    );
    eprintln!("   Queue on disconnect: {:?}", config.disconnect_policy);

    let channel: Arc<dyn Channel> = match &config.telegram {
        Some(telegram) => {
            eprintln!("   Channel: telegram\n");
            Arc::new(
                TelegramChannel::new(telegram.bot_token.clone())
                    .with_backoff(telegram.initial_backoff, telegram.max_backoff),
            )
        }
        None => {
            eprintln!("   Channel: cli (TELEGRAM_BOT_TOKEN not set)");
            eprintln!("   Type a link or command and press Enter.\n");
            Arc::new(CliChannel::new())
        }
    };

    if let Err(e) = channel.health_check().await {
        tracing::warn!(error = %e, "Channel health check failed, continuing with reconnect loop");
    }
    tokio::fs::create_dir_all(&config.work_dir).await?;

    Dispatcher::from_config(&config, channel).run().await?;
    Ok(())
}
