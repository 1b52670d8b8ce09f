use anyhow::Context as _;
use serenity::Client;
use serenity::all::GatewayIntents;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use vc_observer::config::Config;
use vc_observer::store::DurationStore;
use vc_observer::voice_tracker::{VoiceHandler, VoiceObserver, VoiceTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    let store = DurationStore::open(&config.time_file)
        .with_context(|| format!("opening {}", config.time_file.display()))?;
    tracing::info!(
        path = %store.path().display(),
        guilds = ?config.guild_ids,
        "loaded configuration"
    );

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let observer = VoiceObserver::new(store, config.guild_ids);

    let mut client = Client::builder(&config.token, intents)
        .event_handler(VoiceHandler)
        .type_map_insert::<VoiceTracker>(Arc::new(Mutex::new(observer)))
        .await
        .context("failed to create client")?;

    tracing::info!("starting bot");
    client.start().await.context("client error")?;
    Ok(())
}
