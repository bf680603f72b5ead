mod advisory;
mod channel;
mod config;
mod protocol;
mod recommend;
mod render;
mod simulator;
mod state;
mod voice;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use channel::ChannelClient;
use recommend::RecommendationClient;
use state::Dashboard;
use voice::{SpeechBackend, VoiceQueue};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "dashboard.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Shared state ────────────────────────────────────────────────
    let shared = Dashboard::shared();
    shared
        .write()
        .await
        .record_system("dashboard started".to_string());

    // ── Narration ───────────────────────────────────────────────────
    let speech = SpeechBackend::from_config(&cfg.speech);
    info!(backend = ?speech, "speech backend ready");
    let voice = VoiceQueue::new(speech);
    let advice_narrator = cfg.narrate_advisories.then(|| voice.clone());

    // ── Channel to the remote authority ─────────────────────────────
    let (client, channel) = ChannelClient::new(
        cfg.channel_url.clone(),
        cfg.reconnect_delay(),
        Arc::clone(&shared),
        advice_narrator.clone(),
    );
    tokio::spawn(client.with_timeouts(cfg.connect_timeout(), cfg.keep_alive()).run());

    // ── Humidity simulator ──────────────────────────────────────────
    tokio::spawn(simulator::run(
        Arc::clone(&shared),
        cfg.tick_interval(),
        advice_narrator.clone(),
    ));

    // ── Control API ─────────────────────────────────────────────────
    let recommender =
        RecommendationClient::new(cfg.recommendation_url.clone(), cfg.recommendation_timeout())?;

    web::serve(
        web::AppState {
            shared,
            channel,
            voice,
            advice_narrator,
            recommender,
        },
        cfg.web_port,
    )
    .await
}
