mod config;
mod error;
mod events;
mod ingest;
mod mqtt;
mod pins;
mod policy;
mod record;
mod relay;
mod settings;
mod state;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing_subscriber::EnvFilter;

use config::ConfigStore;
use events::EventBus;
use pins::PinStore;
use record::RecordStore;
use relay::Relay;
use state::{AppState, SharedTransport, TransportState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let settings_path = env::var("HUB_SETTINGS").unwrap_or_else(|_| "hub.toml".to_string());
    let settings = settings::load(&settings_path)?;

    let data_dir = PathBuf::from(&settings.data_dir);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    // ── Stores ──────────────────────────────────────────────────────
    let config = Arc::new(ConfigStore::open(data_dir.join("config.json")).await?);
    let records = Arc::new(RecordStore::open(data_dir.join("uploads")).await?);
    let pins = Arc::new(PinStore::open(data_dir.join("pins.json")).await?);

    // ── Shared transport + relay ────────────────────────────────────
    let transport: SharedTransport = Arc::new(RwLock::new(TransportState::new()));
    let relay = Relay::new(
        config.clone(),
        transport.clone(),
        Duration::from_secs(settings.relay_timeout_secs),
    )?;

    let state = AppState {
        settings: Arc::new(settings),
        config,
        records,
        pins,
        transport,
        events: EventBus::new(256),
        relay,
        mqtt_restart: Arc::new(Notify::new()),
    };

    tracing::info!(data_dir = %data_dir.display(), "autolight hub starting");

    // ── MQTT ingress (runtime-configurable) ─────────────────────────
    tokio::spawn(mqtt::run(state.clone()));

    // ── Web server (foreground) ─────────────────────────────────────
    web::serve(state).await
}
