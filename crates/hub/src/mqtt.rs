//! MQTT ingress session: subscribes to the device telemetry topic and feeds
//! reports into the same ingest pipeline as the HTTP path.
//!
//! The session is runtime-configurable. A supervisor loop re-reads the mqtt
//! config section whenever the restart signal fires, so enabling MQTT or
//! changing broker credentials over the API takes effect without a process
//! restart.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::MqttConfig;
use crate::ingest;
use crate::record::Source;
use crate::state::AppState;

const MQTT_CLIENT_ID: &str = "autolight-hub";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Device publishes telemetry here.
pub fn telemetry_topic(base: &str) -> String {
    format!("{base}/telemetry")
}

/// Hub publishes pin commands here (non-retained).
pub fn control_pins_topic(base: &str) -> String {
    format!("{base}/control/pins")
}

/// Hub publishes the device-facing config here (retained).
pub fn control_config_topic(base: &str) -> String {
    format!("{base}/control/config")
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Run the MQTT supervisor. Intended to be `tokio::spawn`-ed from main;
/// loops forever, holding a session open while the config enables one.
pub async fn run(state: AppState) {
    loop {
        let cfg = state.config.get().await.mqtt;
        if !cfg.enabled {
            info!("mqtt disabled; waiting for config change");
            state.mqtt_restart.notified().await;
            continue;
        }
        run_session(&state, &cfg).await;
        // Session ended (config change): loop re-reads the fresh config.
    }
}

/// One session against one broker config. Returns when the restart signal
/// fires; transient broker errors are retried in place.
async fn run_session(state: &AppState, cfg: &MqttConfig) {
    let mut options = MqttOptions::new(MQTT_CLIENT_ID, &cfg.broker_host, cfg.broker_port);
    options.set_keep_alive(KEEP_ALIVE);
    if !cfg.username.is_empty() {
        options.set_credentials(&cfg.username, &cfg.password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    {
        let mut t = state.transport.write().await;
        t.mqtt_client = Some(client.clone());
    }

    let telemetry = telemetry_topic(&cfg.base_topic);
    if let Err(e) = client.subscribe(telemetry.as_str(), QoS::AtLeastOnce).await {
        error!(topic = %telemetry, "mqtt subscribe failed: {e}");
    } else {
        info!(
            broker = %cfg.broker_host,
            port = cfg.broker_port,
            topic = %telemetry,
            "mqtt session starting"
        );
    }

    loop {
        tokio::select! {
            _ = state.mqtt_restart.notified() => {
                info!("mqtt config changed; restarting session");
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    state.transport.write().await.mqtt_connected = true;
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handle_publish(state, &telemetry, &p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    state.transport.write().await.mqtt_connected = false;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. reconnecting...");
                    state.transport.write().await.mqtt_connected = false;
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    let mut t = state.transport.write().await;
    t.mqtt_client = None;
    t.mqtt_connected = false;
}

async fn handle_publish(state: &AppState, telemetry: &str, topic: &str, payload: &[u8]) {
    if topic != telemetry {
        warn!(topic, "unhandled mqtt topic");
        return;
    }
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => {
            // MQTT has nobody to answer to; failures end here.
            if let Err(e) = ingest::process_report(state, value, Source::Mqtt).await {
                warn!(topic, "report dropped: {e}");
            }
        }
        Err(e) => {
            warn!(topic, "bad telemetry json: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
