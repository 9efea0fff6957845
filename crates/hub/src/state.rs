//! Process-wide shared state: the live transport picture used by the relay,
//! and the handle bundle each web/MQTT task works against.

use rumqttc::AsyncClient;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::pins::PinStore;
use crate::record::RecordStore;
use crate::relay::Relay;
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Transport state
// ---------------------------------------------------------------------------

/// Live view of the paths back to the device. Never persisted.
pub struct TransportState {
    /// Reflects the MQTT session (ConnAck..Disconnect/error).
    pub mqtt_connected: bool,
    /// Captured opportunistically from inbound payloads; only used as the
    /// fallback relay path when MQTT is unavailable.
    pub last_known_device_address: Option<String>,
    /// Handle of the current MQTT session, when one is running.
    pub mqtt_client: Option<AsyncClient>,
}

impl TransportState {
    pub fn new() -> Self {
        Self {
            mqtt_connected: false,
            last_known_device_address: None,
            mqtt_client: None,
        }
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedTransport = Arc<RwLock<TransportState>>;

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub config: Arc<ConfigStore>,
    pub records: Arc<RecordStore>,
    pub pins: Arc<PinStore>,
    pub transport: SharedTransport,
    pub events: EventBus,
    pub relay: Relay,
    /// Signals the MQTT supervisor that the mqtt config section changed.
    pub mqtt_restart: Arc<Notify>,
}
