//! Outbound command delivery to the physical device.
//!
//! Fire-and-forget: the caller has already persisted the canonical actuator
//! state, so delivery runs detached and its failures are only logged. The
//! next telemetry cycle or manual action is the implicit retry.
//!
//! Transport selection: a connected MQTT session wins; otherwise a direct
//! HTTP call to the last address the device reported from, under a bounded
//! timeout. With neither available the command is dropped and the outcome
//! says so.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::mqtt::{control_config_topic, control_pins_topic};
use crate::state::SharedTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTransport {
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Whether the command was handed to a transport. Delivery itself is
    /// best-effort and confirmed only in the logs.
    pub sent_to_device: bool,
    pub transport: Option<RelayTransport>,
}

impl RelayOutcome {
    fn not_sent() -> Self {
        Self {
            sent_to_device: false,
            transport: None,
        }
    }

    fn sent(transport: RelayTransport) -> Self {
        Self {
            sent_to_device: true,
            transport: Some(transport),
        }
    }
}

pub fn control_url(addr: &str, gpio: u8, state: u8) -> String {
    format!("http://{addr}/control?pin={gpio}&state={state}")
}

#[derive(Clone)]
pub struct Relay {
    config: Arc<ConfigStore>,
    transport: SharedTransport,
    http: reqwest::Client,
    timeout: Duration,
}

impl Relay {
    pub fn new(
        config: Arc<ConfigStore>,
        transport: SharedTransport,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            transport,
            http,
            timeout,
        })
    }

    /// Relay a pin command. Selects a transport and dispatches without
    /// blocking the caller on delivery; no store lock is held here.
    pub async fn dispatch_pin(&self, gpio: u8, state: u8) -> RelayOutcome {
        let cfg = self.config.get().await;
        let (client, address) = {
            let t = self.transport.read().await;
            let client = if t.mqtt_connected {
                t.mqtt_client.clone()
            } else {
                None
            };
            (client, t.last_known_device_address.clone())
        };

        if let Some(client) = client {
            let topic = control_pins_topic(&cfg.mqtt.base_topic);
            let payload = json!({"pin": gpio, "state": state});
            match client.try_publish(topic.as_str(), rumqttc::QoS::AtLeastOnce, false, payload.to_string())
            {
                Ok(()) => {
                    info!(topic = %topic, gpio, state, "pin command published");
                    return RelayOutcome::sent(RelayTransport::Mqtt);
                }
                Err(e) => {
                    warn!(topic = %topic, "mqtt publish failed, trying direct http: {e}");
                }
            }
        }

        if let Some(address) = address {
            let url = control_url(&address, gpio, state);
            let http = self.http.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                match http.get(&url).timeout(timeout).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        info!(url = %url, "pin command delivered over http");
                    }
                    Ok(resp) => {
                        warn!(url = %url, status = %resp.status(), "device rejected pin command");
                    }
                    Err(e) => {
                        warn!(url = %url, "http delivery failed: {e}");
                    }
                }
            });
            return RelayOutcome::sent(RelayTransport::Http);
        }

        warn!(gpio, state, "no transport to device; command not sent");
        RelayOutcome::not_sent()
    }

    /// Retained publish of the device-facing config, so the device picks it
    /// up on (re)connect. MQTT only; there is no HTTP equivalent.
    pub async fn publish_device_config(&self, device_config: &Value) -> bool {
        let cfg = self.config.get().await;
        let client = {
            let t = self.transport.read().await;
            if t.mqtt_connected {
                t.mqtt_client.clone()
            } else {
                None
            }
        };
        let Some(client) = client else {
            warn!("cannot publish device config: mqtt not connected");
            return false;
        };

        let topic = control_config_topic(&cfg.mqtt.base_topic);
        match client.try_publish(topic.as_str(), rumqttc::QoS::AtLeastOnce, true, device_config.to_string())
        {
            Ok(()) => {
                info!(topic = %topic, "device config published (retained)");
                true
            }
            Err(e) => {
                warn!(topic = %topic, "config publish failed: {e}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TransportState;
    use tokio::sync::RwLock;

    async fn test_relay() -> (tempfile::TempDir, Relay, SharedTransport) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            ConfigStore::open(dir.path().join("config.json"))
                .await
                .unwrap(),
        );
        let transport: SharedTransport = Arc::new(RwLock::new(TransportState::new()));
        let relay = Relay::new(config, transport.clone(), Duration::from_secs(1)).unwrap();
        (dir, relay, transport)
    }

    /// MQTT client without a broker: publishes enqueue into the request
    /// channel, which is enough to verify transport selection. The event
    /// loop must stay alive so the channel remains open.
    fn test_mqtt() -> (rumqttc::AsyncClient, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-relay", "127.0.0.1", 1883);
        rumqttc::AsyncClient::new(opts, 10)
    }

    #[test]
    fn control_url_format() {
        assert_eq!(
            control_url("192.168.1.50", 12, 1),
            "http://192.168.1.50/control?pin=12&state=1"
        );
        assert_eq!(
            control_url("10.0.0.7:8080", 14, 0),
            "http://10.0.0.7:8080/control?pin=14&state=0"
        );
    }

    #[tokio::test]
    async fn no_transport_reports_not_sent() {
        let (_dir, relay, _transport) = test_relay().await;
        let outcome = relay.dispatch_pin(12, 1).await;
        assert!(!outcome.sent_to_device);
        assert_eq!(outcome.transport, None);
    }

    #[tokio::test]
    async fn connected_mqtt_wins() {
        let (_dir, relay, transport) = test_relay().await;
        let (client, _el) = test_mqtt();
        {
            let mut t = transport.write().await;
            t.mqtt_connected = true;
            t.mqtt_client = Some(client);
            t.last_known_device_address = Some("192.168.1.50".to_string());
        }

        let outcome = relay.dispatch_pin(12, 1).await;
        assert!(outcome.sent_to_device);
        assert_eq!(outcome.transport, Some(RelayTransport::Mqtt));
    }

    #[tokio::test]
    async fn disconnected_mqtt_falls_back_to_http() {
        let (_dir, relay, transport) = test_relay().await;
        let (client, _el) = test_mqtt();
        {
            let mut t = transport.write().await;
            t.mqtt_connected = false; // session handle exists but is down
            t.mqtt_client = Some(client);
            t.last_known_device_address = Some("127.0.0.1:1".to_string());
        }

        let outcome = relay.dispatch_pin(12, 1).await;
        assert!(outcome.sent_to_device);
        assert_eq!(outcome.transport, Some(RelayTransport::Http));
    }

    #[tokio::test]
    async fn config_publish_requires_connection() {
        let (_dir, relay, _transport) = test_relay().await;
        assert!(!relay.publish_device_config(&json!({"x": 1})).await);
    }

    #[tokio::test]
    async fn config_publish_over_live_session() {
        let (_dir, relay, transport) = test_relay().await;
        let (client, _el) = test_mqtt();
        {
            let mut t = transport.write().await;
            t.mqtt_connected = true;
            t.mqtt_client = Some(client);
        }
        assert!(relay.publish_device_config(&json!({"enableAutoLight": false})).await);
    }
}
