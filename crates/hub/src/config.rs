//! Runtime configuration: automation policy flags, schedule, upload interval
//! and the MQTT section. Persisted as `config.json` in the data directory and
//! mutated over the API.
//!
//! Loading and updating both go through [`merge_config`]: defaults first,
//! persisted/incoming fields overlaid key by key, the `mqtt` sub-object merged
//! independently. Fields added in later versions therefore always have a
//! deterministic fallback when an older file is read back.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::HubError;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub base_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: "mqtt-dashboard.com".to_string(),
            broker_port: 1883,
            username: String::new(),
            password: String::new(),
            base_topic: "esp_device".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub enable_auto_light: bool,
    pub enable_light_threshold: bool,
    pub light_threshold: f64,
    pub upload_interval_seconds: u64,
    pub auto_light_start_time: String,
    pub auto_light_end_time: String,
    pub device_name: String,
    pub mqtt: MqttConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_auto_light: false,
            enable_light_threshold: false,
            light_threshold: 40.0,
            upload_interval_seconds: 30,
            auto_light_start_time: "07:00".to_string(),
            auto_light_end_time: "22:00".to_string(),
            device_name: String::new(),
            mqtt: MqttConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Overlay `incoming` onto `base`, one top-level key at a time. Keys unknown
/// to `base` are dropped; the `mqtt` object is merged key by key rather than
/// replaced wholesale, so a partial `{"mqtt": {"enabled": true}}` update
/// keeps the stored broker credentials.
pub fn merge_config(base: &Value, incoming: &Value) -> Value {
    let mut merged = base.clone();
    let Some(incoming_map) = incoming.as_object() else {
        return merged;
    };
    if let Some(out) = merged.as_object_mut() {
        for (key, value) in incoming_map {
            match out.get_mut(key) {
                Some(existing) if key == "mqtt" => {
                    if let (Some(nested), Some(patch)) =
                        (existing.as_object_mut(), value.as_object())
                    {
                        for (k, v) in patch {
                            if nested.contains_key(k) {
                                nested.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
                Some(existing) => {
                    *existing = value.clone();
                }
                None => {} // unknown key, dropped
            }
        }
    }
    merged
}

fn config_to_value(config: &Config) -> Value {
    // Config is a plain data struct; serialization cannot fail.
    serde_json::to_value(config).unwrap_or(Value::Null)
}

/// The device-facing view of the config: everything except the `mqtt`
/// section, which is broker plumbing the device has no use for.
pub fn device_view(config: &Config) -> Value {
    let mut value = config_to_value(config);
    if let Some(map) = value.as_object_mut() {
        map.remove("mqtt");
    }
    value
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Single owner of the persisted configuration. All mutation goes through the
/// write lock and re-persists the file before returning, which serialises
/// concurrent updates against the single config snapshot.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Config>,
}

impl ConfigStore {
    /// Load `config.json` if present (merged over defaults), otherwise write
    /// the defaults out so the device and dashboard see a complete file.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let config = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let persisted: Value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                let merged = merge_config(&config_to_value(&Config::default()), &persisted);
                serde_json::from_value(merged)
                    .with_context(|| format!("invalid config in {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let defaults = Config::default();
                persist(&path, &defaults).await.context("failed to write default config")?;
                tracing::info!(path = %path.display(), "default configuration created");
                defaults
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };

        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    /// Partial merge update from the API; persists before returning.
    pub async fn update(&self, patch: &Value) -> Result<Config, HubError> {
        let mut guard = self.inner.write().await;
        let merged = merge_config(&config_to_value(&guard), patch);
        let updated: Config = serde_json::from_value(merged)
            .map_err(|e| HubError::MalformedPayload(format!("bad config update: {e}")))?;
        persist(&self.path, &updated).await?;
        *guard = updated.clone();
        Ok(updated)
    }

    /// Manual-override path: clear both automation flags and persist.
    pub async fn disable_automation(&self) -> Result<Config, HubError> {
        let mut guard = self.inner.write().await;
        let mut updated = guard.clone();
        updated.enable_auto_light = false;
        updated.enable_light_threshold = false;
        persist(&self.path, &updated).await?;
        *guard = updated.clone();
        Ok(updated)
    }
}

async fn persist(path: &Path, config: &Config) -> Result<(), HubError> {
    let bytes = serde_json::to_vec_pretty(config)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
