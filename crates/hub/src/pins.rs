//! Canonical actuator (pin) state, persisted as a single `pins.json`
//! snapshot. This store is consulted before any command is relayed: the
//! automation path only fires the relay on an actual transition, while the
//! manual path always writes and always relays.

use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::HubError;

/// Logical pin names with a dedicated GPIO on the device board.
const PIN_GPIO_MAP: &[(&str, u8)] = &[("pin12", 12), ("pin13", 13), ("pin14", 14)];

/// Resolve a logical pin name (`pin<n>`) to the device GPIO number.
/// Unmapped names pass their numeric suffix through.
pub fn device_gpio(pin_name: &str) -> Option<u8> {
    if let Some((_, gpio)) = PIN_GPIO_MAP.iter().find(|(name, _)| *name == pin_name) {
        return Some(*gpio);
    }
    pin_name.strip_prefix("pin")?.parse().ok()
}

/// Pin states are binary; anything else is rejected before any side effect.
pub fn validate_state(state: i64) -> Result<u8, HubError> {
    match state {
        0 => Ok(0),
        1 => Ok(1),
        other => Err(HubError::InvalidState(format!(
            "state must be 0 or 1, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Desired state already current; no write, no relay.
    Unchanged,
    /// Transition persisted; the caller should relay the command.
    Changed,
}

pub struct PinStore {
    path: PathBuf,
    states: Mutex<HashMap<String, u8>>,
}

impl PinStore {
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let states = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "unreadable pin state, starting empty: {e}");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            states: Mutex::new(states),
        })
    }

    /// Current state of a pin; an absent key reads as 0 (off).
    pub async fn get(&self, pin: &str) -> u8 {
        self.states.lock().await.get(pin).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> HashMap<String, u8> {
        self.states.lock().await.clone()
    }

    /// Automation path: persist only on transition, so repeated identical
    /// telemetry never re-issues commands.
    pub async fn apply_desired(&self, pin: &str, desired: u8) -> Result<Applied, HubError> {
        validate_state(i64::from(desired))?;
        let mut states = self.states.lock().await;
        let current = states.get(pin).copied().unwrap_or(0);
        if current == desired {
            return Ok(Applied::Unchanged);
        }
        states.insert(pin.to_string(), desired);
        self.persist(&states).await?;
        Ok(Applied::Changed)
    }

    /// Manual path: always persist, even when the value already matches, so
    /// an explicit command is never swallowed by a stale snapshot.
    pub async fn set(&self, pin: &str, state: u8) -> Result<(), HubError> {
        validate_state(i64::from(state))?;
        let mut states = self.states.lock().await;
        states.insert(pin.to_string(), state);
        self.persist(&states).await?;
        tracing::info!(pin, state, "pin state persisted");
        Ok(())
    }

    async fn persist(&self, states: &HashMap<String, u8>) -> Result<(), HubError> {
        let bytes = serde_json::to_vec_pretty(&json!(states))?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
