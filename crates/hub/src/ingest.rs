//! Telemetry ingestion pipeline, shared by both transports:
//! normalize -> persist -> broadcast -> policy decision -> actuation -> relay.
//!
//! One sequential pass per inbound report. Errors upstream of persistence
//! (malformed payload, storage failure) abort the pipeline for that report
//! only; everything after the record is persisted is best-effort.

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::error::HubError;
use crate::events::EventKind;
use crate::pins::{self, Applied};
use crate::policy::{self, Decision, AUTO_LIGHT_PIN};
use crate::record::{generate_id, RecordMeta, Source, TelemetryRecord};
use crate::state::AppState;

/// Turn a decoded payload into a canonical record. Pure apart from id and
/// timestamp generation; fails only when the payload is not a JSON object.
pub fn normalize(
    raw: Value,
    source: Source,
    now: OffsetDateTime,
) -> Result<TelemetryRecord, HubError> {
    let Value::Object(data) = raw else {
        return Err(HubError::MalformedPayload(format!(
            "expected a JSON object, got {}",
            json_type_name(&raw)
        )));
    };
    Ok(TelemetryRecord {
        meta: RecordMeta {
            id: generate_id(now),
            time: now,
            source,
        },
        data,
    })
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Process one inbound report end to end. Returns the persisted record so
/// the HTTP handler can acknowledge it.
pub async fn process_report(
    state: &AppState,
    raw: Value,
    source: Source,
) -> Result<TelemetryRecord, HubError> {
    let record = match normalize(raw, source, OffsetDateTime::now_utc()) {
        Ok(record) => record,
        Err(e) => {
            warn!(%source, "dropping report: {e}");
            return Err(e);
        }
    };

    state.records.append(&record).await?;
    info!(id = %record.meta.id, %source, "telemetry persisted");

    // Remember where the device called from; this is the relay's fallback
    // path when MQTT is down.
    if source == Source::Http {
        if let Some(ip) = record.data.get("ip").and_then(Value::as_str) {
            let mut t = state.transport.write().await;
            t.last_known_device_address = Some(ip.to_string());
        }
    }

    state
        .events
        .publish(EventKind::New, Value::Object(record.data.clone()));

    evaluate_automation(state, &record).await;

    Ok(record)
}

/// Compare the policy's desired state against the canonical pin state and
/// relay a command only on an actual transition.
async fn evaluate_automation(state: &AppState, record: &TelemetryRecord) {
    let config = state.config.get().await;
    let now_minutes =
        policy::local_minutes(OffsetDateTime::now_utc(), state.settings.tz_offset_minutes);

    let desired = match policy::decide(&config, &record.data, now_minutes) {
        Decision::NoOp => return,
        Decision::On => 1,
        Decision::Off => 0,
    };

    match state.pins.apply_desired(AUTO_LIGHT_PIN, desired).await {
        Ok(Applied::Unchanged) => {}
        Ok(Applied::Changed) => {
            info!(pin = AUTO_LIGHT_PIN, state = desired, "automation changing pin");
            let Some(gpio) = pins::device_gpio(AUTO_LIGHT_PIN) else {
                return;
            };
            let outcome = state.relay.dispatch_pin(gpio, desired).await;
            if !outcome.sent_to_device {
                // State is already persisted and authoritative; the device
                // catches up on the next cycle.
                warn!(pin = AUTO_LIGHT_PIN, "automation command not delivered");
            }
        }
        Err(e) => {
            error!(pin = AUTO_LIGHT_PIN, "failed to persist automation pin state: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
