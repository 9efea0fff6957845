//! HTTP surface: telemetry upload, runtime config, pin control, history and
//! the live SSE event stream.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use time::format_description::well_known::Rfc3339;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config;
use crate::error::HubError;
use crate::events::EventKind;
use crate::ingest;
use crate::pins;
use crate::policy::AUTO_LIGHT_PIN;
use crate::record::{Source, TelemetryRecord};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/pins/{pin}", post(set_pin))
        .route("/pins.json", get(pins_json))
        .route("/api/latest-data", get(latest_data))
        .route("/api/history", get(history))
        .route("/api/uploads", get(list_uploads).delete(delete_all_uploads))
        .route("/api/uploads/{id}", get(get_upload).delete(delete_upload))
        .route("/events", get(events_stream))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    "autolight hub is running. See /api/config, /api/history, /events."
}

// ---------------------------------------------------------------------------
// Telemetry upload (legacy device HTTP push)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    status: &'static str,
    upload_interval_seconds: u64,
}

async fn upload(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<UploadResponse>, HubError> {
    ingest::process_report(&state, body, Source::Http).await?;
    let config = state.config.get().await;
    Ok(Json(UploadResponse {
        status: "ok",
        upload_interval_seconds: config.upload_interval_seconds,
    }))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn get_config(State(state): State<AppState>) -> Json<config::Config> {
    Json(state.config.get().await)
}

async fn update_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, HubError> {
    let old = state.config.get().await;
    let updated = state.config.update(&patch).await?;
    info!("configuration persisted");

    if updated.mqtt != old.mqtt {
        info!("mqtt config changed; signalling session restart");
        state.mqtt_restart.notify_one();
    }
    if updated.mqtt.enabled {
        // Retained, so the device sees the current config on (re)connect.
        state
            .relay
            .publish_device_config(&config::device_view(&updated))
            .await;
    }

    Ok(Json(json!({"status": "ok", "config": updated})))
}

// ---------------------------------------------------------------------------
// Pin control
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PinRequest {
    state: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PinResponse {
    status: &'static str,
    state: u8,
    sent_to_esp: bool,
}

async fn set_pin(
    State(state): State<AppState>,
    Path(pin): Path<String>,
    Json(req): Json<PinRequest>,
) -> Result<Json<PinResponse>, HubError> {
    let desired = pins::validate_state(req.state)?;
    let gpio = pins::device_gpio(&pin)
        .ok_or_else(|| HubError::InvalidState(format!("unknown pin '{pin}'")))?;

    // Explicit commands are never deduplicated: persist first, then relay.
    state.pins.set(&pin, desired).await?;
    let outcome = state.relay.dispatch_pin(gpio, desired).await;

    // Manual wins: a human touching the automation pin disables automation,
    // otherwise the next telemetry cycle would immediately revert this.
    let config = state.config.get().await;
    if pin == AUTO_LIGHT_PIN && (config.enable_auto_light || config.enable_light_threshold) {
        info!(pin = %pin, "manual override detected; disabling automation");
        let updated = state.config.disable_automation().await?;
        state
            .relay
            .publish_device_config(&config::device_view(&updated))
            .await;
    }

    Ok(Json(PinResponse {
        status: "ok",
        state: desired,
        sent_to_esp: outcome.sent_to_device,
    }))
}

async fn pins_json(State(state): State<AppState>) -> Json<std::collections::HashMap<String, u8>> {
    Json(state.pins.snapshot().await)
}

// ---------------------------------------------------------------------------
// Record queries
// ---------------------------------------------------------------------------

async fn latest_data(State(state): State<AppState>) -> Result<Json<Value>, HubError> {
    match state.records.latest().await? {
        Some(record) => Ok(Json(Value::Object(record.data))),
        None => Err(HubError::NotFound("no data available".to_string())),
    }
}

/// Flattened history for charting: `{"timestamp": ..., <payload fields>}`,
/// ascending.
async fn history(State(state): State<AppState>) -> Result<Json<Vec<Value>>, HubError> {
    let records = state.records.list_all().await?;
    let items = records.into_iter().map(flatten_record).collect();
    Ok(Json(items))
}

fn flatten_record(record: TelemetryRecord) -> Value {
    let mut out = Map::new();
    let timestamp = record
        .meta
        .time
        .format(&Rfc3339)
        .unwrap_or_else(|_| record.meta.id.clone());
    out.insert("timestamp".to_string(), Value::String(timestamp));
    out.extend(record.data);
    Value::Object(out)
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

#[derive(Serialize)]
struct UploadSummary {
    id: String,
    #[serde(with = "time::serde::rfc3339")]
    time: time::OffsetDateTime,
    source: Source,
    data: Map<String, Value>,
}

async fn list_uploads(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, HubError> {
    let page = query.page.max(1);
    let limit = query.limit.clamp(1, 100);

    let mut records = state.records.list_all().await?;
    records.reverse(); // newest first for the dashboard list
    let total = records.len();

    let items: Vec<UploadSummary> = records
        .into_iter()
        .skip((page - 1) * limit)
        .take(limit)
        .map(|r| UploadSummary {
            id: r.meta.id,
            time: r.meta.time,
            source: r.meta.source,
            data: r.data,
        })
        .collect();

    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": page,
        "limit": limit,
    })))
}

async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TelemetryRecord>, HubError> {
    state
        .records
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| HubError::NotFound(format!("no upload with id '{id}'")))
}

async fn delete_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HubError> {
    if !state.records.delete(&id).await? {
        return Err(HubError::NotFound(format!("no upload with id '{id}'")));
    }
    state.events.publish(EventKind::Deleted, json!({"id": id}));
    Ok(Json(json!({"status": "ok"})))
}

async fn delete_all_uploads(State(state): State<AppState>) -> Result<Json<Value>, HubError> {
    let deleted = state.records.delete_all().await?;
    state.events.publish(EventKind::DeletedAll, json!({}));
    Ok(Json(json!({"status": "ok", "deleted": deleted})))
}

// ---------------------------------------------------------------------------
// Live updates (SSE)
// ---------------------------------------------------------------------------

async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = SseEvent::default()
                        .event(event.kind.as_str())
                        .data(event.payload.to_string());
                    return Some((Ok(sse), rx));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Slow consumer: drop what it missed, keep it attached.
                    warn!(missed, "sse subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    use anyhow::Context;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("web listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
