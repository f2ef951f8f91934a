//! REST adapter: maps `/api/v1/...` verbs onto the tag store and the
//! health registry. Stateless; all state lives in [`SharedAppState`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::health::HealthRegistry;
use crate::poll::poller::{WriteHandle, WriteRequest};
use crate::tags::serialize::{effective_quality, parse_value, value_to_json};
use crate::tags::store::{TagPatch, TagStore};
use crate::tags::structures::{PlcName, TagDatatype, TagRecord};

#[derive(Clone)]
pub struct SharedAppState {
    pub store: TagStore,
    pub health: Arc<HealthRegistry>,
    /// Write-through handle per registered PLC; a tag's `plc` must name one
    /// of these at insertion time.
    pub writers: Arc<HashMap<PlcName, WriteHandle>>,
    pub shutdown: CancellationToken,
}

pub fn create_api_routes() -> Router<SharedAppState> {
    Router::new()
        .route("/api/v1/tags", post(create_tags).get(list_tags))
        .route(
            "/api/v1/tags/:id",
            get(get_tag).patch(patch_tag).delete(delete_tag),
        )
        .route("/api/v1/tags/import", put(import_tags))
        .route("/api/v1/hmi/data", get(hmi_data))
        .route("/api/v1/hmi/config", get(hmi_config))
        .route("/api/v1/hmi/health", get(hmi_health))
        .route("/api/v1/hmi/ready", get(hmi_ready))
        .route("/api/v1/hmi/stop", post(hmi_stop))
}

fn status_for(e: &GatewayError) -> StatusCode {
    match e {
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::AlreadyExists(_) => StatusCode::CONFLICT,
        GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        GatewayError::TypeMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Unavailable(_) | GatewayError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: GatewayError) -> (StatusCode, Json<JsonValue>) {
    (status_for(&e), Json(json!({ "error": e.to_string() })))
}

/// Serialize a record, substituting the client-facing quality (non-finite
/// reals read `Bad` since their value crosses the boundary as null).
fn record_json(record: &TagRecord) -> JsonValue {
    let mut value = serde_json::to_value(record).unwrap_or(JsonValue::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "quality".to_string(),
            serde_json::to_value(effective_quality(record)).unwrap_or(JsonValue::Null),
        );
    }
    value
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Deserialize)]
struct CreateTag {
    id: String,
    #[serde(default)]
    name: Option<String>,
    plc: PlcName,
    address: String,
    datatype: TagDatatype,
    #[serde(default)]
    value: Option<JsonValue>,
    #[serde(default)]
    writable: Option<bool>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    scale_mul: Option<f64>,
    #[serde(default)]
    scale_add: Option<f64>,
    #[serde(default)]
    decimals: Option<u32>,
}

fn build_record(payload: CreateTag, state: &SharedAppState) -> Result<TagRecord, GatewayError> {
    if payload.id.is_empty() {
        return Err(GatewayError::InvalidArgument("id must not be empty".into()));
    }
    if !state.writers.contains_key(&payload.plc) {
        return Err(GatewayError::InvalidArgument(format!(
            "plc {} has no registered driver",
            payload.plc
        )));
    }
    let mut record = TagRecord::new(payload.id, payload.plc, payload.address, payload.datatype);
    if let Some(name) = payload.name {
        record.name = name;
    }
    record.writable = payload.writable.unwrap_or(false);
    record.enabled = payload.enabled.unwrap_or(true);
    record.description = payload.description;
    record.scale_mul = payload.scale_mul.unwrap_or(1.0);
    record.scale_add = payload.scale_add.unwrap_or(0.0);
    record.decimals = payload.decimals;
    if let Some(raw) = payload.value {
        record.value = parse_value(payload.datatype, &raw)?;
    }
    Ok(record)
}

async fn create_tags(
    State(state): State<SharedAppState>,
    Json(body): Json<JsonValue>,
) -> impl IntoResponse {
    // A single record, or `{"tags": [...]}` for batches.
    if let Some(batch) = body.get("tags") {
        let payloads: Vec<CreateTag> = match serde_json::from_value(batch.clone()) {
            Ok(p) => p,
            Err(e) => return error_body(GatewayError::InvalidArgument(e.to_string())),
        };
        let mut created = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let record = match build_record(payload, &state) {
                Ok(r) => r,
                Err(e) => return error_body(e),
            };
            let id = record.id.clone();
            if let Err(e) = state.store.insert(record) {
                return error_body(e);
            }
            created.push(id);
        }
        info!("created {} tags over REST", created.len());
        return (StatusCode::OK, Json(json!({ "created": created })));
    }

    let payload: CreateTag = match serde_json::from_value(body) {
        Ok(p) => p,
        Err(e) => return error_body(GatewayError::InvalidArgument(e.to_string())),
    };
    let record = match build_record(payload, &state) {
        Ok(r) => r,
        Err(e) => return error_body(e),
    };
    let id = record.id.clone();
    if let Err(e) = state.store.insert(record) {
        return error_body(e);
    }
    let record = match state.store.get(&id) {
        Ok(r) => r,
        Err(e) => return error_body(e),
    };
    info!(%id, "tag created over REST");
    (StatusCode::OK, Json(record_json(&record)))
}

async fn list_tags(State(state): State<SharedAppState>) -> impl IntoResponse {
    let mut records = state.store.snapshot();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    let body: Vec<JsonValue> = records.iter().map(record_json).collect();
    Json(JsonValue::Array(body))
}

async fn get_tag(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&id) {
        Ok(record) => (StatusCode::OK, Json(record_json(&record))),
        Err(e) => error_body(e),
    }
}

/// Only `value` and `writable` are mutable after creation.
#[derive(Debug, Deserialize)]
struct PatchBody {
    #[serde(default)]
    value: Option<JsonValue>,
    #[serde(default)]
    writable: Option<bool>,
}

async fn patch_tag(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchBody>,
) -> impl IntoResponse {
    let record = match state.store.get(&id) {
        Ok(r) => r,
        Err(e) => return error_body(e),
    };

    let mut patch = TagPatch {
        writable: body.writable,
        ..Default::default()
    };

    if let Some(raw) = body.value {
        if !record.writable {
            return error_body(GatewayError::InvalidArgument(format!(
                "tag {id} is not writable"
            )));
        }
        let value = match parse_value(record.datatype, &raw) {
            Ok(v) => v,
            Err(e) => return error_body(e),
        };
        // Forward to the PLC before touching the store so a full queue
        // leaves the record untouched.
        if let Some(writer) = state.writers.get(&record.plc) {
            let request = WriteRequest {
                id: id.clone(),
                address: record.address.clone(),
                value: value.clone(),
            };
            if let Err(e) = writer.submit(request) {
                warn!(%id, "write-through rejected: {e}");
                return error_body(e);
            }
        }
        patch.value = Some(value);
    }

    match state.store.patch(&id, patch) {
        Ok(updated) => (StatusCode::OK, Json(record_json(&updated))),
        Err(e) => error_body(e),
    }
}

async fn delete_tag(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "deleted": id }))),
        Err(e) => error_body(e),
    }
}

#[derive(Debug, Deserialize)]
struct ImportQuery {
    #[serde(default)]
    replace_all: Option<String>,
}

async fn import_tags(
    State(state): State<SharedAppState>,
    Query(query): Query<ImportQuery>,
    Json(body): Json<JsonValue>,
) -> impl IntoResponse {
    let payloads: Vec<CreateTag> = match body.get("tags") {
        Some(tags) => match serde_json::from_value(tags.clone()) {
            Ok(p) => p,
            Err(e) => return error_body(GatewayError::InvalidArgument(e.to_string())),
        },
        None => {
            return error_body(GatewayError::InvalidArgument("tags must be a list".into()));
        }
    };

    if matches!(query.replace_all.as_deref(), Some("1") | Some("true") | Some("yes")) {
        state.store.clear();
    }

    let mut imported = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let record = match build_record(payload, &state) {
            Ok(r) => r,
            Err(e) => return error_body(e),
        };
        let id = record.id.clone();
        if let Err(e) = state.store.insert(record) {
            return error_body(e);
        }
        imported.push(id);
    }
    info!("imported {} tags over REST", imported.len());
    (StatusCode::OK, Json(json!({ "imported": imported })))
}

/// Snapshot of all current values keyed by id. Per-record consistency
/// only; cross-record atomicity is not promised.
async fn hmi_data(State(state): State<SharedAppState>) -> impl IntoResponse {
    let tags: serde_json::Map<String, JsonValue> = state
        .store
        .snapshot()
        .iter()
        .map(|r| (r.id.clone(), value_to_json(&r.value)))
        .collect();
    Json(json!({ "timestamp": unix_now(), "tags": tags }))
}

/// Tag metadata for the HMI to bootstrap its table.
async fn hmi_config(State(state): State<SharedAppState>) -> impl IntoResponse {
    let mut records = state.store.snapshot();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    let tags: Vec<JsonValue> = records.iter().map(record_json).collect();
    Json(json!({ "tags": tags }))
}

async fn hmi_health(State(state): State<SharedAppState>) -> impl IntoResponse {
    let age = state.health.last_poll_age();
    let healthy = matches!(age, Some(a) if a < 5.0);
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "timestamp": unix_now(),
        "ready": state.health.is_ready(),
        "readiness": state.health.readiness(),
        "last_poll_age_seconds": age,
        "plc_health": state.health.snapshot_all(),
    }))
}

async fn hmi_ready(State(state): State<SharedAppState>) -> impl IntoResponse {
    if state.health.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ready": false })))
    }
}

/// Graceful stop: flips readiness to `stopping` and cancels the supervisor
/// token; pollers and servers wind down after this response is sent.
async fn hmi_stop(State(state): State<SharedAppState>) -> impl IntoResponse {
    info!("stop requested over REST");
    state.health.set_stopping();
    state.shutdown.cancel();
    Json(json!({ "stopping": true }))
}
