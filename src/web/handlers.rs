//! HTTP request handlers.

use super::AppState;
use crate::db::{Command, DbError, Device, MetricSnapshot};
use crate::fleet::{
    self, enqueue_command, process_checkin, CheckinError, CheckinRequest, CommandError,
};

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};

// ============================================================================
// Wire types
// ============================================================================

/// A device as exposed over the API, with liveness derived from `last_seen`
/// rather than the cached status hint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device_id: String,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub mac_address: Option<String>,
    pub wifi_ip: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_signal: Option<i64>,
    pub mode: Option<String>,
    pub firmware: Option<String>,
    pub uptime: Option<i64>,
    pub blocked_inbound: i64,
    pub blocked_outbound: i64,
    pub status: String,
    pub online: bool,
    pub wan_ip: Option<String>,
    pub geo_location: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
}

impl DeviceView {
    fn from_device(d: Device, now: DateTime<Utc>) -> Self {
        let online = fleet::is_online(d.last_seen, now);
        Self {
            device_id: d.device_id,
            name: d.name,
            owner: d.owner,
            mac_address: d.mac_address,
            wifi_ip: d.wifi_ip,
            wifi_ssid: d.wifi_ssid,
            wifi_signal: d.wifi_signal,
            mode: d.mode,
            firmware: d.firmware,
            uptime: d.uptime,
            blocked_inbound: d.blocked_inbound,
            blocked_outbound: d.blocked_outbound,
            status: d.status,
            online,
            wan_ip: d.wan_ip,
            geo_location: d.geo_location,
            last_seen: d.last_seen,
            first_seen: d.first_seen,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEventView {
    pub id: i64,
    pub device_id: String,
    pub delta_inbound: i64,
    pub delta_outbound: i64,
    pub total_inbound: i64,
    pub total_outbound: i64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandView {
    pub id: i64,
    pub device_id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: Value,
    pub status: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommandView {
    fn from_command(c: Command) -> Self {
        Self {
            id: c.id,
            device_id: c.device_id,
            command_type: c.command_type,
            payload: serde_json::from_str(&c.payload)
                .unwrap_or_else(|_| Value::Object(Default::default())),
            status: c.status,
            result: c.result,
            created_at: c.created_at,
            sent_at: c.sent_at,
            completed_at: c.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsView {
    pub disk_total_mb: Option<i64>,
    pub disk_used_mb: Option<i64>,
    pub mem_total_mb: Option<i64>,
    pub mem_used_mb: Option<i64>,
    pub cpu_load: Option<f64>,
    pub temp_celsius: Option<f64>,
    pub time: DateTime<Utc>,
}

impl MetricsView {
    fn from_snapshot(m: MetricSnapshot) -> Self {
        Self {
            disk_total_mb: m.disk_total_mb,
            disk_used_mb: m.disk_used_mb,
            mem_total_mb: m.mem_total_mb,
            mem_used_mb: m.mem_used_mb,
            cpu_load: m.cpu_load,
            temp_celsius: m.temp_celsius,
            time: m.time,
        }
    }
}

fn error_body(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(json!({"success": false, "error": message}))).into_response()
}

// ============================================================================
// Check-in (device-facing)
// ============================================================================

/// Check whether the request presents the device API key, either as
/// `Authorization: Bearer <key>` or as the raw key.
fn api_key_ok(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let presented = value.strip_prefix("Bearer ").unwrap_or(value);
    presented == expected
}

/// Resolve the caller address, honoring X-Forwarded-For from a fronting proxy.
fn caller_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

pub async fn handle_checkin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CheckinRequest>,
) -> impl IntoResponse {
    if !api_key_ok(&headers, &state.config.api_key) {
        return error_body(StatusCode::UNAUTHORIZED, "invalid or missing API key").into_response();
    }

    let ip = caller_ip(&headers, addr);
    let geo_location = state.geo.lookup(ip).await;

    match process_checkin(&state.store, &req, Some(ip.to_string()), geo_location) {
        Ok(resp) => Json(resp).into_response(),
        Err(CheckinError::MissingDeviceId) => {
            error_body(StatusCode::BAD_REQUEST, "deviceId is required").into_response()
        }
        Err(CheckinError::Db(e)) => {
            tracing::error!(error = %e, "check-in failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

// ============================================================================
// Commands (administrative)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommandRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

pub async fn handle_create_command(
    State(state): State<AppState>,
    Json(req): Json<CreateCommandRequest>,
) -> impl IntoResponse {
    let payload = req.payload.unwrap_or_else(|| json!({}));
    let device_id = req
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match enqueue_command(&state.store, device_id, &req.command_type, &payload) {
        Ok(command) => Json(CommandView::from_command(command)).into_response(),
        Err(e @ CommandError::InvalidCommandType(_)) => {
            error_body(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
        Err(e @ CommandError::InvalidPayload(_)) => {
            error_body(StatusCode::BAD_REQUEST, &e.to_string()).into_response()
        }
        Err(e @ CommandError::DeviceNotFound(_)) => {
            error_body(StatusCode::NOT_FOUND, &e.to_string()).into_response()
        }
        Err(CommandError::Db(e)) => {
            tracing::error!(error = %e, "command creation failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsQuery {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn handle_list_commands(
    State(state): State<AppState>,
    Query(query): Query<CommandsQuery>,
) -> impl IntoResponse {
    match state
        .store
        .list_commands(query.device_id.as_deref(), query.status.as_deref())
    {
        Ok(commands) => Json(
            commands
                .into_iter()
                .map(CommandView::from_command)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "command listing failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

// ============================================================================
// Fleet read (dashboard-facing)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetResponse {
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub total_inbound: i64,
    pub total_outbound: i64,
    pub devices: Vec<DeviceView>,
    pub recent_events: Vec<BlockEventView>,
}

pub async fn handle_fleet(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();

    // Lazy sweep instead of a background scheduler; a sweep failure only
    // leaves the cached hints stale, the derived `online` flags stay correct.
    if let Err(e) = state.store.mark_offline_devices(fleet::offline_cutoff(now)) {
        tracing::warn!(error = %e, "offline sweep failed");
    }

    let devices = match state.store.get_devices() {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "fleet read failed");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
        }
    };

    let views: Vec<DeviceView> = devices
        .into_iter()
        .map(|d| DeviceView::from_device(d, now))
        .collect();
    let online = views.iter().filter(|d| d.online).count();
    let total_inbound = views.iter().map(|d| d.blocked_inbound).sum();
    let total_outbound = views.iter().map(|d| d.blocked_outbound).sum();

    let recent_events = state
        .store
        .recent_block_events(50)
        .unwrap_or_default()
        .into_iter()
        .map(|e| BlockEventView {
            id: e.id,
            device_id: e.device_id,
            delta_inbound: e.delta_inbound,
            delta_outbound: e.delta_outbound,
            total_inbound: e.total_inbound,
            total_outbound: e.total_outbound,
            time: e.time,
        })
        .collect();

    Json(FleetResponse {
        total_devices: views.len(),
        online_devices: online,
        offline_devices: views.len() - online,
        total_inbound,
        total_outbound,
        devices: views,
        recent_events,
    })
    .into_response()
}

// ============================================================================
// Devices (administrative)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetailResponse {
    #[serde(flatten)]
    pub device: DeviceView,
    pub latest_metrics: Option<MetricsView>,
}

pub async fn handle_get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let device = match state.store.get_device(&id) {
        Ok(d) => d,
        Err(DbError::NotFound) => {
            return error_body(StatusCode::NOT_FOUND, "device not found").into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "device read failed");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
        }
    };
    let latest_metrics = state
        .store
        .latest_metrics(&id)
        .unwrap_or_default()
        .map(MetricsView::from_snapshot);

    Json(DeviceDetailResponse {
        device: DeviceView::from_device(device, Utc::now()),
        latest_metrics,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn handle_rename_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> impl IntoResponse {
    match state.store.rename_device(&id, &req.name) {
        Ok(device) => Json(DeviceView::from_device(device, Utc::now())).into_response(),
        Err(DbError::NotFound) => error_body(StatusCode::NOT_FOUND, "device not found").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "rename failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub device_id: String,
    pub owner: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn handle_register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let device_id = req.device_id.trim();
    let owner = req.owner.trim();
    if device_id.is_empty() || owner.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "deviceId and owner are required")
            .into_response();
    }

    match state.store.register_device(device_id, owner, req.name.as_deref()) {
        Ok(device) => Json(DeviceView::from_device(device, Utc::now())).into_response(),
        Err(DbError::NotFound) => error_body(StatusCode::NOT_FOUND, "device not found").into_response(),
        Err(DbError::Conflict) => {
            error_body(StatusCode::CONFLICT, "device already registered to another owner")
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "registration failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_device(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(DbError::NotFound) => error_body(StatusCode::NOT_FOUND, "device not found").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "device delete failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
        }
    }
}
