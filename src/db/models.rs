//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A managed appliance, keyed by its MAC-derived device id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
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
    /// Cached display hint; authoritative liveness is derived from `last_seen`.
    pub status: String,
    pub wan_ip: Option<String>,
    pub geo_location: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
}

/// The mutable state a device reports on a single check-in.
///
/// `None` fields were not reported and must retain their stored values.
/// Counters reported lower than the stored values are a device-side reset
/// and overwrite (last-write-wins, no clamping).
#[derive(Debug, Clone, Default)]
pub struct DeviceReport {
    pub device_id: String,
    pub mac_address: Option<String>,
    pub wifi_ip: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_signal: Option<i64>,
    pub mode: Option<String>,
    pub firmware: Option<String>,
    pub uptime: Option<i64>,
    pub blocked_inbound: Option<i64>,
    pub blocked_outbound: Option<i64>,
    pub wan_ip: Option<String>,
    pub geo_location: Option<String>,
}

/// An immutable record of blocks accumulated between two check-ins.
#[derive(Debug, Clone, Serialize)]
pub struct BlockEvent {
    pub id: i64,
    pub device_id: String,
    pub delta_inbound: i64,
    pub delta_outbound: i64,
    pub total_inbound: i64,
    pub total_outbound: i64,
    pub time: DateTime<Utc>,
}

/// A queued administrative command, unicast (`device_id` set) or broadcast
/// (`device_id` is `None`).
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: i64,
    pub device_id: Option<String>,
    pub command_type: String,
    /// Command-type-specific JSON document, stored verbatim.
    pub payload: String,
    pub status: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A point-in-time health snapshot reported alongside a check-in.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub device_id: String,
    pub disk_total_mb: Option<i64>,
    pub disk_used_mb: Option<i64>,
    pub mem_total_mb: Option<i64>,
    pub mem_used_mb: Option<i64>,
    pub cpu_load: Option<f64>,
    pub temp_celsius: Option<f64>,
    pub time: DateTime<Utc>,
}
