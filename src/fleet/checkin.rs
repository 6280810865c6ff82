//! Check-in reconciler: the protocol handler run once per device phone-home.
//!
//! Devices have no push channel; every exchange is device-initiated pull.
//! A check-in merges reported state into the registry, records counter
//! deltas and metrics, ingests outcomes of previously delivered commands,
//! and drains pending commands into the response.

use crate::db::{DbError, DeviceReport, MetricSnapshot, Store};
use crate::fleet::{CommandStatus, DRAIN_LIMIT};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Check-in error types. Everything else in the protocol is best-effort.
#[derive(Error, Debug)]
pub enum CheckinError {
    #[error("deviceId is required")]
    MissingDeviceId,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// The body a device POSTs when phoning home.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckinRequest {
    pub device_id: Option<String>,
    pub wifi_ip: Option<String>,
    pub mode: Option<String>,
    pub firmware: Option<String>,
    pub uptime: Option<i64>,
    pub blocked_inbound: Option<i64>,
    pub blocked_outbound: Option<i64>,
    pub delta_inbound: Option<i64>,
    pub delta_outbound: Option<i64>,
    pub wifi_ssid: Option<String>,
    pub wifi_signal: Option<i64>,
    pub mac_address: Option<String>,
    pub metrics: Option<MetricsReport>,
    pub command_results: Vec<CommandResultReport>,
}

/// Disk/memory/cpu/temperature snapshot piggy-backed on a check-in.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsReport {
    pub disk_total_mb: Option<i64>,
    pub disk_used_mb: Option<i64>,
    pub mem_total_mb: Option<i64>,
    pub mem_used_mb: Option<i64>,
    pub cpu_load: Option<f64>,
    pub temp_celsius: Option<f64>,
}

/// A device-reported outcome for a previously delivered command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResultReport {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// A command as delivered to a device in the check-in response.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    pub id: i64,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: Option<String>,
}

/// Response to a successful check-in: ack plus due commands.
#[derive(Debug, Clone, Serialize)]
pub struct CheckinResponse {
    pub success: bool,
    pub message: String,
    pub device: DeviceSummary,
    pub commands: Vec<CommandEnvelope>,
}

/// Process one check-in.
///
/// The registry upsert and the command drain are the critical path; their
/// failure fails the call. Metrics, block events and result ingestion are
/// enrichment: each failure is logged and the check-in proceeds, because a
/// device can tolerate a lost metrics sample but not a missed command
/// delivery or a stale presence record.
///
/// `wan_ip` and `geo_location` come from the transport layer (caller
/// address plus best-effort geolocation) and ride the same upsert.
pub fn process_checkin(
    store: &Store,
    req: &CheckinRequest,
    wan_ip: Option<String>,
    geo_location: Option<String>,
) -> Result<CheckinResponse, CheckinError> {
    let device_id = match req.device_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id,
        _ => return Err(CheckinError::MissingDeviceId),
    };
    let now = Utc::now();

    let report = DeviceReport {
        device_id: device_id.to_string(),
        mac_address: req.mac_address.clone(),
        wifi_ip: req.wifi_ip.clone(),
        wifi_ssid: req.wifi_ssid.clone(),
        wifi_signal: req.wifi_signal,
        mode: req.mode.clone(),
        firmware: req.firmware.clone(),
        uptime: req.uptime,
        blocked_inbound: req.blocked_inbound,
        blocked_outbound: req.blocked_outbound,
        wan_ip,
        geo_location,
    };
    let device = store.upsert_device(&report, now)?;

    if let Some(m) = &req.metrics {
        let snapshot = MetricSnapshot {
            device_id: device_id.to_string(),
            disk_total_mb: m.disk_total_mb,
            disk_used_mb: m.disk_used_mb,
            mem_total_mb: m.mem_total_mb,
            mem_used_mb: m.mem_used_mb,
            cpu_load: m.cpu_load,
            temp_celsius: m.temp_celsius,
            time: now,
        };
        if let Err(e) = store.insert_metrics(&snapshot) {
            tracing::warn!(device_id, error = %e, "failed to record metrics snapshot");
        }
    }

    let delta_inbound = req.delta_inbound.unwrap_or(0);
    let delta_outbound = req.delta_outbound.unwrap_or(0);
    if delta_inbound > 0 || delta_outbound > 0 {
        if let Err(e) = store.insert_block_event(
            device_id,
            delta_inbound,
            delta_outbound,
            device.blocked_inbound,
            device.blocked_outbound,
            now,
        ) {
            tracing::warn!(device_id, error = %e, "failed to record block event");
        }
    }

    for result in &req.command_results {
        let status = match CommandStatus::parse(&result.status) {
            Some(s) if s.is_reportable() => s,
            _ => {
                tracing::warn!(
                    device_id,
                    command_id = result.id,
                    status = %result.status,
                    "ignoring command result with unreportable status"
                );
                continue;
            }
        };
        match store.ingest_result(result.id, status.as_str(), result.message.as_deref(), now) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(device_id, command_id = result.id, "command result for unknown id");
            }
            Err(e) => {
                tracing::warn!(device_id, command_id = result.id, error = %e, "failed to ingest command result");
            }
        }
    }

    let drained = store.drain_pending(device_id, DRAIN_LIMIT, now)?;
    if !drained.is_empty() {
        tracing::info!(device_id, count = drained.len(), "delivering commands");
    }
    let commands = drained
        .into_iter()
        .map(|c| CommandEnvelope {
            id: c.id,
            command_type: c.command_type,
            payload: serde_json::from_str(&c.payload).unwrap_or_else(|_| Value::Object(Default::default())),
        })
        .collect();

    Ok(CheckinResponse {
        success: true,
        message: "check-in processed".to_string(),
        device: DeviceSummary {
            id: device.device_id,
            name: device.name,
        },
        commands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::enqueue_command;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn checkin(device_id: &str) -> CheckinRequest {
        CheckinRequest {
            device_id: Some(device_id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_device_id_rejected() {
        let (_tmp, store) = test_store();
        let req = CheckinRequest::default();
        assert!(matches!(
            process_checkin(&store, &req, None, None),
            Err(CheckinError::MissingDeviceId)
        ));

        let blank = CheckinRequest {
            device_id: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            process_checkin(&store, &blank, None, None),
            Err(CheckinError::MissingDeviceId)
        ));
    }

    #[test]
    fn test_checkin_is_idempotent_create() {
        let (_tmp, store) = test_store();
        let mut req = checkin("AA:BB");
        req.firmware = Some("2.1".to_string());

        let first = process_checkin(&store, &req, None, None).unwrap();
        assert!(first.success);
        assert_eq!(first.device.id, "AA:BB");

        let before = store.get_device("AA:BB").unwrap();
        process_checkin(&store, &req, None, None).unwrap();
        let after = store.get_device("AA:BB").unwrap();
        assert_eq!(after.first_seen, before.first_seen);
        assert!(after.last_seen >= before.last_seen);
    }

    #[test]
    fn test_zero_deltas_create_no_event() {
        let (_tmp, store) = test_store();
        let mut req = checkin("AA:BB");
        req.blocked_inbound = Some(100);
        req.delta_inbound = Some(0);
        req.delta_outbound = Some(0);
        process_checkin(&store, &req, None, None).unwrap();
        assert!(store.recent_block_events(50).unwrap().is_empty());
    }

    #[test]
    fn test_metrics_recorded_best_effort() {
        let (_tmp, store) = test_store();
        let mut req = checkin("AA:BB");
        req.metrics = Some(MetricsReport {
            disk_total_mb: Some(8192),
            disk_used_mb: Some(2048),
            mem_total_mb: Some(1024),
            mem_used_mb: Some(600),
            cpu_load: Some(0.35),
            temp_celsius: Some(51.5),
        });
        process_checkin(&store, &req, None, None).unwrap();

        let snapshot = store.latest_metrics("AA:BB").unwrap().unwrap();
        assert_eq!(snapshot.disk_used_mb, Some(2048));
        assert_eq!(snapshot.cpu_load, Some(0.35));
    }

    #[test]
    fn test_enrichment_rides_the_upsert() {
        let (_tmp, store) = test_store();
        let req = checkin("AA:BB");
        process_checkin(
            &store,
            &req,
            Some("203.0.113.9".to_string()),
            Some("Reykjavik, Iceland".to_string()),
        )
        .unwrap();
        let device = store.get_device("AA:BB").unwrap();
        assert_eq!(device.wan_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(device.geo_location.as_deref(), Some("Reykjavik, Iceland"));
    }

    #[test]
    fn test_bad_result_entries_do_not_fail_checkin() {
        let (_tmp, store) = test_store();
        process_checkin(&store, &checkin("AA:BB"), None, None).unwrap();
        let cmd = enqueue_command(&store, Some("AA:BB"), "reboot", &json!({})).unwrap();

        let mut req = checkin("AA:BB");
        req.command_results = vec![
            // unknown id
            CommandResultReport {
                id: 424242,
                status: "completed".to_string(),
                message: None,
            },
            // unreportable status
            CommandResultReport {
                id: cmd.id,
                status: "pending".to_string(),
                message: None,
            },
            // garbage status
            CommandResultReport {
                id: cmd.id,
                status: "exploded".to_string(),
                message: None,
            },
        ];
        let resp = process_checkin(&store, &req, None, None).unwrap();
        assert!(resp.success);
        // The valid command was drained by this same check-in
        assert_eq!(resp.commands.len(), 1);
        assert_eq!(store.get_command(cmd.id).unwrap().status, "sent");
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (_tmp, store) = test_store();

        // (1) first check-in with totals only
        let mut req = checkin("AA:BB");
        req.blocked_inbound = Some(100);
        req.blocked_outbound = Some(20);
        let resp = process_checkin(&store, &req, None, None).unwrap();
        assert!(resp.commands.is_empty());
        let device = store.get_device("AA:BB").unwrap();
        assert_eq!(device.blocked_inbound, 100);
        assert_eq!(device.blocked_outbound, 20);
        assert!(store.recent_block_events(50).unwrap().is_empty());

        // (2) admin enqueues a targeted blocklist update
        let cmd =
            enqueue_command(&store, Some("AA:BB"), "update_blocklist", &json!({"url": "https://x"}))
                .unwrap();

        // (3) second check-in reports a delta and collects the command
        let mut req = checkin("AA:BB");
        req.blocked_inbound = Some(105);
        req.delta_inbound = Some(5);
        let resp = process_checkin(&store, &req, None, None).unwrap();
        assert_eq!(resp.commands.len(), 1);
        assert_eq!(resp.commands[0].id, cmd.id);
        assert_eq!(resp.commands[0].command_type, "update_blocklist");
        assert_eq!(resp.commands[0].payload, json!({"url": "https://x"}));
        assert_eq!(store.get_command(cmd.id).unwrap().status, "sent");

        let events = store.recent_block_events(50).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delta_inbound, 5);
        assert_eq!(events[0].total_inbound, 105);

        // (4) third check-in reports the outcome
        let mut req = checkin("AA:BB");
        req.command_results = vec![CommandResultReport {
            id: cmd.id,
            status: "completed".to_string(),
            message: Some("ok".to_string()),
        }];
        process_checkin(&store, &req, None, None).unwrap();
        let stored = store.get_command(cmd.id).unwrap();
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.result.as_deref(), Some("ok"));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn test_request_wire_format() {
        let req: CheckinRequest = serde_json::from_str(
            r#"{
                "deviceId": "AA:BB",
                "wifiIp": "192.168.1.2",
                "blockedInbound": 12,
                "deltaInbound": 3,
                "metrics": {"cpuLoad": 0.5, "tempCelsius": 49.0},
                "commandResults": [{"id": 7, "status": "failed", "message": "no space"}]
            }"#,
        )
        .unwrap();
        assert_eq!(req.device_id.as_deref(), Some("AA:BB"));
        assert_eq!(req.wifi_ip.as_deref(), Some("192.168.1.2"));
        assert_eq!(req.blocked_inbound, Some(12));
        assert_eq!(req.delta_inbound, Some(3));
        assert_eq!(req.metrics.as_ref().unwrap().cpu_load, Some(0.5));
        assert_eq!(req.command_results.len(), 1);
        assert_eq!(req.command_results[0].message.as_deref(), Some("no space"));
    }
}
