//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Device already registered to another owner")]
    Conflict,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Device registry ---

    /// Create-or-update a device from a check-in report, keyed by `device_id`.
    ///
    /// Fields absent from the report retain their stored values. Counters
    /// overwrite whenever reported, even if lower (device-side reset).
    /// `first_seen` is set once on insert and never touched again; every call
    /// sets `last_seen = now` and the cached status to `online`.
    pub fn upsert_device(&self, report: &DeviceReport, now: DateTime<Utc>) -> Result<Device, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (device_id, mac_address, wifi_ip, wifi_ssid, wifi_signal, mode, firmware, uptime,
                                  blocked_inbound, blocked_outbound, status, wan_ip, geo_location, last_seen, first_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, COALESCE(?9, 0), COALESCE(?10, 0), 'online', ?11, ?12, ?13, ?13)
             ON CONFLICT(device_id) DO UPDATE SET
                 mac_address      = COALESCE(excluded.mac_address, mac_address),
                 wifi_ip          = COALESCE(excluded.wifi_ip, wifi_ip),
                 wifi_ssid        = COALESCE(excluded.wifi_ssid, wifi_ssid),
                 wifi_signal      = COALESCE(excluded.wifi_signal, wifi_signal),
                 mode             = COALESCE(excluded.mode, mode),
                 firmware         = COALESCE(excluded.firmware, firmware),
                 uptime           = COALESCE(excluded.uptime, uptime),
                 blocked_inbound  = COALESCE(?9, blocked_inbound),
                 blocked_outbound = COALESCE(?10, blocked_outbound),
                 wan_ip           = COALESCE(excluded.wan_ip, wan_ip),
                 geo_location     = COALESCE(excluded.geo_location, geo_location),
                 status           = 'online',
                 last_seen        = excluded.last_seen",
            params![
                report.device_id,
                report.mac_address,
                report.wifi_ip,
                report.wifi_ssid,
                report.wifi_signal,
                report.mode,
                report.firmware,
                report.uptime,
                report.blocked_inbound,
                report.blocked_outbound,
                report.wan_ip,
                report.geo_location,
                fmt_time(now),
            ],
        )?;
        get_device_on(&conn, &report.device_id)
    }

    /// Get a device by id.
    pub fn get_device(&self, device_id: &str) -> Result<Device, DbError> {
        let conn = self.conn.lock().unwrap();
        get_device_on(&conn, device_id)
    }

    /// Get all devices, most recently seen first.
    pub fn get_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices ORDER BY last_seen DESC, device_id ASC"
        ))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    /// Rename a device. An empty or whitespace name clears it.
    pub fn rename_device(&self, device_id: &str, name: &str) -> Result<Device, DbError> {
        let trimmed = name.trim();
        let value = if trimmed.is_empty() { None } else { Some(trimmed) };

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE devices SET name = ?1 WHERE device_id = ?2",
            params![value, device_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        get_device_on(&conn, device_id)
    }

    /// Bind a device to an owner, optionally naming it.
    ///
    /// Fails with `NotFound` if the device has never checked in, and with
    /// `Conflict` if it is already bound to a different owner.
    pub fn register_device(
        &self,
        device_id: &str,
        owner: &str,
        name: Option<&str>,
    ) -> Result<Device, DbError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT COALESCE(owner, '') FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => return Err(DbError::NotFound),
            Some(current) if !current.is_empty() && current != owner => {
                return Err(DbError::Conflict);
            }
            Some(_) => {}
        }

        conn.execute(
            "UPDATE devices SET owner = ?1, name = COALESCE(?2, name) WHERE device_id = ?3",
            params![owner, name, device_id],
        )?;
        get_device_on(&conn, device_id)
    }

    /// Delete a device and all dependent records.
    ///
    /// Dependents go first so an interrupted delete never orphans rows:
    /// block_events, device_metrics, device_commands, then the device row.
    pub fn delete_device(&self, device_id: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DbError::NotFound);
        }

        tx.execute("DELETE FROM block_events WHERE device_id = ?1", params![device_id])?;
        tx.execute("DELETE FROM device_metrics WHERE device_id = ?1", params![device_id])?;
        tx.execute("DELETE FROM device_commands WHERE device_id = ?1", params![device_id])?;
        tx.execute("DELETE FROM devices WHERE device_id = ?1", params![device_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Flip the cached status of devices unseen since `cutoff` to `offline`.
    ///
    /// Idempotent; returns the number of devices flipped.
    pub fn mark_offline_devices(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE devices SET status = 'offline' WHERE status != 'offline' AND last_seen < ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(changed)
    }

    // --- Block events ---

    /// Record a block-counter delta observed on a check-in.
    pub fn insert_block_event(
        &self,
        device_id: &str,
        delta_inbound: i64,
        delta_outbound: i64,
        total_inbound: i64,
        total_outbound: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO block_events (device_id, delta_inbound, delta_outbound, total_inbound, total_outbound, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                device_id,
                delta_inbound,
                delta_outbound,
                total_inbound,
                total_outbound,
                fmt_time(now),
            ],
        )?;
        Ok(())
    }

    /// Get the most recent block events across the fleet.
    pub fn recent_block_events(&self, limit: i64) -> Result<Vec<BlockEvent>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_id, delta_inbound, delta_outbound, total_inbound, total_outbound, time
             FROM block_events ORDER BY time DESC, id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit], |row| {
                let time_str: String = row.get(6)?;
                Ok(BlockEvent {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    delta_inbound: row.get(2)?,
                    delta_outbound: row.get(3)?,
                    total_inbound: row.get(4)?,
                    total_outbound: row.get(5)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }

    // --- Metrics ---

    /// Append a health snapshot for a device.
    pub fn insert_metrics(&self, snapshot: &MetricSnapshot) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO device_metrics (device_id, disk_total_mb, disk_used_mb, mem_total_mb, mem_used_mb, cpu_load, temp_celsius, time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.device_id,
                snapshot.disk_total_mb,
                snapshot.disk_used_mb,
                snapshot.mem_total_mb,
                snapshot.mem_used_mb,
                snapshot.cpu_load,
                snapshot.temp_celsius,
                fmt_time(snapshot.time),
            ],
        )?;
        Ok(())
    }

    /// Get the most recent health snapshot for a device, if any.
    pub fn latest_metrics(&self, device_id: &str) -> Result<Option<MetricSnapshot>, DbError> {
        let conn = self.conn.lock().unwrap();
        let snapshot = conn
            .query_row(
                "SELECT device_id, disk_total_mb, disk_used_mb, mem_total_mb, mem_used_mb, cpu_load, temp_celsius, time
                 FROM device_metrics WHERE device_id = ?1 ORDER BY time DESC, id DESC LIMIT 1",
                params![device_id],
                |row| {
                    let time_str: String = row.get(7)?;
                    Ok(MetricSnapshot {
                        device_id: row.get(0)?,
                        disk_total_mb: row.get(1)?,
                        disk_used_mb: row.get(2)?,
                        mem_total_mb: row.get(3)?,
                        mem_used_mb: row.get(4)?,
                        cpu_load: row.get(5)?,
                        temp_celsius: row.get(6)?,
                        time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    // --- Command queue ---

    /// Insert a command in the `pending` state.
    ///
    /// `device_id = None` is a broadcast addressed to every device. Type and
    /// payload validation belongs to the fleet layer; the store persists what
    /// it is given.
    pub fn insert_command(
        &self,
        device_id: Option<&str>,
        command_type: &str,
        payload_json: &str,
        now: DateTime<Utc>,
    ) -> Result<Command, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO device_commands (device_id, command_type, payload, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![device_id, command_type, payload_json, fmt_time(now)],
        )?;
        let id = conn.last_insert_rowid();
        get_command_on(&conn, id)
    }

    /// Get a command by id.
    pub fn get_command(&self, id: i64) -> Result<Command, DbError> {
        let conn = self.conn.lock().unwrap();
        get_command_on(&conn, id)
    }

    /// Atomically claim up to `limit` pending commands for a device.
    ///
    /// Selects commands addressed to the device or broadcast, oldest first,
    /// and flips them to `sent` in the same statement so an overlapping or
    /// retried check-in can never drain the same command twice. Returned
    /// oldest-first.
    pub fn drain_pending(
        &self,
        device_id: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Command>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "UPDATE device_commands SET status = 'sent', sent_at = ?3
             WHERE id IN (
                 SELECT id FROM device_commands
                 WHERE (device_id = ?1 OR device_id IS NULL) AND status = 'pending'
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2)
             RETURNING {COMMAND_COLS}"
        ))?;
        let mut commands = stmt
            .query_map(params![device_id, limit, fmt_time(now)], row_to_command)?
            .collect::<SqlResult<Vec<_>>>()?;
        // RETURNING row order is unspecified
        commands.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(commands)
    }

    /// Record a device-reported outcome for a command.
    ///
    /// Accepts results for commands still `pending` (a lost drain response
    /// must not strand the command). Returns `false` when the id resolves to
    /// nothing, so callers can log and move on.
    pub fn ingest_result(
        &self,
        command_id: i64,
        status: &str,
        result_text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE device_commands SET status = ?1, result = ?2, completed_at = ?3 WHERE id = ?4",
            params![status, result_text, fmt_time(now), command_id],
        )?;
        Ok(changed > 0)
    }

    /// List up to 100 commands, newest first, optionally filtered by device
    /// and/or status.
    pub fn list_commands(
        &self,
        device_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<Command>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut sql = format!("SELECT {COMMAND_COLS} FROM device_commands WHERE 1=1");
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(id) = device_id.as_ref() {
            sql.push_str(" AND device_id = ?");
            args.push(id);
        }
        if let Some(st) = status.as_ref() {
            sql.push_str(" AND status = ?");
            args.push(st);
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT 100");

        let mut stmt = conn.prepare(&sql)?;
        let commands = stmt
            .query_map(args.as_slice(), row_to_command)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(commands)
    }
}

const DEVICE_COLS: &str = "device_id, name, owner, mac_address, wifi_ip, wifi_ssid, wifi_signal, mode, firmware, uptime, \
     blocked_inbound, blocked_outbound, status, wan_ip, geo_location, last_seen, first_seen";

const COMMAND_COLS: &str =
    "id, device_id, command_type, payload, status, result, created_at, sent_at, completed_at";

fn get_device_on(conn: &Connection, device_id: &str) -> Result<Device, DbError> {
    conn.query_row(
        &format!("SELECT {DEVICE_COLS} FROM devices WHERE device_id = ?1"),
        params![device_id],
        row_to_device,
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

fn get_command_on(conn: &Connection, id: i64) -> Result<Command, DbError> {
    conn.query_row(
        &format!("SELECT {COMMAND_COLS} FROM device_commands WHERE id = ?1"),
        params![id],
        row_to_command,
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

fn row_to_device(row: &Row<'_>) -> SqlResult<Device> {
    let last_seen: String = row.get(15)?;
    let first_seen: String = row.get(16)?;
    Ok(Device {
        device_id: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        mac_address: row.get(3)?,
        wifi_ip: row.get(4)?,
        wifi_ssid: row.get(5)?,
        wifi_signal: row.get(6)?,
        mode: row.get(7)?,
        firmware: row.get(8)?,
        uptime: row.get(9)?,
        blocked_inbound: row.get(10)?,
        blocked_outbound: row.get(11)?,
        status: row.get(12)?,
        wan_ip: row.get(13)?,
        geo_location: row.get(14)?,
        last_seen: parse_db_time(&last_seen).unwrap_or_else(Utc::now),
        first_seen: parse_db_time(&first_seen).unwrap_or_else(Utc::now),
    })
}

fn row_to_command(row: &Row<'_>) -> SqlResult<Command> {
    let created_at: String = row.get(6)?;
    let sent_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    Ok(Command {
        id: row.get(0)?,
        device_id: row.get(1)?,
        command_type: row.get(2)?,
        payload: row.get(3)?,
        status: row.get(4)?,
        result: row.get(5)?,
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
        sent_at: sent_at.as_deref().and_then(parse_db_time),
        completed_at: completed_at.as_deref().and_then(parse_db_time),
    })
}

/// Format a datetime for storage. Fixed-width so string comparison orders
/// the same as time.
fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
