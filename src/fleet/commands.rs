//! Command queue rules: the closed command-type set, payload validation,
//! and enqueueing.

use crate::db::{Command, DbError, Store};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

/// Commands a device may be sent per check-in.
pub const DRAIN_LIMIT: i64 = 10;

/// Command queue error types.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("invalid command type: {0}")]
    InvalidCommandType(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// The closed set of administrative command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    UpdateBlocklist,
    Exec,
    Reboot,
    UpdateFirmware,
    SetConfig,
    FileDownload,
}

impl CommandType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "update_blocklist" => Some(Self::UpdateBlocklist),
            "exec" => Some(Self::Exec),
            "reboot" => Some(Self::Reboot),
            "update_firmware" => Some(Self::UpdateFirmware),
            "set_config" => Some(Self::SetConfig),
            "file_download" => Some(Self::FileDownload),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateBlocklist => "update_blocklist",
            Self::Exec => "exec",
            Self::Reboot => "reboot",
            Self::UpdateFirmware => "update_firmware",
            Self::SetConfig => "set_config",
            Self::FileDownload => "file_download",
        }
    }

    /// Payload fields that must be present, non-null strings.
    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::UpdateBlocklist => &["url"],
            Self::Exec => &["script"],
            Self::Reboot => &[],
            // sha256 stays optional
            Self::UpdateFirmware => &["url"],
            Self::SetConfig => &["key", "value"],
            Self::FileDownload => &["url", "path"],
        }
    }
}

/// Command lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "acknowledged" => Some(Self::Acknowledged),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a device may report this state as a command outcome.
    pub fn is_reportable(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Completed | Self::Failed)
    }
}

/// Validate a payload document against the command type's schema.
pub fn validate_payload(command_type: CommandType, payload: &Value) -> Result<(), CommandError> {
    if !payload.is_object() {
        return Err(CommandError::InvalidPayload(
            "payload must be a JSON object".to_string(),
        ));
    }
    for field in command_type.required_fields() {
        let present = payload
            .get(field)
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(CommandError::InvalidPayload(format!(
                "{} requires payload field '{}'",
                command_type.as_str(),
                field
            )));
        }
    }
    Ok(())
}

/// Validate and enqueue a command in the `pending` state.
///
/// `device_id = None` broadcasts to every device; a unicast target must
/// already be registered.
pub fn enqueue_command(
    store: &Store,
    device_id: Option<&str>,
    type_str: &str,
    payload: &Value,
) -> Result<Command, CommandError> {
    let command_type = CommandType::parse(type_str)
        .ok_or_else(|| CommandError::InvalidCommandType(type_str.to_string()))?;
    validate_payload(command_type, payload)?;

    if let Some(id) = device_id {
        match store.get_device(id) {
            Ok(_) => {}
            Err(DbError::NotFound) => return Err(CommandError::DeviceNotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        }
    }

    let payload_json = payload.to_string();
    let command = store.insert_command(device_id, command_type.as_str(), &payload_json, Utc::now())?;
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeviceReport;
    use serde_json::json;
    use tempfile::NamedTempFile;

    #[test]
    fn test_command_type_round_trip() {
        for s in [
            "update_blocklist",
            "exec",
            "reboot",
            "update_firmware",
            "set_config",
            "file_download",
        ] {
            let ct = CommandType::parse(s).unwrap();
            assert_eq!(ct.as_str(), s);
        }
        assert!(CommandType::parse("bogus_type").is_none());
        assert!(CommandType::parse("").is_none());
    }

    #[test]
    fn test_status_reportable() {
        assert!(CommandStatus::parse("completed").unwrap().is_reportable());
        assert!(CommandStatus::parse("failed").unwrap().is_reportable());
        assert!(CommandStatus::parse("acknowledged").unwrap().is_reportable());
        assert!(!CommandStatus::parse("pending").unwrap().is_reportable());
        assert!(!CommandStatus::parse("sent").unwrap().is_reportable());
        assert!(CommandStatus::parse("done").is_none());
    }

    #[test]
    fn test_validate_payload_per_type() {
        assert!(validate_payload(CommandType::Reboot, &json!({})).is_ok());
        assert!(validate_payload(CommandType::UpdateBlocklist, &json!({"url": "https://x"})).is_ok());
        assert!(validate_payload(CommandType::UpdateBlocklist, &json!({})).is_err());
        assert!(validate_payload(CommandType::UpdateBlocklist, &json!({"url": "  "})).is_err());
        assert!(validate_payload(CommandType::Exec, &json!({"script": "ls"})).is_ok());
        assert!(validate_payload(CommandType::Exec, &json!({"script": 7})).is_err());
        assert!(validate_payload(
            CommandType::FileDownload,
            &json!({"url": "https://x", "path": "/tmp/f"})
        )
        .is_ok());
        assert!(validate_payload(CommandType::FileDownload, &json!({"url": "https://x"})).is_err());
        assert!(validate_payload(CommandType::SetConfig, &json!({"key": "dns", "value": "off"})).is_ok());
        assert!(validate_payload(CommandType::SetConfig, &json!({"key": "dns"})).is_err());
        // sha256 is optional for firmware updates
        assert!(validate_payload(CommandType::UpdateFirmware, &json!({"url": "https://x"})).is_ok());
        assert!(validate_payload(CommandType::Reboot, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_enqueue_validates_and_targets() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store
            .upsert_device(
                &DeviceReport {
                    device_id: "X".to_string(),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();

        let cmd = enqueue_command(&store, Some("X"), "reboot", &json!({})).unwrap();
        assert_eq!(cmd.status, "pending");
        assert_eq!(cmd.device_id.as_deref(), Some("X"));

        // Broadcast skips the existence check
        let bcast = enqueue_command(&store, None, "exec", &json!({"script": "ls"})).unwrap();
        assert!(bcast.device_id.is_none());

        assert!(matches!(
            enqueue_command(&store, Some("X"), "bogus_type", &json!({})),
            Err(CommandError::InvalidCommandType(_))
        ));
        assert!(matches!(
            enqueue_command(&store, Some("X"), "update_blocklist", &json!({})),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(matches!(
            enqueue_command(&store, Some("Y"), "reboot", &json!({})),
            Err(CommandError::DeviceNotFound(_))
        ));
    }
}
