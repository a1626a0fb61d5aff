//! Monitor command payloads
//!
//! These structs serialize to the exact JSON the hypervisor's monitor
//! protocol expects. Field order is significant: serde emits struct fields
//! in declaration order, which keeps the `drive-backup` payload byte-for-byte
//! stable.

use serde::Serialize;
use serde_json::Value;

use crate::error::{IntrospectionError, Result};

/// How a command string is delivered to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Command is already a QMP JSON object
    Qmp,
    /// Command is a human monitor line, wrapped in `human-monitor-command`
    Hmp,
}

/// Envelope for every QMP command
#[derive(Serialize, Debug, Clone)]
pub struct MonitorCommand<A: Serialize> {
    pub execute: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<A>,
}

/// Live block-mirror of a drive to a network block target
#[derive(Serialize, Debug, Clone)]
pub struct DriveBackup {
    pub device: String,
    pub mode: &'static str,
    pub format: &'static str,
    pub target: String,
    pub sync: &'static str,
}

/// Stop a running block job on a device
#[derive(Serialize, Debug, Clone)]
pub struct BlockJobCancel {
    pub device: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct HumanMonitorCommand {
    #[serde(rename = "command-line")]
    pub command_line: String,
}

/// `nbd://<host>:<port>` URL of an export
pub fn nbd_target(host: &str, port: u16) -> String {
    format!("nbd://{}:{}", host, port)
}

/// Mirror existing content and all later writes of `device` to the export
pub fn drive_backup(device: &str, host: &str, port: u16) -> Result<String> {
    let command = MonitorCommand {
        execute: "drive-backup",
        arguments: Some(DriveBackup {
            device: device.to_string(),
            mode: "existing",
            format: "raw",
            target: nbd_target(host, port),
            sync: "stream",
        }),
    };
    encode(&command)
}

pub fn block_job_cancel(device: &str) -> Result<String> {
    encode(&MonitorCommand {
        execute: "block-job-cancel",
        arguments: Some(BlockJobCancel {
            device: device.to_string(),
        }),
    })
}

/// Handshake sent right after the greeting
pub fn qmp_capabilities() -> Result<String> {
    encode(&MonitorCommand::<()> {
        execute: "qmp_capabilities",
        arguments: None,
    })
}

/// Render `command` for the wire according to `mode`
pub fn wrap(command: &str, mode: MonitorMode) -> Result<String> {
    match mode {
        MonitorMode::Qmp => Ok(command.to_string()),
        MonitorMode::Hmp => encode(&MonitorCommand {
            execute: "human-monitor-command",
            arguments: Some(HumanMonitorCommand {
                command_line: command.to_string(),
            }),
        }),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| IntrospectionError::Monitor(format!("cannot encode command: {}", e)))
}

/// One line read from the monitor
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorReply {
    /// `{"QMP": {...}}` banner
    Greeting,
    /// Asynchronous event, not a reply to anything we sent
    Event(String),
    /// `{"return": ...}`
    Return(Value),
}

/// Classify a monitor line; `{"error": ...}` becomes `Monitor`
pub fn parse_reply(line: &str) -> Result<MonitorReply> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| IntrospectionError::Monitor(format!("malformed reply {:?}: {}", line, e)))?;

    if let Some(ret) = value.get("return") {
        return Ok(MonitorReply::Return(ret.clone()));
    }
    if let Some(err) = value.get("error") {
        let class = err.get("class").and_then(Value::as_str).unwrap_or("GenericError");
        let desc = err.get("desc").and_then(Value::as_str).unwrap_or("no description");
        return Err(IntrospectionError::Monitor(format!("{}: {}", class, desc)));
    }
    if let Some(event) = value.get("event") {
        return Ok(MonitorReply::Event(event.as_str().unwrap_or_default().to_string()));
    }
    if value.get("QMP").is_some() {
        return Ok(MonitorReply::Greeting);
    }

    Err(IntrospectionError::Monitor(format!("unexpected reply {}", line.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_backup_payload_is_exact() {
        let payload = drive_backup("vda", "127.0.0.1", 9123).unwrap();
        assert_eq!(
            payload,
            r#"{"execute":"drive-backup","arguments":{"device":"vda","mode":"existing","format":"raw","target":"nbd://127.0.0.1:9123","sync":"stream"}}"#
        );
    }

    #[test]
    fn test_capabilities_has_no_arguments() {
        assert_eq!(qmp_capabilities().unwrap(), r#"{"execute":"qmp_capabilities"}"#);
    }

    #[test]
    fn test_hmp_wrapping() {
        let wrapped = wrap("info block", MonitorMode::Hmp).unwrap();
        assert_eq!(
            wrapped,
            r#"{"execute":"human-monitor-command","arguments":{"command-line":"info block"}}"#
        );
        assert_eq!(wrap("{}", MonitorMode::Qmp).unwrap(), "{}");
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            parse_reply(r#"{"QMP": {"version": {}, "capabilities": []}}"#).unwrap(),
            MonitorReply::Greeting
        );
        assert_eq!(
            parse_reply(r#"{"return": {}}"#).unwrap(),
            MonitorReply::Return(serde_json::json!({}))
        );
        assert_eq!(
            parse_reply(r#"{"event": "BLOCK_JOB_READY", "data": {}}"#).unwrap(),
            MonitorReply::Event("BLOCK_JOB_READY".to_string())
        );

        let err = parse_reply(r#"{"error": {"class": "DeviceNotFound", "desc": "no vdz"}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "monitor error: DeviceNotFound: no vdz");
    }
}
