//! Outbound wire records shared by both transports
//!
//! Every record is immutable once constructed and serializes to a UTF-8 JSON
//! object with a `type` discriminator, camelCase fields and an ISO-8601
//! `timestamp`. The same records travel over the durable queue and the
//! duplex socket, so downstream consumers never need to know which path
//! carried them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-level error codes reported in failure results
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TransportUnavailable,
    CredentialCorrupt,
    CredentialMissing,
    JobMalformed,
    JobUnsupported,
    ResourceBusy,
    HandlerTransientFailure,
    HandlerFatalFailure,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            ErrorCode::CredentialCorrupt => "CREDENTIAL_CORRUPT",
            ErrorCode::CredentialMissing => "CREDENTIAL_MISSING",
            ErrorCode::JobMalformed => "JOB_MALFORMED",
            ErrorCode::JobUnsupported => "JOB_UNSUPPORTED",
            ErrorCode::ResourceBusy => "RESOURCE_BUSY",
            ErrorCode::HandlerTransientFailure => "HANDLER_TRANSIENT_FAILURE",
            ErrorCode::HandlerFatalFailure => "HANDLER_FATAL_FAILURE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to streamed job log lines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Progress status of a running job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub job_id: String,
    pub server_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One line of job output streamed to the control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub job_id: String,
    pub server_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of a job; exactly one is emitted per dispatched job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub job_id: String,
    pub server_id: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

/// Liveness record published on a fixed interval while a transport is up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub server_id: String,
    pub status: AgentPresence,
    pub metrics: HeartbeatMetrics,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentPresence {
    Online,
    Offline,
}

/// Coarse agent-level resource figures carried by heartbeats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    pub uptime_secs: u64,
    pub jobs_in_flight: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub locks_held: u64,
    pub cpu_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_transport: Option<String>,
}

impl HeartbeatMetrics {
    /// Read the 1-minute load average when the host exposes `/proc/loadavg`
    pub fn sample_load_average() -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
        raw.split_whitespace().next()?.parse().ok()
    }
}

/// Any record the agent sends to the control plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Status(StatusMessage),
    Log(LogMessage),
    Result(ResultMessage),
    Heartbeat(HeartbeatMessage),
}

impl OutboundMessage {
    /// Job the record belongs to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            OutboundMessage::Status(m) => Some(&m.job_id),
            OutboundMessage::Log(m) => Some(&m.job_id),
            OutboundMessage::Result(m) => Some(&m.job_id),
            OutboundMessage::Heartbeat(_) => None,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            OutboundMessage::Status(m) => &m.server_id,
            OutboundMessage::Log(m) => &m.server_id,
            OutboundMessage::Result(m) => &m.server_id,
            OutboundMessage::Heartbeat(m) => &m.server_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Status(_) => "status",
            OutboundMessage::Log(_) => "log",
            OutboundMessage::Result(_) => "result",
            OutboundMessage::Heartbeat(_) => "heartbeat",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundMessage::Result(_))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_result(error_code: Option<ErrorCode>) -> ResultMessage {
        ResultMessage {
            job_id: "job-1".to_string(),
            server_id: "srv-1".to_string(),
            success: error_code.is_none(),
            message: "done".to_string(),
            details: json!({"containers": 2}),
            error_code,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_result_serializes_with_type_tag_and_camel_case() {
        let message = OutboundMessage::Result(sample_result(Some(ErrorCode::ResourceBusy)));
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "result");
        assert_eq!(value["jobId"], "job-1");
        assert_eq!(value["serverId"], "srv-1");
        assert_eq!(value["errorCode"], "RESOURCE_BUSY");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_success_result_omits_error_code() {
        let message = OutboundMessage::Result(sample_result(None));
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert!(value.get("errorCode").is_none());
        assert_eq!(value["success"], true);
    }

    #[test]
    fn test_log_level_lowercase() {
        let message = OutboundMessage::Log(LogMessage {
            job_id: "job-1".to_string(),
            server_id: "srv-1".to_string(),
            level: LogLevel::Warn,
            message: "disk almost full".to_string(),
            timestamp: Utc::now(),
        });
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["level"], "warn");
    }

    #[test]
    fn test_heartbeat_has_no_job_id() {
        let message = OutboundMessage::Heartbeat(HeartbeatMessage {
            server_id: "srv-1".to_string(),
            status: AgentPresence::Online,
            metrics: HeartbeatMetrics::default(),
            agent_version: "0.1.0".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(message.job_id(), None);
        assert_eq!(message.server_id(), "srv-1");
        assert!(!message.is_terminal());
        let value: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["status"], "online");
    }

    #[test]
    fn test_error_code_display_matches_wire_format() {
        for code in [
            ErrorCode::TransportUnavailable,
            ErrorCode::JobMalformed,
            ErrorCode::HandlerFatalFailure,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, code.as_str());
            assert_eq!(code.to_string(), code.as_str());
        }
    }
}
