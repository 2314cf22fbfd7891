//! Duplex socket frame codec
//!
//! Frames are JSON text. Inbound control frames (`register_ack`,
//! `heartbeat_ack`, `error`) are handled by the socket transport itself;
//! everything else is a command payload for the job normalizer. Outbound,
//! the socket protocol has no `result` type: successful terminal results go
//! out as a `status` frame marked `completed`, failures as an `error` frame.

use super::messages::{OutboundMessage, ResultMessage};
use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Frame types that carry a nested job payload
const ENVELOPE_TYPES: &[&str] = &["command", "job"];
/// Keys that may hold the nested job inside an envelope frame
const ENVELOPE_PAYLOAD_KEYS: &[&str] = &["payload", "data", "job"];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
}

/// Decoded inbound socket frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    RegisterAck { session_id: Option<String> },
    HeartbeatAck,
    Error { message: String },
    Command(Value),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(FrameError::NotAnObject);
        };

        let frame_type = object
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);

        match frame_type.as_deref() {
            Some("register_ack") => Ok(InboundFrame::RegisterAck {
                session_id: object
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            Some("heartbeat_ack") | Some("pong") => Ok(InboundFrame::HeartbeatAck),
            Some("error") => Ok(InboundFrame::Error {
                message: object
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified error")
                    .to_string(),
            }),
            Some(kind) if ENVELOPE_TYPES.contains(&kind) => {
                Ok(InboundFrame::Command(unwrap_envelope(&mut object)))
            }
            _ => Ok(InboundFrame::Command(Value::Object(object))),
        }
    }
}

/// Pull the job out of a `command`/`job` envelope, or drop the envelope
/// discriminator so it is not mistaken for the job's action type
fn unwrap_envelope(object: &mut Map<String, Value>) -> Value {
    for key in ENVELOPE_PAYLOAD_KEYS {
        if matches!(object.get(*key), Some(Value::Object(_))) {
            if let Some(inner) = object.remove(*key) {
                return inner;
            }
        }
    }
    object.remove("type");
    Value::Object(std::mem::take(object))
}

/// Registration frame sent immediately after the socket opens
pub fn register_frame(server_id: &str, capabilities: &[String]) -> Value {
    json!({
        "type": "register",
        "serverId": server_id,
        "agentVersion": env!("CARGO_PKG_VERSION"),
        "capabilities": capabilities,
        "timestamp": Utc::now(),
    })
}

/// Farewell frame sent on intentional shutdown
pub fn goodbye_frame(server_id: &str, reason: &str) -> Value {
    json!({
        "type": "goodbye",
        "serverId": server_id,
        "reason": reason,
        "timestamp": Utc::now(),
    })
}

/// Translate an outbound record into the socket protocol's frame vocabulary
pub fn outbound_frame(message: &OutboundMessage) -> Result<Value, serde_json::Error> {
    match message {
        OutboundMessage::Result(result) => Ok(result_frame(result)),
        other => serde_json::to_value(other),
    }
}

fn result_frame(result: &ResultMessage) -> Value {
    if result.success {
        json!({
            "type": "status",
            "jobId": result.job_id,
            "serverId": result.server_id,
            "status": "completed",
            "success": true,
            "message": result.message,
            "details": result.details,
            "timestamp": result.timestamp,
        })
    } else {
        json!({
            "type": "error",
            "jobId": result.job_id,
            "serverId": result.server_id,
            "status": "failed",
            "success": false,
            "errorCode": result.error_code,
            "message": result.message,
            "details": result.details,
            "timestamp": result.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ErrorCode;

    #[test]
    fn test_control_frames_are_recognized() {
        assert_eq!(
            InboundFrame::parse(r#"{"type":"register_ack","sessionId":"s-1"}"#).unwrap(),
            InboundFrame::RegisterAck {
                session_id: Some("s-1".to_string())
            }
        );
        assert_eq!(
            InboundFrame::parse(r#"{"type":"heartbeat_ack"}"#).unwrap(),
            InboundFrame::HeartbeatAck
        );
        assert_eq!(
            InboundFrame::parse(r#"{"type":"error","message":"unauthorized"}"#).unwrap(),
            InboundFrame::Error {
                message: "unauthorized".to_string()
            }
        );
    }

    #[test]
    fn test_bare_job_frame_is_a_command() {
        let frame =
            InboundFrame::parse(r#"{"type":"deploy_application","id":"j1","appName":"web"}"#)
                .unwrap();
        match frame {
            InboundFrame::Command(value) => {
                assert_eq!(value["type"], "deploy_application");
                assert_eq!(value["id"], "j1");
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_payload_is_unwrapped() {
        let frame = InboundFrame::parse(
            r#"{"type":"command","payload":{"jobId":"j2","jobType":"install_database"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::Command(json!({"jobId":"j2","jobType":"install_database"}))
        );
    }

    #[test]
    fn test_flat_envelope_drops_discriminator() {
        let frame =
            InboundFrame::parse(r#"{"type":"command","command":"deploy","id":"j3"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Command(json!({"command":"deploy","id":"j3"}))
        );
    }

    #[test]
    fn test_non_object_frames_are_rejected() {
        assert!(matches!(
            InboundFrame::parse("[1,2,3]"),
            Err(FrameError::NotAnObject)
        ));
        assert!(matches!(
            InboundFrame::parse("not json"),
            Err(FrameError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_failed_result_becomes_error_frame() {
        let message = OutboundMessage::Result(ResultMessage {
            job_id: "j4".to_string(),
            server_id: "srv".to_string(),
            success: false,
            message: "boom".to_string(),
            details: Value::Null,
            error_code: Some(ErrorCode::HandlerFatalFailure),
            timestamp: Utc::now(),
        });
        let frame = outbound_frame(&message).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["errorCode"], "HANDLER_FATAL_FAILURE");
        assert_eq!(frame["jobId"], "j4");
    }

    #[test]
    fn test_successful_result_becomes_completed_status() {
        let message = OutboundMessage::Result(ResultMessage {
            job_id: "j5".to_string(),
            server_id: "srv".to_string(),
            success: true,
            message: "ok".to_string(),
            details: Value::Null,
            error_code: None,
            timestamp: Utc::now(),
        });
        let frame = outbound_frame(&message).unwrap();
        assert_eq!(frame["type"], "status");
        assert_eq!(frame["status"], "completed");
    }

    #[test]
    fn test_register_and_goodbye_frames() {
        let register = register_frame("srv-9", &["deploy_application".to_string()]);
        assert_eq!(register["type"], "register");
        assert_eq!(register["serverId"], "srv-9");
        assert_eq!(register["capabilities"][0], "deploy_application");

        let goodbye = goodbye_frame("srv-9", "shutdown");
        assert_eq!(goodbye["type"], "goodbye");
        assert_eq!(goodbye["reason"], "shutdown");
    }
}
