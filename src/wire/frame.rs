//! Control-channel message model.
//!
//! Every message exchanged over the SSH control channel is one JSON object:
//! `{kind, type, id?, ts, payload}`. Requests and responses carry an `id`
//! that pairs them; events are one-way and carry none.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,

    #[serde(rename = "type")]
    pub msg_type: String,

    /// Present on request/response frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Seconds since the Unix epoch.
    pub ts: f64,

    #[serde(default)]
    pub payload: Value,
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Frame {
    pub fn request(msg_type: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: FrameKind::Request,
            msg_type: msg_type.into(),
            id: Some(id.into()),
            ts: now_ts(),
            payload,
        }
    }

    pub fn response(msg_type: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: FrameKind::Response,
            msg_type: msg_type.into(),
            id: Some(id.into()),
            ts: now_ts(),
            payload,
        }
    }

    pub fn event(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: FrameKind::Event,
            msg_type: msg_type.into(),
            id: None,
            ts: now_ts(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serializes_lowercase() {
        let frame = Frame::event("state_update", json!({"worktrees": []}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "event");
        assert_eq!(value["type"], "state_update");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_request_round_trip() {
        let frame = Frame::request("ping", "7", json!({}));
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, FrameKind::Request);
        assert_eq!(back.id.as_deref(), Some("7"));
        assert_eq!(back.msg_type, "ping");
    }

    #[test]
    fn test_missing_payload_defaults_null() {
        let back: Frame =
            serde_json::from_str(r#"{"kind":"event","type":"x","ts":1.0}"#).unwrap();
        assert_eq!(back.payload, Value::Null);
    }
}
