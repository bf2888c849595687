//! Control-channel envelope types: §4.5/§6.
//!
//! Transport-agnostic: these types say nothing about sockets or framing,
//! only what goes in a JSON envelope once one is decoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::LoopDoc;

/// A decoded inbound command, already dispatched on `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundCommand {
    Subscribe,
    Ping,
    GetState,
    GetDoc,
    SetTempo { payload: SetTempoPayload },
    SetClockSource { payload: SetClockSourcePayload },
    #[serde(rename = "setTempoCC")]
    SetTempoCc { payload: SetTempoPayload },
    #[serde(rename = "replaceJSON")]
    ReplaceJson { payload: ReplaceJsonPayload },
    ApplyPatch { payload: ApplyPatchPayload },
    Play,
    Stop,
    Continue,
}

/// Raw wire shape of an inbound envelope, `{type, id?, payload?}`.
///
/// Decoded in two steps: first as this permissive shell (so an unknown or
/// malformed envelope can still be acknowledged/errored with its `id`), then
/// the `type`+`payload` pair is re-parsed into [`InboundCommand`].
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl InboundEnvelope {
    /// Decode into a typed [`InboundCommand`], re-attaching `type`/`payload`
    /// for serde's internally-tagged representation.
    pub fn command(&self) -> Result<InboundCommand, serde_json::Error> {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(p) = &self.payload {
            obj.insert("payload".to_string(), p.clone());
        }
        serde_json::from_value(Value::Object(obj))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetTempoPayload {
    pub bpm: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetClockSourcePayload {
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceJsonPayload {
    #[serde(rename = "baseVersion")]
    pub base_version: u64,
    pub doc: LoopDoc,
    #[serde(rename = "applyNow", default)]
    pub apply_now: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyPatchPayload {
    #[serde(rename = "baseVersion")]
    pub base_version: u64,
    pub ops: Vec<Value>,
    #[serde(rename = "applyNow", default)]
    pub apply_now: bool,
}

/// An outbound frame: `{type, ts, payload}` for broadcasts, or an ack/error
/// reply that also carries back the request `id`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundEnvelope {
    Hello { ts: u128, payload: HelloPayload },
    Doc { ts: u128, payload: LoopDoc },
    State { ts: u128, payload: Value },
    Metrics { ts: u128, payload: Value },
    Ack { ts: u128, id: Option<String>, payload: AckPayload },
    Error { ts: u128, id: Option<String>, payload: ErrorPayload },
    Pong { ts: u128, id: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct HelloPayload {
    pub protocol: u32,
    #[serde(rename = "docVersion")]
    pub doc_version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    pub ok: bool,
    #[serde(rename = "docVersion", skip_serializing_if = "Option::is_none")]
    pub doc_version: Option<u64>,
}

/// The closed set of error kinds a control-surface command can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Stale,
    Validation,
    InvalidOps,
    PatchApply,
    TransportExternalOnly,
    Exception,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error: ErrorKind,
    #[serde(rename = "expected", skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_set_tempo() {
        let env = InboundEnvelope {
            kind: "setTempo".to_string(),
            id: Some("1".to_string()),
            payload: Some(serde_json::json!({"bpm": 128.0})),
        };
        let cmd = env.command().unwrap();
        match cmd {
            InboundCommand::SetTempo { payload } => assert_eq!(payload.bpm, 128.0),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decodes_no_payload_variant() {
        let env = InboundEnvelope {
            kind: "ping".to_string(),
            id: None,
            payload: None,
        };
        assert!(matches!(env.command().unwrap(), InboundCommand::Ping));
    }
}
