//! Dispatch table for inbound control-channel commands (§4.5).

use std::time::{SystemTime, UNIX_EPOCH};

use groove_core::conductor::Conductor;
use groove_core::error::GrooveError;
use groove_core::sink::Sink;
use groove_types::protocol::{
    AckPayload, ErrorKind, ErrorPayload, InboundCommand, InboundEnvelope, OutboundEnvelope,
};

fn now_ts() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn error_kind(e: &GrooveError) -> ErrorKind {
    match e {
        GrooveError::Stale { .. } => ErrorKind::Stale,
        GrooveError::Validation(_) => ErrorKind::Validation,
        GrooveError::InvalidOps(_) => ErrorKind::InvalidOps,
        GrooveError::PatchApply(_) => ErrorKind::PatchApply,
        GrooveError::TransportExternalOnly => ErrorKind::TransportExternalOnly,
        GrooveError::Io(_) | GrooveError::Exception(_) => ErrorKind::Exception,
    }
}

fn error_envelope(id: Option<String>, e: GrooveError) -> OutboundEnvelope {
    let expected = match &e {
        GrooveError::Stale { expected } => Some(*expected),
        _ => None,
    };
    OutboundEnvelope::Error {
        ts: now_ts(),
        id,
        payload: ErrorPayload {
            error: error_kind(&e),
            expected,
            details: Some(e.to_string()),
        },
    }
}

fn ack(id: Option<String>, doc_version: u64) -> OutboundEnvelope {
    OutboundEnvelope::Ack {
        ts: now_ts(),
        id,
        payload: AckPayload { ok: true, doc_version: Some(doc_version) },
    }
}

fn state_envelope<S: Sink>(conductor: &Conductor<S>) -> OutboundEnvelope {
    OutboundEnvelope::State { ts: now_ts(), payload: conductor.state_snapshot() }
}

fn doc_envelope<S: Sink>(conductor: &Conductor<S>) -> Option<OutboundEnvelope> {
    conductor
        .doc_snapshot()
        .map(|doc| OutboundEnvelope::Doc { ts: now_ts(), payload: doc })
}

/// Value between 40 and 220 BPM mapped onto 0..127 for a hardware tempo
/// nudge, sent as CC80 on channel 0.
fn tempo_cc_value(bpm: f64) -> u8 {
    let clamped = bpm.clamp(40.0, 220.0);
    (((clamped - 40.0) / 180.0 * 127.0).round() as i64).clamp(0, 127) as u8
}

/// Handle one decoded inbound envelope against the conductor, returning the
/// frames to send back to the originating client. Callers are responsible
/// for broadcasting any additional `state`/`doc` frames this command implies.
pub fn handle<S: Sink>(conductor: &Conductor<S>, envelope: &InboundEnvelope) -> Vec<OutboundEnvelope> {
    let id = envelope.id.clone();
    let command = match envelope.command() {
        Ok(c) => c,
        Err(e) => {
            return vec![error_envelope(id, GrooveError::Validation(e.to_string()))];
        }
    };

    match command {
        InboundCommand::Subscribe => vec![ack(id, conductor.doc_version())],
        InboundCommand::Ping => vec![OutboundEnvelope::Pong { ts: now_ts(), id }],
        InboundCommand::GetState => vec![state_envelope(conductor)],
        InboundCommand::GetDoc => doc_envelope(conductor).into_iter().collect(),
        InboundCommand::SetTempo { payload } => {
            conductor.do_set_tempo(payload.bpm);
            vec![ack(id, conductor.doc_version())]
        }
        InboundCommand::SetClockSource { payload } => match conductor.do_set_clock_source(&payload.source) {
            Ok(()) => vec![ack(id, conductor.doc_version())],
            Err(e) => vec![error_envelope(id, e)],
        },
        InboundCommand::SetTempoCc { payload } => {
            let value = tempo_cc_value(payload.bpm);
            let _ = conductor.send_cc(0, 80, value);
            vec![ack(id, conductor.doc_version())]
        }
        InboundCommand::ReplaceJson { payload } => {
            match conductor.do_replace_json(payload.base_version, payload.doc, payload.apply_now) {
                Ok(v) => vec![ack(id, v)],
                Err(e) => vec![error_envelope(id, e)],
            }
        }
        InboundCommand::ApplyPatch { payload } => {
            match conductor.do_apply_patch(payload.base_version, payload.ops, payload.apply_now) {
                Ok(v) => vec![ack(id, v)],
                Err(e) => vec![error_envelope(id, e)],
            }
        }
        InboundCommand::Play | InboundCommand::Continue => match conductor.reject_transport_if_external() {
            Ok(()) => {
                conductor.start();
                vec![ack(id, conductor.doc_version())]
            }
            Err(e) => vec![error_envelope(id, e)],
        },
        InboundCommand::Stop => match conductor.reject_transport_if_external() {
            Ok(()) => {
                conductor.stop();
                vec![ack(id, conductor.doc_version())]
            }
            Err(e) => vec![error_envelope(id, e)],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groove_core::clock::{Clock, InternalClock};
    use groove_core::engine::{CcLimits, Engine};
    use groove_core::sink::VirtualSink;
    use groove_types::model::*;

    fn conductor() -> Conductor<VirtualSink> {
        let engine = Engine::new(VirtualSink::new(), CcLimits::default());
        let clock = Clock::Internal(InternalClock::new(96, 120.0));
        let c = Conductor::new(engine, clock, None);
        c.bootstrap(LoopDoc {
            version: "1".into(),
            doc_version: 1,
            meta: Meta { tempo: 120.0, ppq: 96, steps_per_bar: 16, key: None, mode: None },
            device_profile: DeviceProfile::default(),
            tracks: Vec::new(),
        });
        c
    }

    fn envelope(kind: &str, payload: Option<serde_json::Value>) -> InboundEnvelope {
        InboundEnvelope { kind: kind.to_string(), id: Some("1".to_string()), payload }
    }

    #[test]
    fn ping_replies_pong_with_same_id() {
        let c = conductor();
        let out = handle(&c, &envelope("ping", None));
        assert!(matches!(&out[0], OutboundEnvelope::Pong { id: Some(i), .. } if i == "1"));
    }

    #[test]
    fn set_tempo_acks() {
        let c = conductor();
        let out = handle(&c, &envelope("setTempo", Some(serde_json::json!({"bpm": 140.0}))));
        assert!(matches!(&out[0], OutboundEnvelope::Ack { payload, .. } if payload.ok));
    }

    #[test]
    fn stale_replace_errors() {
        let c = conductor();
        let payload = serde_json::json!({
            "baseVersion": 999,
            "doc": {
                "version": "1", "docVersion": 1,
                "meta": {"tempo": 120.0, "ppq": 96, "stepsPerBar": 16},
                "deviceProfile": {}, "tracks": []
            },
            "applyNow": true
        });
        let out = handle(&c, &envelope("replaceJSON", Some(payload)));
        match &out[0] {
            OutboundEnvelope::Error { payload, .. } => assert_eq!(payload.error, ErrorKind::Stale),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn tempo_cc_value_maps_range() {
        assert_eq!(tempo_cc_value(40.0), 0);
        assert_eq!(tempo_cc_value(220.0), 127);
    }
}
