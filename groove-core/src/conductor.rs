//! The conductor (C4): owns the document, its version, and the clock/engine
//! pair; converts external mutations into engine replacements.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;

use groove_types::model::LoopDoc;

use crate::clock::{Clock, TransportEvent};
use crate::engine::Engine;
use crate::error::GrooveError;
use crate::patch;
use crate::persistence;
use crate::sink::{Sink, SinkError};

/// Document schema validation. The real validator/canonicalizer is an
/// external collaborator (§1); [`PermissiveValidator`] is the in-tree
/// stand-in used when no stricter one is wired in.
pub trait Validator: Send {
    fn validate(&self, doc: &LoopDoc) -> Result<(), GrooveError>;
}

pub struct PermissiveValidator;

impl Validator for PermissiveValidator {
    fn validate(&self, _doc: &LoopDoc) -> Result<(), GrooveError> {
        Ok(())
    }
}

struct ConductorState<S: Sink> {
    engine: Engine<S>,
    clock: Clock,
    doc_version: u64,
    pending_doc: Option<LoopDoc>,
    playing: bool,
    loop_path: Option<PathBuf>,
    last_known_hash: Option<String>,
    last_mtime: Option<SystemTime>,
    validator: Box<dyn Validator>,
}

/// Holds `{doc, doc_version, pending_doc, playing}` behind one mutex. The
/// tick driver and control surface conceptually share a reentrant lock;
/// here both paths only ever take the lock at the public-method boundary
/// and call non-locking `*_locked` helpers internally, which gives the
/// same effect without a reentrant primitive.
pub struct Conductor<S: Sink> {
    state: Mutex<ConductorState<S>>,
}

impl<S: Sink> Conductor<S> {
    pub fn new(engine: Engine<S>, clock: Clock, loop_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(ConductorState {
                engine,
                clock,
                doc_version: 0,
                pending_doc: None,
                playing: false,
                loop_path,
                last_known_hash: None,
                last_mtime: None,
                validator: Box::new(PermissiveValidator),
            }),
        }
    }

    pub fn doc_version(&self) -> u64 {
        self.state.lock().unwrap().doc_version
    }

    /// Install the first document without version/staleness checks (startup
    /// path, not a control-surface command).
    pub fn bootstrap(&self, doc: LoopDoc) {
        let mut state = self.state.lock().unwrap();
        state.engine.load(doc);
        state.doc_version = 1;
    }

    /// `play`/`continue`: start the engine and immediately re-run the
    /// current tick so events sitting exactly at this position aren't
    /// skipped.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        state.engine.start();
        state.playing = true;
        let tick = state.clock.current_tick();
        state.engine.on_tick(tick);
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.engine.stop();
        state.playing = false;
    }

    /// Drive the engine for one tick: applies any pending structural
    /// replacement exactly at a bar boundary, then ticks the engine.
    pub fn tick(&self, tick: i64) {
        let mut state = self.state.lock().unwrap();
        maybe_apply_pending(&mut state, tick);
        state.engine.on_tick(tick);
    }

    /// Advance the internal clock by one elapsed interval, returning the new
    /// tick index (or `None` if the clock source is external — that clock is
    /// driven by `handle_transport_event` instead).
    pub fn advance_internal_clock(&self, actual_interval: Duration) -> Option<i64> {
        let mut state = self.state.lock().unwrap();
        match &mut state.clock {
            Clock::Internal(c) => Some(c.advance(actual_interval)),
            Clock::External(_) => None,
        }
    }

    /// Feed a realtime MIDI transport byte into the external clock, starting
    /// or stopping the engine in lockstep, and returning the engine ticks
    /// this event produced.
    pub fn handle_transport_event(&self, event: TransportEvent, now: Instant) -> Vec<i64> {
        let mut state = self.state.lock().unwrap();
        let Clock::External(clock) = &mut state.clock else { return Vec::new() };
        let ticks = clock.handle(event, now);
        match event {
            TransportEvent::Start | TransportEvent::Continue => {
                if !state.playing {
                    state.engine.start();
                    state.playing = true;
                }
            }
            TransportEvent::Stop => {
                if state.playing {
                    state.engine.stop();
                    state.playing = false;
                }
            }
            TransportEvent::SongPositionPointer(_) | TransportEvent::ClockPulse => {}
        }
        ticks
    }

    /// Internal clock's expected wall-clock interval between ticks, used by
    /// the tick driver to pace its sleep loop. `None` for an external clock.
    pub fn internal_tick_interval(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        match &state.clock {
            Clock::Internal(c) => Some(c.expected_interval()),
            Clock::External(_) => None,
        }
    }

    pub fn do_replace_json(
        &self,
        base_version: u64,
        new_doc: LoopDoc,
        apply_now: bool,
    ) -> Result<u64, GrooveError> {
        let mut state = self.state.lock().unwrap();
        schedule_or_apply(&mut state, base_version, new_doc, true, apply_now)
    }

    /// Deep-copies the current document, applies RFC6902 `ops`, classifies
    /// the result as structural or not, and schedules/applies it.
    pub fn do_apply_patch(
        &self,
        base_version: u64,
        ops: Vec<Value>,
        apply_now: bool,
    ) -> Result<u64, GrooveError> {
        let mut state = self.state.lock().unwrap();
        if base_version != state.doc_version {
            return Err(GrooveError::Stale { expected: state.doc_version });
        }
        let current = state
            .engine
            .doc_version_doc()
            .ok_or_else(|| GrooveError::Exception("no document loaded".to_string()))?;
        let mut doc_value =
            serde_json::to_value(current).map_err(|e| GrooveError::Exception(e.to_string()))?;

        let parsed_ops = patch::parse_ops(&ops)?;
        let structural = parsed_ops.iter().any(|op| is_structural_path(&op.path));
        patch::apply(&mut doc_value, &parsed_ops)?;
        let new_doc: LoopDoc =
            serde_json::from_value(doc_value).map_err(|e| GrooveError::PatchApply(e.to_string()))?;

        schedule_or_apply(&mut state, base_version, new_doc, structural, apply_now)
    }

    pub fn do_set_tempo(&self, bpm: f64) {
        let mut state = self.state.lock().unwrap();
        if let Clock::Internal(c) = &mut state.clock {
            c.set_bpm(bpm);
        }
        if let Some(doc) = state.engine.doc_version_doc().cloned() {
            let mut doc = doc;
            doc.meta.tempo = bpm;
            state.engine.replace_doc(doc);
        }
    }

    pub fn do_set_clock_source(&self, source: &str) -> Result<(), GrooveError> {
        let mut state = self.state.lock().unwrap();
        let ppq = state
            .engine
            .doc_version_doc()
            .map(|d| d.meta.ppq)
            .unwrap_or(96);
        state.clock = match source {
            "internal" => {
                let bpm = state
                    .engine
                    .doc_version_doc()
                    .map(|d| d.meta.tempo)
                    .unwrap_or(120.0);
                Clock::Internal(crate::clock::InternalClock::new(ppq, bpm))
            }
            "external" => Clock::External(crate::clock::ExternalClock::new(
                ppq,
                crate::clock::ExternalClockOptions::default(),
            )),
            other => return Err(GrooveError::Validation(format!("unknown clock source {other}"))),
        };
        Ok(())
    }

    /// Send a single CC directly, bypassing engine scheduling — used for the
    /// hardware tempo-nudge command, which is stateless.
    pub fn send_cc(&self, channel: u8, control: u8, value: u8) -> Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        state.engine.sink_mut().control_change(channel, control, value)
    }

    /// `play`/`stop`/`continue` inbound commands are rejected outright when
    /// the device (external clock) owns transport.
    pub fn reject_transport_if_external(&self) -> Result<(), GrooveError> {
        let state = self.state.lock().unwrap();
        match state.clock {
            Clock::External(_) => Err(GrooveError::TransportExternalOnly),
            Clock::Internal(_) => Ok(()),
        }
    }

    /// Periodically stat `loop_path`; if it changed on disk, re-install it
    /// and bump `doc_version`. Returns `true` if a reload happened.
    pub fn poll_file_edit(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        poll_file_edit_locked(&mut state)
    }

    /// `{engine:{counters}, clock:{jitter p95/p99 or external bpm}}`. The
    /// caller (the control surface) adds the `ws` client-count section,
    /// since the conductor has no notion of connected clients.
    pub fn metrics_snapshot(&self) -> Value {
        let state = self.state.lock().unwrap();
        let engine = serde_json::json!({
            "msgs_note_on": state.engine.metrics.msgs_note_on,
            "msgs_note_off": state.engine.metrics.msgs_note_off,
            "msgs_cc": state.engine.metrics.msgs_cc,
            "shed_cc": state.engine.metrics.shed_cc,
        });
        let clock = match &state.clock {
            Clock::Internal(c) => serde_json::json!({
                "source": "internal",
                "bpm": c.bpm(),
                "jitterP95Us": c.jitter_p95(),
                "jitterP99Us": c.jitter_p99(),
            }),
            Clock::External(c) => serde_json::json!({
                "source": "external",
                "estimatedBpm": c.estimated_bpm(),
                "playing": c.is_playing(),
            }),
        };
        serde_json::json!({ "engine": engine, "clock": clock })
    }

    pub fn state_snapshot(&self) -> Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "docVersion": state.doc_version,
            "playing": state.playing,
            "activeNotes": state.engine.active_note_count(),
        })
    }

    pub fn doc_snapshot(&self) -> Option<LoopDoc> {
        self.state.lock().unwrap().engine.doc_version_doc().cloned()
    }
}

fn maybe_apply_pending<S: Sink>(state: &mut ConductorState<S>, tick: i64) {
    let Some(doc) = state.engine.doc_version_doc() else { return };
    let spb = doc.meta.steps_per_bar.max(1) as i64;
    let ppq = doc.meta.ppq.max(1) as i64;
    let step_ticks = (ppq * 4) / spb;
    let bar_ticks = step_ticks * spb;
    if bar_ticks > 0 && tick % bar_ticks == 0 {
        if let Some(pending) = state.pending_doc.take() {
            state.engine.replace_doc(pending);
        }
    }
}

fn schedule_or_apply<S: Sink>(
    state: &mut ConductorState<S>,
    base_version: u64,
    new_doc: LoopDoc,
    structural: bool,
    apply_now: bool,
) -> Result<u64, GrooveError> {
    if base_version != state.doc_version {
        return Err(GrooveError::Stale { expected: state.doc_version });
    }
    state.validator.validate(&new_doc)?;

    let canonical = persistence::canonicalize(&new_doc)?;
    if let Some(path) = state.loop_path.clone() {
        persistence::write_atomic(&path, &canonical)?;
        state.last_known_hash = Some(persistence::content_hash(&canonical));
        state.last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
    }

    state.doc_version += 1;
    if structural && state.playing && !apply_now {
        state.pending_doc = Some(new_doc);
    } else {
        state.engine.replace_doc(new_doc);
        state.pending_doc = None;
    }
    Ok(state.doc_version)
}

fn poll_file_edit_locked<S: Sink>(state: &mut ConductorState<S>) -> bool {
    let Some(path) = state.loop_path.clone() else { return false };
    let Ok(meta) = std::fs::metadata(&path) else { return false };
    let Ok(mtime) = meta.modified() else { return false };
    if state.last_mtime == Some(mtime) {
        return false;
    }
    let Ok(contents) = std::fs::read_to_string(&path) else { return false };
    let hash = persistence::content_hash(&contents);
    if state.last_known_hash.as_deref() == Some(hash.as_str()) {
        state.last_mtime = Some(mtime);
        return false;
    }
    let Ok(doc) = serde_json::from_str::<LoopDoc>(&contents) else { return false };
    if state.validator.validate(&doc).is_err() {
        return false;
    }
    state.engine.replace_doc(doc);
    state.doc_version += 1;
    state.last_known_hash = Some(hash);
    state.last_mtime = Some(mtime);
    true
}

/// A JSON-Patch op is structural if its path is under `/meta`,
/// `/deviceProfile`, or a track's identity/channel/role/pattern-length/
/// drum-kit fields.
fn is_structural_path(path: &str) -> bool {
    if path.starts_with("/meta") || path.starts_with("/deviceProfile") {
        return true;
    }
    if let Some(rest) = path.strip_prefix("/tracks/") {
        if let Some((_, field_path)) = rest.split_once('/') {
            const STRUCTURAL_FIELDS: &[&str] =
                &["id", "name", "type", "midiChannel", "role", "drumKit"];
            if STRUCTURAL_FIELDS.iter().any(|f| field_path == *f)
                || field_path == "pattern/lengthBars"
            {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CcLimits;
    use crate::sink::VirtualSink;
    use groove_types::model::*;

    fn doc(tempo: f64) -> LoopDoc {
        LoopDoc {
            version: "1".into(),
            doc_version: 1,
            meta: Meta { tempo, ppq: 96, steps_per_bar: 16, key: None, mode: None },
            device_profile: DeviceProfile::default(),
            tracks: Vec::new(),
        }
    }

    fn conductor() -> Conductor<VirtualSink> {
        let engine = Engine::new(VirtualSink::new(), CcLimits::default());
        let clock = Clock::Internal(crate::clock::InternalClock::new(96, 120.0));
        let c = Conductor::new(engine, clock, None);
        c.bootstrap(doc(120.0));
        c
    }

    #[test]
    fn stale_replace_is_rejected_without_mutation() {
        let c = conductor();
        let result = c.do_replace_json(99, doc(140.0), true);
        assert!(matches!(result, Err(GrooveError::Stale { expected: 1 })));
        assert_eq!(c.doc_version(), 1);
    }

    #[test]
    fn fresh_replace_bumps_version() {
        let c = conductor();
        let result = c.do_replace_json(1, doc(140.0), true);
        assert_eq!(result.unwrap(), 2);
        assert_eq!(c.doc_version(), 2);
    }

    #[test]
    fn structural_change_during_playback_defers_to_bar_boundary() {
        let c = conductor();
        c.start();
        let mut changed = doc(140.0);
        changed.tracks.push(Track {
            id: "new".into(),
            name: "new".into(),
            kind: "synth".into(),
            midi_channel: 0,
            pattern: Pattern { length_bars: 1, steps: Vec::new() },
            drum_kit: None,
            cc_lanes: Vec::new(),
            lfos: Vec::new(),
        });
        c.do_replace_json(1, changed, false).unwrap();
        assert!(c.doc_snapshot().unwrap().tracks.is_empty());
        c.tick(0);
        assert_eq!(c.doc_snapshot().unwrap().tracks.len(), 1);
    }

    #[test]
    fn structural_path_classification() {
        assert!(is_structural_path("/meta/tempo"));
        assert!(is_structural_path("/tracks/0/midiChannel"));
        assert!(is_structural_path("/tracks/0/pattern/lengthBars"));
        assert!(!is_structural_path("/tracks/0/ccLanes/0/points/0/v"));
    }
}
