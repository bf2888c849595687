//! The loop document data model: tracks, steps, controller lanes, LFOs.
//!
//! Deserialization is permissive — a
//! malformed field degrades to `None`/a sensible default rather than failing
//! the whole document, since the validator (an external collaborator) is
//! responsible for rejecting bad documents before they ever reach the engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level loop document. Replaced wholesale, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDoc {
    pub version: String,
    #[serde(rename = "docVersion")]
    pub doc_version: u64,
    pub meta: Meta,
    #[serde(rename = "deviceProfile", default)]
    pub device_profile: DeviceProfile,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub tempo: f64,
    pub ppq: u32,
    #[serde(rename = "stepsPerBar")]
    pub steps_per_bar: u32,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Major,
    Minor,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Major
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(rename = "drumMap", default)]
    pub drum_map: HashMap<String, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "midiChannel")]
    pub midi_channel: u8,
    pub pattern: Pattern,
    #[serde(rename = "drumKit", default)]
    pub drum_kit: Option<DrumKit>,
    #[serde(rename = "ccLanes", default)]
    pub cc_lanes: Vec<CcLane>,
    #[serde(default)]
    pub lfos: Vec<Lfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(rename = "lengthBars")]
    pub length_bars: u32,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub idx: u32,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A single scheduled event within a step.
///
/// The pitch source (`pitch` | `degree`+`octaveOffset` | `chord`) is decoded
/// on demand via [`Event::pitch_spec`] rather than as a tagged enum, since the
/// wire format puts all three at the same JSON level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub pitch: Option<i64>,
    #[serde(default)]
    pub degree: Option<i64>,
    #[serde(rename = "octaveOffset", default)]
    pub octave_offset: i64,
    #[serde(default)]
    pub chord: Option<String>,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
    #[serde(rename = "lengthSteps", default = "default_one_u32")]
    pub length_steps: u32,
    #[serde(default = "default_gate")]
    pub gate: f64,
    #[serde(default = "default_one_f64")]
    pub prob: f64,
    #[serde(default = "default_one_u32")]
    pub ratchet: u32,
    #[serde(rename = "microshiftMs", default)]
    pub microshift_ms: i64,
    #[serde(default)]
    pub register: Option<(String, String)>,
}

fn default_velocity() -> u8 {
    100
}
fn default_one_u32() -> u32 {
    1
}
fn default_one_f64() -> f64 {
    1.0
}
fn default_gate() -> f64 {
    1.0
}

/// What an [`Event`] resolves to before pitch resolution.
pub enum PitchSource<'a> {
    Pitch(i64),
    Degree { degree: i64, octave_offset: i64 },
    Chord(&'a str),
}

impl Event {
    /// The pitch source this event carries, or `None` if none/malformed.
    ///
    /// Precedence: literal pitch, then degree, then chord.
    pub fn pitch_source(&self) -> Option<PitchSource<'_>> {
        if let Some(p) = self.pitch {
            return Some(PitchSource::Pitch(p));
        }
        if let Some(d) = self.degree {
            return Some(PitchSource::Degree {
                degree: d,
                octave_offset: self.octave_offset,
            });
        }
        if let Some(c) = &self.chord {
            return Some(PitchSource::Chord(c));
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrumKit {
    #[serde(default)]
    pub patterns: Vec<DrumKitPattern>,
    #[serde(rename = "repeatBars", default = "default_one_u32")]
    pub repeat_bars: u32,
    #[serde(rename = "lengthSteps", default = "default_one_u32")]
    pub length_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrumKitPattern {
    pub bar: u32,
    pub key: String,
    pub pattern: String,
    #[serde(default)]
    pub vel: Option<u8>,
    #[serde(rename = "lengthSteps", default)]
    pub length_steps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcLane {
    pub id: String,
    pub dest: CcDest,
    pub mode: CcMode,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default)]
    pub range: Option<(u8, u8)>,
    #[serde(default)]
    pub points: Vec<CcPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CcMode {
    Points,
    Hold,
    Ramp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcPoint {
    pub t: TimePos,
    pub v: u8,
    #[serde(default)]
    pub curve: Option<Curve>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Curve {
    Linear,
    Exp,
    Log,
    SCurve,
}

impl Default for Curve {
    fn default() -> Self {
        Curve::Linear
    }
}

/// A lane/LFO point position: either an absolute tick or a (bar, step) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimePos {
    Ticks { ticks: i64 },
    BarStep { bar: i64, step: i64 },
}

/// A CC/LFO destination: a raw CC number, `"cc:<n>"`, or `"name:<id>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CcDest {
    Number(u8),
    Symbolic(String),
}

impl CcDest {
    /// Resolve to a concrete CC control number, or `None` for an unknown name.
    pub fn resolve(&self) -> Option<u8> {
        match self {
            CcDest::Number(n) => Some(*n),
            CcDest::Symbolic(s) => {
                if let Some(rest) = s.strip_prefix("cc:") {
                    rest.parse::<u8>().ok()
                } else if let Some(rest) = s.strip_prefix("name:") {
                    crate::maps::cc_by_name(rest)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lfo {
    pub id: String,
    pub dest: CcDest,
    pub depth: u8,
    pub rate: LfoRate,
    pub shape: LfoShape,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default = "default_lfo_offset")]
    pub offset: u8,
    #[serde(default)]
    pub phase: f64,
    #[serde(rename = "fadeMs", default)]
    pub fade_ms: u32,
    #[serde(default)]
    pub on: Vec<OnWindow>,
}

fn default_lfo_offset() -> u8 {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LfoRate {
    Sync { sync: String },
    Hz { hz: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LfoShape {
    Sine,
    Triangle,
    Saw,
    Ramp,
    Square,
    Samplehold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnWindow {
    pub from: TimePos,
    pub to: TimePos,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_pitch_source_precedence() {
        let e = Event {
            pitch: Some(60),
            degree: Some(3),
            octave_offset: 0,
            chord: Some("Cmaj7".into()),
            velocity: 100,
            length_steps: 1,
            gate: 1.0,
            prob: 1.0,
            ratchet: 1,
            microshift_ms: 0,
            register: None,
        };
        assert!(matches!(e.pitch_source(), Some(PitchSource::Pitch(60))));
    }

    #[test]
    fn cc_dest_resolves_numeric_string_and_name() {
        assert_eq!(CcDest::Number(32).resolve(), Some(32));
        assert_eq!(CcDest::Symbolic("cc:40".into()).resolve(), Some(40));
        assert_eq!(CcDest::Symbolic("name:cutoff".into()).resolve(), Some(32));
        assert_eq!(CcDest::Symbolic("name:nope".into()).resolve(), None);
    }
}
