//! The scheduling engine (C3): strictly reactive, no internal timer.
//!
//! `on_tick` is the hot path — it must never allocate on a steady-state tick
//! and must never panic. All failure degrades to "skip this event" rather
//! than aborting the tick.

use std::collections::HashMap;

use groove_types::model::{CcDest, CcMode, Curve, LfoRate, LfoShape, LoopDoc, Mode, PitchSource, TimePos};

use crate::sink::Sink;
use crate::theory;

#[derive(Debug, Clone, Copy)]
struct NoteEvent {
    pitch: u8,
    velocity: u8,
    on_tick: i64,
    off_tick: i64,
}

/// Deterministic xorshift-derived generator, seeded identically on every
/// `load`/`start` so probability/sample-and-hold behavior reproduces across
/// runs given the same document.
#[derive(Debug, Clone)]
struct DeterministicRng(u64);

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_add(0x9E3779B97F4A7C15))
    }

    /// Uniform float in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        // splitmix64
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub msgs_note_on: u64,
    pub msgs_note_off: u64,
    pub msgs_cc: u64,
    pub shed_cc: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CcLimits {
    pub per_tick_global: u32,
    pub per_tick_track: u32,
}

impl Default for CcLimits {
    fn default() -> Self {
        Self {
            per_tick_global: 32,
            per_tick_track: 8,
        }
    }
}

#[derive(Default)]
struct LfoState {
    last_frac: Option<f64>,
    value: f64,
}

pub struct Engine<S: Sink> {
    sink: S,
    doc: Option<LoopDoc>,
    step_ticks: i64,
    tick: i64,
    playing: bool,
    active: HashMap<(u8, u8), Vec<NoteEvent>>,
    last_cc: HashMap<(u8, u8), u8>,
    last_cc_tick: Option<i64>,
    cc_sent_tick_global: u32,
    cc_sent_tick_per_track: HashMap<u8, u32>,
    pub metrics: Metrics,
    limits: CcLimits,
    rng: DeterministicRng,
    lfo_state: HashMap<String, LfoState>,
}

impl<S: Sink> Engine<S> {
    pub fn new(sink: S, limits: CcLimits) -> Self {
        Self {
            sink,
            doc: None,
            step_ticks: 0,
            tick: -1,
            playing: false,
            active: HashMap::new(),
            last_cc: HashMap::new(),
            last_cc_tick: None,
            cc_sent_tick_global: 0,
            cc_sent_tick_per_track: HashMap::new(),
            metrics: Metrics::default(),
            limits,
            rng: DeterministicRng::new(0),
            lfo_state: HashMap::new(),
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Install a document. The active-notes ledger is never touched, so
    /// in-flight notes still terminate at their scheduled off-tick.
    pub fn load(&mut self, doc: LoopDoc) {
        let ppq = doc.meta.ppq.max(1);
        let spb = doc.meta.steps_per_bar.max(1);
        self.step_ticks = (ppq as i64 * 4) / spb as i64;
        self.doc = Some(doc);
    }

    pub fn replace_doc(&mut self, doc: LoopDoc) {
        self.load(doc);
    }

    pub fn start(&mut self) {
        self.playing = true;
        self.lfo_state.clear();
    }

    /// Emit offs for any lingering notes, panic, and clear the ledger.
    pub fn stop(&mut self) {
        for ((ch, pitch), stack) in self.active.drain() {
            for _ in stack {
                let _ = self.sink.note_off(ch, pitch);
                self.metrics.msgs_note_off += 1;
            }
        }
        if self.sink.panic().is_ok() {
            self.metrics.msgs_cc += 48;
        }
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn doc_version_doc(&self) -> Option<&LoopDoc> {
        self.doc.as_ref()
    }

    pub fn active_note_count(&self) -> usize {
        self.active.values().map(|v| v.len()).sum()
    }

    /// Call once per tick, in monotonically increasing order.
    pub fn on_tick(&mut self, tick: i64) {
        self.tick = tick;
        self.emit_due_offs(tick);
        if !self.playing || self.doc.is_none() {
            return;
        }
        self.emit_due_ons(tick);
        self.emit_cc_updates(tick);
    }

    fn emit_due_offs(&mut self, tick: i64) {
        let mut emptied = Vec::new();
        for (key, stack) in self.active.iter_mut() {
            let (ch, pitch) = *key;
            let mut i = 0;
            while i < stack.len() {
                if stack[i].off_tick <= tick {
                    let _ = self.sink.note_off(ch, pitch);
                    self.metrics.msgs_note_off += 1;
                    stack.remove(i);
                } else {
                    i += 1;
                }
            }
            if stack.is_empty() {
                emptied.push(key);
            }
        }
        for key in emptied {
            self.active.remove(&key);
        }
    }

    fn emit_due_ons(&mut self, tick: i64) {
        if self.step_ticks <= 0 {
            return;
        }
        let doc = self.doc.take().expect("checked by caller");
        let spb = doc.meta.steps_per_bar.max(1) as i64;
        let bar_ticks = self.step_ticks * spb;
        let bpm = doc.meta.tempo;
        let ppq = doc.meta.ppq as f64;
        let ticks_per_ms = (ppq * bpm) / 60_000.0;
        let key_name = doc.meta.key.clone().unwrap_or_else(|| "C".to_string());
        let mode = doc.meta.mode.unwrap_or(Mode::Major);

        for track in &doc.tracks {
            let ch = track.midi_channel;
            let length_bars = track.pattern.length_bars.max(1) as i64;
            let period = (bar_ticks * length_bars).max(1);
            let tick_in_loop = tick.rem_euclid(period);

            for step in &track.pattern.steps {
                let base_step_tick =
                    (step.idx as i64).rem_euclid(spb * length_bars) * self.step_ticks;
                for event in &step.events {
                    let offset_ticks = (event.microshift_ms as f64 * ticks_per_ms).round() as i64;
                    let scheduled = (base_step_tick + offset_ticks).rem_euclid(period);
                    if tick_in_loop != scheduled {
                        continue;
                    }
                    if event.prob <= 0.0 {
                        continue;
                    }
                    if event.prob < 1.0 && self.rng.next_f64() > event.prob {
                        continue;
                    }

                    let pitches: Vec<i64> = match event.pitch_source() {
                        Some(PitchSource::Pitch(p)) => vec![p],
                        Some(PitchSource::Degree { degree, octave_offset }) => {
                            vec![theory::degree_to_pitch(degree, octave_offset, &key_name, mode)]
                        }
                        Some(PitchSource::Chord(c)) => {
                            let register = event
                                .register
                                .as_ref()
                                .map(|(lo, hi)| (lo.as_str(), hi.as_str()));
                            theory::expand_chord(c, &key_name, mode, register)
                        }
                        None => continue,
                    };
                    if pitches.is_empty() {
                        continue;
                    }

                    let base_len =
                        ((self.step_ticks as f64) * event.length_steps as f64 * event.gate)
                            .max(1.0) as i64;
                    let reps = event.ratchet.max(1) as i64;
                    let seg = (base_len / reps).max(1);
                    for r in 0..reps {
                        let on_tick_abs = tick + r * seg;
                        let off_tick = on_tick_abs + seg;
                        for p in &pitches {
                            let pitch = (*p).clamp(0, 127) as u8;
                            let _ = self.sink.note_on(ch, pitch, event.velocity);
                            self.metrics.msgs_note_on += 1;
                            self.active.entry((ch, pitch)).or_default().push(NoteEvent {
                                pitch,
                                velocity: event.velocity,
                                on_tick: on_tick_abs,
                                off_tick,
                            });
                        }
                    }
                }
            }

            self.emit_drum_kit(&doc, track, tick, bar_ticks, length_bars, spb);
        }
        self.doc = Some(doc);
    }

    fn emit_drum_kit(
        &mut self,
        doc: &LoopDoc,
        track: &groove_types::model::Track,
        tick: i64,
        bar_ticks: i64,
        length_bars: i64,
        spb: i64,
    ) {
        let Some(dk) = &track.drum_kit else { return };
        if self.step_ticks <= 0 || tick % self.step_ticks != 0 {
            return;
        }
        let repeat_bars = dk.repeat_bars.max(1) as i64;
        let default_len = dk.length_steps.max(1) as i64;
        let bar_in_loop = (tick / bar_ticks).rem_euclid(length_bars) + 1;
        let step_in_bar = (tick % bar_ticks) / self.step_ticks;
        let ch = track.midi_channel;

        for spec in &dk.patterns {
            let bar0 = spec.bar as i64;
            if !(bar0 <= bar_in_loop && bar_in_loop <= bar0 + repeat_bars - 1) {
                continue;
            }
            let chars: Vec<char> = spec.pattern.chars().collect();
            let idx = step_in_bar as usize;
            if idx >= chars.len() || chars[idx] != 'x' {
                continue;
            }
            let key = spec.key.trim().to_lowercase();
            let Some(pitch) = groove_types::maps::drum_pitch(&key, &doc.device_profile.drum_map)
            else {
                continue;
            };
            let vel = spec.vel.unwrap_or(100);
            let ls = spec.length_steps.unwrap_or(default_len as u32).max(1) as i64;
            let length_ticks = (self.step_ticks * ls).max(1);
            let off_tick = tick + length_ticks;
            let _ = self.sink.note_on(ch, pitch, vel);
            self.metrics.msgs_note_on += 1;
            self.active.entry((ch, pitch)).or_default().push(NoteEvent {
                pitch,
                velocity: vel,
                on_tick: tick,
                off_tick,
            });
        }
        let _ = spb;
    }

    fn emit_cc_updates(&mut self, tick: i64) {
        if self.step_ticks <= 0 {
            return;
        }
        let doc = self.doc.take().expect("checked by caller");
        let spb = doc.meta.steps_per_bar.max(1) as i64;
        let bar_ticks = self.step_ticks * spb;
        let bpm = doc.meta.tempo;
        let ppq = doc.meta.ppq as f64;
        let ticks_per_sec = (ppq * bpm) / 60.0;
        let ticks_per_ms = ticks_per_sec / 1000.0;
        let pos_in_bar_ticks = tick.rem_euclid(bar_ticks.max(1));

        if self.last_cc_tick != Some(tick) {
            self.last_cc_tick = Some(tick);
            self.cc_sent_tick_global = 0;
            self.cc_sent_tick_per_track.clear();
        }

        for (ti, track) in doc.tracks.iter().enumerate() {
            let ch = track.midi_channel;
            let length_bars = track.pattern.length_bars.max(1) as i64;
            let period = (bar_ticks * length_bars).max(1);
            let pos_in_period = tick.rem_euclid(period);

            let mut base_by_target: HashMap<(u8, u8), u8> = HashMap::new();
            let mut range_by_target: HashMap<(u8, u8), (u8, u8)> = HashMap::new();

            for lane in &track.cc_lanes {
                let Some(control) = lane.dest.resolve() else { continue };
                if lane.points.is_empty() {
                    continue;
                }
                let mut pts: Vec<(i64, u8, Curve)> = lane
                    .points
                    .iter()
                    .map(|p| {
                        let tt = resolve_time_pos(&p.t, period, bar_ticks, self.step_ticks, spb, length_bars);
                        (tt, p.v.min(127), p.curve.unwrap_or_default())
                    })
                    .collect();
                pts.sort_by_key(|(t, _, _)| *t);

                let pos = pos_in_period;
                let left_i = pts
                    .iter()
                    .rposition(|(t, _, _)| *t <= pos)
                    .unwrap_or(pts.len() - 1);
                let right_i = (left_i + 1) % pts.len();
                let (t_left, v_left, curve_left) = pts[left_i];
                let (t_right, v_right, _) = pts[right_i];

                let base_val = if lane.mode == CcMode::Hold {
                    v_left
                } else {
                    let frac = if t_right == t_left {
                        0.0
                    } else {
                        let seg = if t_right > t_left {
                            t_right - t_left
                        } else {
                            t_right + period - t_left
                        };
                        let prog = if pos >= t_left { pos - t_left } else { pos + period - t_left };
                        (prog as f64 / seg.max(1) as f64).clamp(0.0, 1.0)
                    };
                    let eased = match curve_left {
                        Curve::Linear => frac,
                        Curve::Exp => frac * frac,
                        Curve::Log => frac.sqrt(),
                        Curve::SCurve => 3.0 * frac * frac - 2.0 * frac * frac * frac,
                    };
                    (v_left as f64 + (v_right as f64 - v_left as f64) * eased).round() as u8
                };

                let send_ch = lane.channel.filter(|c| *c <= 15).unwrap_or(ch);
                let mut value = base_val;
                let mut lo_hi = None;
                if let Some((lo, hi)) = lane.range {
                    let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };
                    value = value.clamp(lo, hi);
                    lo_hi = Some((lo.min(127), hi.min(127)));
                }
                let key_t = (send_ch, control);
                base_by_target.insert(key_t, value.min(127));
                if let Some(lh) = lo_hi {
                    range_by_target
                        .entry(key_t)
                        .and_modify(|prev| *prev = (prev.0.max(lh.0), prev.1.min(lh.1)))
                        .or_insert(lh);
                }
            }

            let mut lfo_offset_sum: HashMap<(u8, u8), f64> = HashMap::new();
            for lfo in &track.lfos {
                let Some(control) = lfo.dest.resolve() else { continue };
                let send_ch = lfo.channel.filter(|c| *c <= 15).unwrap_or(ch);
                let depth = lfo.depth.min(127) as f64;
                let amp = 0.5 * depth;

                let tpc = ticks_per_cycle(&lfo.rate, ticks_per_sec, bar_ticks);
                if tpc <= 0.0 {
                    continue;
                }
                let cycle_pos = (pos_in_bar_ticks as f64 + lfo.phase * tpc).rem_euclid(tpc);
                let frac = cycle_pos / tpc;

                let state_key = format!("{ti}:{}", lfo.id);
                let norm = evaluate_lfo_shape(
                    lfo.shape,
                    frac,
                    &mut self.rng,
                    self.lfo_state.entry(state_key).or_default(),
                );

                let mut active = lfo.on.is_empty();
                let mut age_from_window_ms = None;
                for w in &lfo.on {
                    let a = resolve_time_pos(&w.from, period, bar_ticks, self.step_ticks, spb, length_bars);
                    let b = resolve_time_pos(&w.to, period, bar_ticks, self.step_ticks, spb, length_bars);
                    let (in_win, age_ticks) = if a <= b {
                        let in_win = pos_in_period >= a && pos_in_period <= b;
                        (in_win, (pos_in_period - a))
                    } else if pos_in_period >= a {
                        (true, pos_in_period - a)
                    } else if pos_in_period <= b {
                        (true, period - a + pos_in_period)
                    } else {
                        (false, 0)
                    };
                    if in_win {
                        active = true;
                        if ticks_per_ms > 0.0 {
                            age_from_window_ms = Some(age_ticks as f64 / ticks_per_ms);
                        }
                        break;
                    }
                }
                if !active {
                    continue;
                }

                let gain = if lfo.fade_ms > 0 && ticks_per_ms > 0.0 {
                    let age_ms_bar = pos_in_bar_ticks as f64 / ticks_per_ms;
                    let age_ms = age_from_window_ms.map_or(age_ms_bar, |w| age_ms_bar.min(w));
                    (age_ms / lfo.fade_ms as f64).clamp(0.0, 1.0)
                } else {
                    1.0
                };

                let key_t = (send_ch, control);
                *lfo_offset_sum.entry(key_t).or_insert(0.0) += norm * amp * gain;
            }

            let mut targets: Vec<(u8, u8)> = base_by_target
                .keys()
                .chain(lfo_offset_sum.keys())
                .copied()
                .collect();
            targets.sort_unstable();
            targets.dedup();

            let mut merged = Vec::with_capacity(targets.len());
            for key_t in targets {
                let center = base_by_target
                    .get(&key_t)
                    .copied()
                    .map(|v| v as f64)
                    .unwrap_or_else(|| {
                        track
                            .lfos
                            .iter()
                            .find(|lf| {
                                lf.dest.resolve() == Some(key_t.1)
                                    && lf.channel.filter(|c| *c <= 15).unwrap_or(ch) == key_t.0
                            })
                            .map(|lf| lf.offset as f64)
                            .unwrap_or(64.0)
                    });
                let offset_sum = lfo_offset_sum.get(&key_t).copied().unwrap_or(0.0);
                let mut value = (center + offset_sum).round() as i64;
                if let Some((lo, hi)) = range_by_target.get(&key_t) {
                    value = value.clamp(*lo as i64, *hi as i64);
                }
                let value = value.clamp(0, 127) as u8;
                merged.push((key_t.0, key_t.1, value));
            }

            for (send_ch, control, value) in merged {
                let per_track = *self.cc_sent_tick_per_track.get(&send_ch).unwrap_or(&0);
                if per_track >= self.limits.per_tick_track
                    || self.cc_sent_tick_global >= self.limits.per_tick_global
                {
                    self.metrics.shed_cc += 1;
                    continue;
                }
                let key = (send_ch, control);
                if self.last_cc.get(&key) == Some(&value) {
                    continue;
                }
                if self.sink.control_change(send_ch, control, value).is_ok() {
                    self.metrics.msgs_cc += 1;
                    self.last_cc.insert(key, value);
                    self.cc_sent_tick_global += 1;
                    self.cc_sent_tick_per_track.insert(send_ch, per_track + 1);
                } else {
                    self.metrics.shed_cc += 1;
                }
            }
        }
        self.doc = Some(doc);
    }
}

fn resolve_time_pos(
    t: &TimePos,
    period: i64,
    bar_ticks: i64,
    step_ticks: i64,
    spb: i64,
    length_bars: i64,
) -> i64 {
    match t {
        TimePos::Ticks { ticks } => ticks.rem_euclid(period),
        TimePos::BarStep { bar, step } => {
            ((bar.rem_euclid(length_bars.max(1))) * bar_ticks + (step.rem_euclid(spb)) * step_ticks)
                .rem_euclid(period)
        }
    }
}

/// Ticks-per-cycle for an LFO rate: either a direct Hz value or a tempo-sync
/// division like `1/8` or `1/8T` (triplet).
fn ticks_per_cycle(rate: &LfoRate, ticks_per_sec: f64, bar_ticks: i64) -> f64 {
    match rate {
        LfoRate::Hz { hz } if *hz > 0.0 && ticks_per_sec > 0.0 => ticks_per_sec / hz,
        LfoRate::Sync { sync } => {
            let s = sync.trim().to_uppercase();
            let triplet = s.ends_with('T');
            let body = if triplet { &s[..s.len() - 1] } else { s.as_str() };
            let denom = body
                .split('/')
                .nth(1)
                .and_then(|d| d.parse::<f64>().ok());
            match denom {
                Some(d) if d > 0.0 && bar_ticks > 0 => {
                    let eff = if triplet { d * 3.0 / 2.0 } else { d };
                    bar_ticks as f64 / eff
                }
                _ => default_tpc(bar_ticks),
            }
        }
        _ => default_tpc(bar_ticks),
    }
}

fn default_tpc(bar_ticks: i64) -> f64 {
    if bar_ticks > 0 {
        bar_ticks as f64 / 8.0
    } else {
        1.0
    }
}

fn evaluate_lfo_shape(
    shape: LfoShape,
    frac: f64,
    rng: &mut DeterministicRng,
    state: &mut LfoState,
) -> f64 {
    match shape {
        LfoShape::Sine => (2.0 * std::f64::consts::PI * frac).sin(),
        LfoShape::Triangle => 1.0 - 4.0 * (frac - 0.5).abs(),
        LfoShape::Ramp => 2.0 * frac - 1.0,
        LfoShape::Saw => 1.0 - 2.0 * frac,
        LfoShape::Square => {
            if frac >= 0.5 {
                1.0
            } else {
                -1.0
            }
        }
        LfoShape::Samplehold => {
            let wrapped = state.last_frac.map(|lf| frac < lf).unwrap_or(true);
            if wrapped {
                state.value = rng.next_f64() * 2.0 - 1.0;
            }
            state.last_frac = Some(frac);
            state.value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::VirtualSink;
    use groove_types::model::*;

    fn simple_doc() -> LoopDoc {
        LoopDoc {
            version: "1".into(),
            doc_version: 1,
            meta: Meta { tempo: 120.0, ppq: 96, steps_per_bar: 16, key: None, mode: None },
            device_profile: DeviceProfile::default(),
            tracks: vec![Track {
                id: "t1".into(),
                name: "lead".into(),
                kind: "synth".into(),
                midi_channel: 0,
                pattern: Pattern {
                    length_bars: 1,
                    steps: vec![Step {
                        idx: 0,
                        events: vec![Event {
                            pitch: Some(60),
                            degree: None,
                            octave_offset: 0,
                            chord: None,
                            velocity: 110,
                            length_steps: 1,
                            gate: 1.0,
                            prob: 1.0,
                            ratchet: 1,
                            microshift_ms: 0,
                            register: None,
                        }],
                    }],
                },
                drum_kit: None,
                cc_lanes: Vec::new(),
                lfos: Vec::new(),
            }],
        }
    }

    #[test]
    fn single_note_one_step_on_and_off() {
        let mut engine = Engine::new(VirtualSink::new(), CcLimits::default());
        engine.load(simple_doc());
        engine.start();
        for t in 0..=24 {
            engine.on_tick(t);
        }
        let events = engine.sink_mut().drain();
        assert!(events.contains(&crate::sink::SinkEvent::NoteOn { channel: 0, note: 60, velocity: 110 }));
        assert!(events.contains(&crate::sink::SinkEvent::NoteOff { channel: 0, note: 60 }));
    }

    #[test]
    fn replace_preserves_scheduled_off() {
        let mut engine = Engine::new(VirtualSink::new(), CcLimits::default());
        engine.load(simple_doc());
        engine.start();
        engine.on_tick(0);
        engine.sink_mut().drain();

        let mut other = simple_doc();
        other.tracks[0].pattern.steps[0].idx = 1;
        engine.replace_doc(other);

        for t in 1..=24 {
            engine.on_tick(t);
        }
        let events = engine.sink_mut().drain();
        assert!(events.contains(&crate::sink::SinkEvent::NoteOff { channel: 0, note: 60 }));
    }

    #[test]
    fn cc_budget_sheds_excess() {
        let mut doc = simple_doc();
        doc.tracks[0].cc_lanes = (0..20)
            .map(|i| CcLane {
                id: format!("lane{i}"),
                dest: CcDest::Number(20 + i as u8),
                mode: CcMode::Hold,
                channel: None,
                range: None,
                points: vec![CcPoint { t: TimePos::Ticks { ticks: 0 }, v: 10, curve: None }],
            })
            .collect();
        let mut engine = Engine::new(VirtualSink::new(), CcLimits { per_tick_global: 4, per_tick_track: 4 });
        engine.load(doc);
        engine.start();
        engine.on_tick(0);
        assert!(engine.metrics.shed_cc > 0);
    }
}
