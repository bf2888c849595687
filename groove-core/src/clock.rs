//! The tick source (C2): an internal timer-driven clock or an external
//! 24-PPQN MIDI clock feed, both reduced to the engine's own tick grid.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// MIDI clock runs at 24 pulses per quarter note regardless of the engine's
/// own `ppq`; this is the conversion factor between the two grids.
const MIDI_CLOCK_PPQN: u32 = 24;

/// Rolling jitter sample buffer with nearest-rank percentile reporting.
#[derive(Debug)]
pub struct JitterTracker {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl JitterTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a new jitter sample in microseconds (absolute deviation from
    /// the expected tick interval).
    pub fn record(&mut self, sample_us: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_us);
    }

    fn percentile(&self, pct: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    pub fn p95(&self) -> Option<f64> {
        self.percentile(95.0)
    }

    pub fn p99(&self) -> Option<f64> {
        self.percentile(99.0)
    }
}

/// Internal timer-driven clock: advances ticks at a fixed interval derived
/// from `bpm` and the document's `ppq`.
#[derive(Debug)]
pub struct InternalClock {
    ppq: u32,
    bpm: f64,
    tick: i64,
    jitter: JitterTracker,
}

impl InternalClock {
    pub fn new(ppq: u32, bpm: f64) -> Self {
        Self {
            ppq,
            bpm,
            tick: -1,
            jitter: JitterTracker::new(512),
        }
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Expected wall-clock duration between two consecutive ticks.
    pub fn expected_interval(&self) -> Duration {
        let ticks_per_minute = self.bpm * self.ppq as f64;
        Duration::from_secs_f64(60.0 / ticks_per_minute)
    }

    /// Called by the tick driver once per elapsed interval. Records the
    /// deviation between the expected and actual interval, then returns the
    /// next tick index.
    pub fn advance(&mut self, actual_interval: Duration) -> i64 {
        let expected = self.expected_interval();
        let deviation_us =
            (actual_interval.as_secs_f64() - expected.as_secs_f64()).abs() * 1_000_000.0;
        self.jitter.record(deviation_us);
        self.tick += 1;
        self.tick
    }

    pub fn jitter_p95(&self) -> Option<f64> {
        self.jitter.p95()
    }

    pub fn jitter_p99(&self) -> Option<f64> {
        self.jitter.p99()
    }

    pub fn current_tick(&self) -> i64 {
        self.tick
    }
}

/// MIDI realtime transport messages the external clock reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Start,
    Continue,
    Stop,
    SongPositionPointer(u16),
    ClockPulse,
}

/// Configuration for [`ExternalClock`]. Controls whether receiving a Song
/// Position Pointer while stopped is treated as an implicit `Continue`.
/// Default matches common hardware sequencer behavior.
#[derive(Debug, Clone, Copy)]
pub struct ExternalClockOptions {
    pub infer_continue_from_spp: bool,
}

impl Default for ExternalClockOptions {
    fn default() -> Self {
        Self {
            infer_continue_from_spp: true,
        }
    }
}

/// External clock: driven by incoming MIDI realtime bytes. Tempo is not
/// transmitted by the protocol, so it is estimated via an exponential
/// moving average over pulse-to-pulse intervals.
#[derive(Debug)]
pub struct ExternalClock {
    ppq: u32,
    adapter_ratio: u32,
    tick: i64,
    playing: bool,
    last_pulse_at: Option<Instant>,
    bpm_ema: Option<f64>,
    options: ExternalClockOptions,
}

const TEMPO_EMA_ALPHA: f64 = 0.15;

impl ExternalClock {
    pub fn new(ppq: u32, options: ExternalClockOptions) -> Self {
        Self {
            ppq,
            adapter_ratio: (ppq / MIDI_CLOCK_PPQN).max(1),
            tick: -1,
            playing: false,
            last_pulse_at: None,
            bpm_ema: None,
            options,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn current_tick(&self) -> i64 {
        self.tick
    }

    pub fn estimated_bpm(&self) -> Option<f64> {
        self.bpm_ema
    }

    /// Feed a transport event at wall-clock time `now`. Returns the sequence
    /// of new engine tick indices produced by this event (a clock pulse on
    /// `ppq > 24` fans out into `adapter_ratio` engine ticks).
    pub fn handle(&mut self, event: TransportEvent, now: Instant) -> Vec<i64> {
        match event {
            TransportEvent::Start => {
                self.tick = -1;
                self.playing = true;
                self.last_pulse_at = None;
                Vec::new()
            }
            TransportEvent::Continue => {
                self.playing = true;
                Vec::new()
            }
            TransportEvent::Stop => {
                self.playing = false;
                Vec::new()
            }
            TransportEvent::SongPositionPointer(beats_16th) => {
                if self.options.infer_continue_from_spp {
                    self.playing = true;
                }
                // one SPP unit = a sixteenth note = ppq/4 engine ticks.
                self.tick = beats_16th as i64 * (self.ppq as i64 / 4) - 1;
                Vec::new()
            }
            TransportEvent::ClockPulse => {
                if let Some(prev) = self.last_pulse_at {
                    let interval = now.duration_since(prev).as_secs_f64();
                    if interval > 0.0 {
                        let instantaneous_bpm = 60.0 / (interval * MIDI_CLOCK_PPQN as f64);
                        self.bpm_ema = Some(match self.bpm_ema {
                            Some(prev_bpm) => {
                                TEMPO_EMA_ALPHA * instantaneous_bpm
                                    + (1.0 - TEMPO_EMA_ALPHA) * prev_bpm
                            }
                            None => instantaneous_bpm,
                        });
                    }
                }
                self.last_pulse_at = Some(now);
                if !self.playing {
                    return Vec::new();
                }
                let mut ticks = Vec::with_capacity(self.adapter_ratio as usize);
                for _ in 0..self.adapter_ratio {
                    self.tick += 1;
                    ticks.push(self.tick);
                }
                ticks
            }
        }
    }
}

/// Either tick source, as consumed by the conductor's tick driver.
pub enum Clock {
    Internal(InternalClock),
    External(ExternalClock),
}

impl Clock {
    pub fn current_tick(&self) -> i64 {
        match self {
            Clock::Internal(c) => c.current_tick(),
            Clock::External(c) => c.current_tick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_tracker_nearest_rank_percentile() {
        let mut t = JitterTracker::new(512);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0] {
            t.record(v);
        }
        assert_eq!(t.p95(), Some(10.0));
    }

    #[test]
    fn internal_clock_advances_and_records_jitter() {
        let mut c = InternalClock::new(96, 120.0);
        let expected = c.expected_interval();
        let t0 = c.advance(expected);
        assert_eq!(t0, 0);
        let t1 = c.advance(expected + Duration::from_micros(50));
        assert_eq!(t1, 1);
        assert!(c.jitter_p95().unwrap() > 0.0);
    }

    #[test]
    fn external_clock_adapter_ratio_fans_out_pulses() {
        let mut c = ExternalClock::new(96, ExternalClockOptions::default());
        let t0 = Instant::now();
        c.handle(TransportEvent::Start, t0);
        let ticks = c.handle(TransportEvent::ClockPulse, t0 + Duration::from_millis(20));
        assert_eq!(ticks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn external_clock_spp_infers_continue() {
        let mut c = ExternalClock::new(96, ExternalClockOptions::default());
        assert!(!c.is_playing());
        c.handle(TransportEvent::SongPositionPointer(4), Instant::now());
        assert!(c.is_playing());
        assert_eq!(c.current_tick(), 4 * (96 / 4) - 1);
    }
}
