//! The MIDI output port (C1): the engine's only way to affect the outside
//! world.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, control: u8, value: u8 },
}

#[derive(Debug, Clone)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// The only surface the engine uses to emit MIDI. `on_tick` must never
/// observe a sink failure as fatal — callers log and continue.
pub trait Sink {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), SinkError>;
    fn note_off(&mut self, channel: u8, note: u8) -> Result<(), SinkError>;
    fn control_change(&mut self, channel: u8, control: u8, value: u8) -> Result<(), SinkError>;

    /// All-channels-off: CC64 (sustain), CC120 (all sound off), CC123 (all
    /// notes off) on every channel. The default impl is built from
    /// `control_change` so implementors only need the three basics.
    fn panic(&mut self) -> Result<(), SinkError> {
        for channel in 0..16u8 {
            self.control_change(channel, 64, 0)?;
            self.control_change(channel, 120, 0)?;
            self.control_change(channel, 123, 0)?;
        }
        Ok(())
    }
}

/// An in-memory sink recording every emitted event, for tests and for
/// dry-run CLI invocations.
#[derive(Debug, Default)]
pub struct VirtualSink {
    pub events: Vec<SinkEvent>,
}

impl VirtualSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<SinkEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Sink for VirtualSink {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), SinkError> {
        self.events.push(SinkEvent::NoteOn { channel, note, velocity });
        Ok(())
    }

    fn note_off(&mut self, channel: u8, note: u8) -> Result<(), SinkError> {
        self.events.push(SinkEvent::NoteOff { channel, note });
        Ok(())
    }

    fn control_change(&mut self, channel: u8, control: u8, value: u8) -> Result<(), SinkError> {
        self.events.push(SinkEvent::ControlChange { channel, control, value });
        Ok(())
    }
}

/// Hardware output over a `midir` port, retried by the caller every 1.5s
/// until the port opens successfully.
#[cfg(feature = "hardware")]
pub struct MidirSink {
    conn: midir::MidiOutputConnection,
}

#[cfg(feature = "hardware")]
impl MidirSink {
    pub fn open(port_name_substr: &str) -> Result<Self, SinkError> {
        let midi_out = midir::MidiOutput::new("groove").map_err(|e| SinkError(e.to_string()))?;
        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|n| n.contains(port_name_substr))
                    .unwrap_or(false)
            })
            .ok_or_else(|| SinkError(format!("no MIDI port matching {port_name_substr}")))?;
        let conn = midi_out
            .connect(port, "groove-output")
            .map_err(|e| SinkError(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[cfg(feature = "hardware")]
impl Sink for MidirSink {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), SinkError> {
        self.conn
            .send(&[0x90 | (channel & 0x0F), note, velocity])
            .map_err(|e| SinkError(e.to_string()))
    }

    fn note_off(&mut self, channel: u8, note: u8) -> Result<(), SinkError> {
        self.conn
            .send(&[0x80 | (channel & 0x0F), note, 0])
            .map_err(|e| SinkError(e.to_string()))
    }

    fn control_change(&mut self, channel: u8, control: u8, value: u8) -> Result<(), SinkError> {
        self.conn
            .send(&[0xB0 | (channel & 0x0F), control, value])
            .map_err(|e| SinkError(e.to_string()))
    }
}

impl Sink for Box<dyn Sink + Send> {
    fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> Result<(), SinkError> {
        (**self).note_on(channel, note, velocity)
    }

    fn note_off(&mut self, channel: u8, note: u8) -> Result<(), SinkError> {
        (**self).note_off(channel, note)
    }

    fn control_change(&mut self, channel: u8, control: u8, value: u8) -> Result<(), SinkError> {
        (**self).control_change(channel, control, value)
    }

    fn panic(&mut self) -> Result<(), SinkError> {
        (**self).panic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_sink_records_events() {
        let mut sink = VirtualSink::new();
        sink.note_on(0, 60, 110).unwrap();
        sink.note_off(0, 60).unwrap();
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert!(sink.events.is_empty());
    }

    #[test]
    fn panic_sends_three_ccs_per_channel() {
        let mut sink = VirtualSink::new();
        sink.panic().unwrap();
        let events = sink.drain();
        assert_eq!(events.len(), 48);
        assert!(events.contains(&SinkEvent::ControlChange { channel: 15, control: 123, value: 0 }));
    }
}
