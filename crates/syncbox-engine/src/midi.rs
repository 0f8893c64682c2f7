//! Raw MIDI messages and the output port abstraction written by the dispatcher.

use serde::{Deserialize, Serialize};

use crate::error::MidiWriteError;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const POLY_AFTERTOUCH: u8 = 0xA0;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const CHANNEL_AFTERTOUCH: u8 = 0xD0;
pub const PITCH_BEND: u8 = 0xE0;
pub const TIMING_CLOCK: u8 = 0xF8;
pub const ALL_NOTES_OFF: u8 = 0x7B;

/// Short MIDI message of one to three bytes, stored inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MidiMessage {
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiMessage {
    /// Builds a message from up to three bytes. Extra bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes(&[NOTE_ON | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes(&[NOTE_OFF | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    pub fn control_change(channel: u8, control: u8, value: u8) -> Self {
        Self::from_bytes(&[CONTROL_CHANGE | (channel & 0x0F), control & 0x7F, value & 0x7F])
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::from_bytes(&[PROGRAM_CHANGE | (channel & 0x0F), program & 0x7F])
    }

    pub fn timing_clock() -> Self {
        Self::from_bytes(&[TIMING_CLOCK])
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline]
    pub fn status(&self) -> u8 {
        self.data[0] & 0xF0
    }

    #[inline]
    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0F
    }

    pub fn is_note_on(&self) -> bool {
        self.status() == NOTE_ON && self.data[2] > 0
    }

    /// Note-off, including the running-status form of a zero velocity note-on.
    pub fn is_note_off(&self) -> bool {
        self.status() == NOTE_OFF || (self.status() == NOTE_ON && self.data[2] == 0)
    }
}

/// A message placed at a frame offset inside the current buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedMidi {
    pub frame: u32,
    pub message: MidiMessage,
}

/// Destination for sample-accurate MIDI events produced by the dispatcher.
pub trait MidiOutput {
    /// Called once at the top of every audio callback.
    fn begin_cycle(&mut self, nframes: u32);
    fn write(&mut self, frame: u32, message: MidiMessage) -> Result<(), MidiWriteError>;
}

/// Fixed capacity output port. Writes beyond capacity fail instead of growing.
#[derive(Debug, Clone)]
pub struct MidiPortBuffer {
    events: Vec<TimedMidi>,
    capacity: usize,
    nframes: u32,
}

impl MidiPortBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            nframes: 0,
        }
    }

    pub fn events(&self) -> &[TimedMidi] {
        &self.events
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl MidiOutput for MidiPortBuffer {
    fn begin_cycle(&mut self, nframes: u32) {
        self.events.clear();
        self.nframes = nframes;
    }

    fn write(&mut self, frame: u32, message: MidiMessage) -> Result<(), MidiWriteError> {
        if frame >= self.nframes {
            return Err(MidiWriteError::FrameOutOfRange {
                frame,
                nframes: self.nframes,
            });
        }
        if self.events.len() >= self.capacity {
            return Err(MidiWriteError::BufferFull);
        }
        self.events.push(TimedMidi { frame, message });
        Ok(())
    }
}

/// Events that did not fit into an output port, replayed at frame zero of
/// the next callback. Capacity is fixed when the engine is built.
#[derive(Debug)]
pub(crate) struct CarryOver {
    pending: Vec<MidiMessage>,
    dropped: u64,
}

impl CarryOver {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, message: MidiMessage) {
        if self.pending.len() < self.pending.capacity() {
            self.pending.push(message);
        } else {
            self.dropped = self.dropped.wrapping_add(1);
            tracing::warn!(dropped = self.dropped, "midi carry-over full, dropping event");
        }
    }

    /// Writes as many deferred events as the port takes at frame zero.
    pub(crate) fn flush<O: MidiOutput + ?Sized>(&mut self, port: &mut O) {
        let mut written = 0;
        for message in self.pending.iter() {
            if port.write(0, *message).is_err() {
                break;
            }
            written += 1;
        }
        self.pending.drain(..written);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
