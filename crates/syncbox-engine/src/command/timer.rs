use std::sync::Arc;

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

use super::pool::{ClipHandle, PoolRecord};
use crate::source::Clip;

pub const TIMER_TEXT_CAPACITY: usize = 64;
pub type TimerText = ArrayString<TIMER_TEXT_CAPACITY>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimerOperation {
    #[default]
    Invalid,
    /// `parameter == 1` starts in song mode with `parameter2` as offset and
    /// `big_parameter` as duration.
    StartPlayback,
    StopPlayback,
    /// `parameter` is the sampler channel (-1 global), `parameter2` non-zero enables.
    SamplerChannelEnabledState,
    ClipCommand,
    /// `parameter` holds the new tempo.
    SetBpm,
    Automation,
    Passthrough,
    GuiMessage,
    ChannelRecorderStart,
    ChannelRecorderStop,
    MidiRecorderStart,
    MidiRecorderStop,
    /// `parameter` is the track, `parameter2..=parameter4` the bytes. A byte
    /// outside `0..=255` ends the message.
    SendMidiMessage,
    RegisterClip,
    UnregisterClip,
    StartPart,
    StopPart,
}

impl TimerOperation {
    /// Operations that only matter to whoever consumes engine events.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            TimerOperation::StartPart
                | TimerOperation::StopPart
                | TimerOperation::Automation
                | TimerOperation::Passthrough
        )
    }
}

/// Timed operation executed by the audio callback when its step is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerCommand {
    pub operation: TimerOperation,
    pub parameter: i32,
    pub parameter2: i32,
    pub parameter3: i32,
    pub parameter4: i32,
    pub big_parameter: u64,
    pub text: TimerText,
}

impl TimerCommand {
    pub fn new(operation: TimerOperation) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    pub fn with_parameters(mut self, parameters: [i32; 4]) -> Self {
        self.parameter = parameters[0];
        self.parameter2 = parameters[1];
        self.parameter3 = parameters[2];
        self.parameter4 = parameters[3];
        self
    }

    /// Stores as much of `text` as fits, cutting at a character boundary.
    pub fn with_text(mut self, text: &str) -> Self {
        self.text.clear();
        for ch in text.chars() {
            if self.text.try_push(ch).is_err() {
                break;
            }
        }
        self
    }

    pub fn parameters(&self) -> [i32; 4] {
        [self.parameter, self.parameter2, self.parameter3, self.parameter4]
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Bytes of a `SendMidiMessage` payload.
    pub fn midi_bytes(&self) -> ([u8; 3], usize) {
        let in_range = |value: i32| (0..=255).contains(&value);
        let size = if in_range(self.parameter4) {
            3
        } else if in_range(self.parameter3) {
            2
        } else {
            1
        };
        (
            [
                self.parameter2.clamp(0, 255) as u8,
                self.parameter3.clamp(0, 255) as u8,
                self.parameter4.clamp(0, 255) as u8,
            ],
            size,
        )
    }
}

/// Pooled timer command plus whatever it carries by ownership.
#[derive(Default)]
pub(crate) struct TimerRecord {
    pub command: TimerCommand,
    pub clip_command: Option<ClipHandle>,
    pub registration: Option<Arc<Clip>>,
}

impl PoolRecord for TimerRecord {
    fn reset(&mut self) {
        if self.clip_command.take().is_some() {
            tracing::error!("timer command recycled while still holding a clip command");
        }
        self.command.clear();
        self.registration = None;
    }
}
