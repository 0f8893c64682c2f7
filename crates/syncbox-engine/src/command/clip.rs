use serde::{Deserialize, Serialize};

use crate::source::ClipId;

/// Playback instruction for one clip on one sampler channel.
///
/// Every optional field is a `change_*` flag plus a value; an unset flag leaves
/// whatever the voice is already doing untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipCommand {
    pub clip: Option<ClipId>,
    /// Sampler channel, `-1` for the global channel.
    pub midi_channel: i8,
    pub midi_note: u8,
    /// `-1` plays the root slice.
    pub slice: i32,
    /// `-1` is the prime voice.
    pub subvoice: i32,
    /// `-1` is no group.
    pub exclusivity_group: i32,
    pub start_playback: bool,
    pub stop_playback: bool,
    pub change_looping: bool,
    pub looping: bool,
    pub change_pitch: bool,
    pub pitch_change: f32,
    pub change_speed: bool,
    pub speed_ratio: f32,
    pub change_gain_db: bool,
    pub gain_db: f32,
    pub change_volume: bool,
    pub volume: f32,
    pub change_pan: bool,
    pub pan: f32,
    pub set_start_position: bool,
    /// Seconds into the sample.
    pub start_position: f64,
    pub set_stop_position: bool,
    pub stop_position: f64,
}

impl Default for ClipCommand {
    fn default() -> Self {
        Self {
            clip: None,
            midi_channel: -1,
            midi_note: 60,
            slice: -1,
            subvoice: -1,
            exclusivity_group: -1,
            start_playback: false,
            stop_playback: false,
            change_looping: false,
            looping: false,
            change_pitch: false,
            pitch_change: 1.0,
            change_speed: false,
            speed_ratio: 1.0,
            change_gain_db: false,
            gain_db: 0.0,
            change_volume: false,
            volume: 0.0,
            change_pan: false,
            pan: 0.0,
            set_start_position: false,
            start_position: 0.0,
            set_stop_position: false,
            stop_position: 0.0,
        }
    }
}

/// Identity used to decide whether two commands address the same sounding note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub clip: Option<ClipId>,
    pub midi_note: u8,
    pub subvoice: i32,
    pub slice: i32,
    pub midi_channel: i8,
}

impl ClipCommand {
    pub fn for_clip(clip: ClipId, midi_channel: i8) -> Self {
        Self {
            clip: Some(clip),
            midi_channel,
            ..Self::default()
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn key(&self) -> CommandKey {
        CommandKey {
            clip: self.clip,
            midi_note: self.midi_note,
            subvoice: self.subvoice,
            slice: self.slice,
            midi_channel: self.midi_channel,
        }
    }

    pub fn equivalent_to(&self, other: &ClipCommand) -> bool {
        self.key() == other.key()
    }

    /// Folds the flagged fields of `other` into `self`. Start requests are
    /// OR-ed in, everything else is copied only when its flag is set.
    pub fn merge_from(&mut self, other: &ClipCommand) {
        if other.change_looping {
            self.change_looping = true;
            self.looping = other.looping;
        }
        if other.change_pitch {
            self.change_pitch = true;
            self.pitch_change = other.pitch_change;
        }
        if other.change_speed {
            self.change_speed = true;
            self.speed_ratio = other.speed_ratio;
        }
        if other.change_gain_db {
            self.change_gain_db = true;
            self.gain_db = other.gain_db;
        }
        if other.change_volume {
            self.change_volume = true;
            self.volume = other.volume;
        }
        if other.change_pan {
            self.change_pan = true;
            self.pan = other.pan;
        }
        if other.set_start_position {
            self.set_start_position = true;
            self.start_position = other.start_position;
        }
        if other.set_stop_position {
            self.set_stop_position = true;
            self.stop_position = other.stop_position;
        }
        if other.start_playback {
            self.start_playback = true;
        }
    }

    /// Sampler channel slot, global first.
    pub fn channel_slot(&self) -> usize {
        (self.midi_channel.max(-1) + 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_copies_only_flagged_fields() {
        let mut existing = ClipCommand::for_clip(3, 0);
        existing.change_volume = true;
        existing.volume = 0.25;
        existing.pan = -0.5;

        let mut incoming = ClipCommand::for_clip(3, 0);
        incoming.start_playback = true;
        incoming.change_pitch = true;
        incoming.pitch_change = 2.0;
        incoming.pan = 0.9;

        existing.merge_from(&incoming);
        assert!(existing.start_playback);
        assert_eq!(existing.pitch_change, 2.0);
        assert_eq!(existing.volume, 0.25);
        assert_eq!(existing.pan, -0.5);
    }

    #[test]
    fn equivalence_ignores_payload() {
        let mut a = ClipCommand::for_clip(1, 2);
        let mut b = ClipCommand::for_clip(1, 2);
        a.volume = 1.0;
        b.start_playback = true;
        assert!(a.equivalent_to(&b));
        b.subvoice = 0;
        assert!(!a.equivalent_to(&b));
    }

    #[test]
    fn clear_restores_defaults() {
        let mut command = ClipCommand::for_clip(9, 4);
        command.stop_playback = true;
        command.clear();
        assert_eq!(command, ClipCommand::default());
        assert_eq!(command.channel_slot(), 0);
    }
}
