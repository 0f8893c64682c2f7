use serde::{Deserialize, Serialize};

/// Scheduling resolution: ticks per quarter note.
pub const TICKS_PER_BEAT: u64 = 96;
pub const BEATS_PER_BAR: u64 = 4;
pub const TICKS_PER_BAR: u64 = TICKS_PER_BEAT * BEATS_PER_BAR;
/// A MIDI beat clock (0xF8) goes out every this many ticks (24 PPQN).
pub const TICKS_PER_MIDI_CLOCK: u64 = TICKS_PER_BEAT / 24;

pub const BPM_MINIMUM: u64 = 50;
pub const BPM_MAXIMUM: u64 = 200;
pub const DEFAULT_BPM: u64 = 120;

const NANOS_PER_MINUTE: f64 = 60_000_000_000.0;

/// Integer tempo, always kept inside `BPM_MINIMUM..=BPM_MAXIMUM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tempo(u64);

impl Tempo {
    pub fn new(bpm: u64) -> Self {
        Self(bpm.clamp(BPM_MINIMUM, BPM_MAXIMUM))
    }

    #[inline]
    pub fn bpm(&self) -> u64 {
        self.0
    }

    /// Length of a single tick in nanoseconds.
    #[inline]
    pub fn tick_nanos(&self) -> f64 {
        NANOS_PER_MINUTE / (self.0 as f64 * TICKS_PER_BEAT as f64)
    }

    #[inline]
    pub fn tick_micros(&self) -> f64 {
        self.tick_nanos() / 1_000.0
    }

    #[inline]
    pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        (ticks as f64 * self.tick_nanos()) as u64
    }

    /// Whole ticks that fit into `nanos`.
    #[inline]
    pub fn nanos_to_ticks(&self, nanos: u64) -> u64 {
        (nanos as f64 / self.tick_nanos()) as u64
    }

    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        self.ticks_to_nanos(ticks) as f64 / 1_000_000_000.0
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> u64 {
        self.nanos_to_ticks((seconds * 1_000_000_000.0).floor().max(0.0) as u64)
    }

    /// Number of ticks events must be placed ahead of the playhead so that they
    /// are never due sooner than one full audio latency into the future.
    pub fn schedule_ahead_ticks(&self, latency_millis: u64) -> u64 {
        self.nanos_to_ticks(latency_millis * 1_000_000) + 1
    }

    pub fn faster(&self) -> Self {
        Self::new(self.0.saturating_add(1))
    }

    pub fn slower(&self) -> Self {
        Self::new(self.0.saturating_sub(1))
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self(DEFAULT_BPM)
    }
}

/// Whole milliseconds of output latency, using whichever is larger of the
/// buffer size and the reported maximum latency.
pub fn latency_millis(buffer_size: u32, latency_max: u32, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (1_000.0 * buffer_size.max(latency_max) as f64 / sample_rate as f64) as u64
}

/// Bar/Beat/Tick position exported for external transports.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimecodePosition {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
    pub bar_start_tick: u32,
    pub beats_per_bar: u32,
    pub ticks_per_beat: u32,
    pub beats_per_minute: f64,
}
