use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::time::{latency_millis, Tempo, BPM_MAXIMUM, DEFAULT_BPM, TICKS_PER_BAR};

pub const DEFAULT_TRACK_COUNT: usize = 10;
pub const MIDI_CHANNEL_COUNT: usize = 16;
const MIN_GRACE_USECS: u64 = 1_000;
const MIN_CLIP_COMMANDS: usize = 4_096;
const MIN_TIMER_COMMANDS: usize = 1_024;

/// Engine-wide settings. Everything sized at startup is derived from this
/// through [`RingSizing::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub buffer_size: u32,
    /// Largest output latency reported by the audio backend, in frames.
    pub latency_max_frames: u32,
    pub bpm: u64,
    pub track_count: usize,
    /// MIDI channel reserved for zone-wide messages, never handed out for notes.
    pub master_channel: u8,
    /// Farthest anything may be scheduled into the future.
    pub max_lookahead_bars: u32,
    /// Audio periods a released command must wait before it is reused.
    pub grace_periods: u32,
    pub clip_command_capacity: Option<usize>,
    pub timer_command_capacity: Option<usize>,
    pub voice_count: usize,
    /// Events a single MIDI output port accepts per callback.
    pub midi_events_per_callback: usize,
    pub tick_spin_margin_us: u64,
    /// Spawn the tick thread. Without it the owner drives `Scheduler::tick`.
    pub tick_thread: bool,
    /// `SCHED_FIFO` priority for the tick thread, `None` leaves it alone.
    pub realtime_priority: Option<i32>,
    pub midi_clock: bool,
    pub metronome: bool,
    pub grain_seed: u64,
    pub event_queue_capacity: usize,
    pub midi_input_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 256,
            latency_max_frames: 0,
            bpm: DEFAULT_BPM,
            track_count: DEFAULT_TRACK_COUNT,
            master_channel: 15,
            max_lookahead_bars: 64,
            grace_periods: 2,
            clip_command_capacity: None,
            timer_command_capacity: None,
            voice_count: 128,
            midi_events_per_callback: 256,
            tick_spin_margin_us: 100,
            tick_thread: true,
            realtime_priority: Some(70),
            midi_clock: false,
            metronome: false,
            grain_seed: 0x5eed,
            event_queue_capacity: 1_024,
            midi_input_capacity: 512,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text).context("failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rate must be non-zero"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer size must be non-zero"));
        }
        if self.track_count == 0 {
            return Err(ConfigError::Invalid("at least one track is required"));
        }
        if self.master_channel as usize >= MIDI_CHANNEL_COUNT {
            return Err(ConfigError::Invalid("master channel must be below 16"));
        }
        if self.max_lookahead_bars == 0 {
            return Err(ConfigError::Invalid("look-ahead must cover at least one bar"));
        }
        if self.voice_count == 0 {
            return Err(ConfigError::Invalid("voice pool must not be empty"));
        }
        if self.midi_events_per_callback == 0 {
            return Err(ConfigError::Invalid("midi output capacity must be non-zero"));
        }
        Ok(())
    }

    pub fn tempo(&self) -> Tempo {
        Tempo::new(self.bpm)
    }

    pub fn latency_millis(&self) -> u64 {
        latency_millis(self.buffer_size, self.latency_max_frames, self.sample_rate)
    }

    /// Sampler channels: one global channel followed by one per track.
    pub fn sampler_channel_count(&self) -> usize {
        self.track_count + 1
    }

    pub fn period_usecs(&self) -> f64 {
        self.buffer_size as f64 * 1_000_000.0 / self.sample_rate.max(1) as f64
    }
}

/// Capacities and timing windows fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSizing {
    pub step_ring: usize,
    pub clip_commands: usize,
    pub timer_commands: usize,
    pub grace_usecs: u64,
    pub max_schedule_ahead: u64,
}

impl RingSizing {
    pub fn derive(config: &EngineConfig) -> Self {
        let period = config.period_usecs();
        let grace_usecs = ((period * config.grace_periods.max(1) as f64).ceil() as u64)
            .max(MIN_GRACE_USECS);

        // Fastest tempo gives the most ticks per latency window.
        let max_schedule_ahead = Tempo::new(BPM_MAXIMUM).schedule_ahead_ticks(config.latency_millis());
        let lookahead = config.max_lookahead_bars as u64 * TICKS_PER_BAR;
        // One extra bar leaves room for the bundle anchor and bar quantisation.
        let needed = lookahead + 2 * max_schedule_ahead + TICKS_PER_BAR;
        let step_ring = (needed as usize).next_power_of_two();

        // Every voice may hold a command while the grace window retires as many again.
        let in_flight = config.voice_count * (config.grace_periods.max(1) as usize + 2) * 4;
        let clip_commands = config
            .clip_command_capacity
            .unwrap_or_else(|| in_flight.max(MIN_CLIP_COMMANDS).next_power_of_two());
        let timer_commands = config
            .timer_command_capacity
            .unwrap_or_else(|| (config.track_count * 64).max(MIN_TIMER_COMMANDS).next_power_of_two());

        Self {
            step_ring,
            clip_commands,
            timer_commands,
            grace_usecs,
            max_schedule_ahead,
        }
    }
}
