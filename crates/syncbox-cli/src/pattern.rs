//! Offline pattern playback: loads a JSON pattern, drives an engine through
//! simulated audio callbacks and collects everything it emits.

use std::f32::consts::TAU;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use syncbox_engine::{
    build, Clip, ClipCommand, ClipId, CycleTimes, EngineConfig, EngineEvent, MidiPortBuffer, PlaybackStyle,
    PoolReport, TimecodePosition, TimerCommand, TimerOperation, TICKS_PER_BAR,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pattern {
    pub bpm: Option<u64>,
    /// Bars to play after the transport starts.
    pub bars: u32,
    pub notes: Vec<NoteSpec>,
    pub clips: Vec<ClipSpec>,
    pub clip_commands: Vec<ClipCommandSpec>,
    pub timers: Vec<TimerSpec>,
    /// Count-in bars before the transport starts.
    pub countin_bars: u32,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            bpm: None,
            bars: 1,
            notes: Vec::new(),
            clips: Vec::new(),
            clip_commands: Vec::new(),
            timers: Vec::new(),
            countin_bars: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoteSpec {
    #[serde(default)]
    pub track: i32,
    #[serde(default)]
    pub channel: u8,
    pub note: u8,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
    pub delay: u64,
    pub duration: u64,
}

fn default_velocity() -> u8 {
    100
}

/// Sine test tone registered with the sampler.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipSpec {
    pub id: ClipId,
    pub seconds: f32,
    #[serde(default = "default_frequency")]
    pub frequency: f32,
    #[serde(default)]
    pub looping: bool,
    pub length_beats: Option<f32>,
}

fn default_frequency() -> f32 {
    440.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClipCommandSpec {
    pub clip: ClipId,
    #[serde(default = "default_channel")]
    pub channel: i8,
    pub delay: u64,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub stop: bool,
    pub volume: Option<f32>,
}

fn default_channel() -> i8 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerSpec {
    pub delay: u64,
    pub operation: TimerOperation,
    #[serde(default)]
    pub parameters: [i32; 4],
    #[serde(default)]
    pub text: String,
}

impl Pattern {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse pattern")
    }
}

/// One line of simulation output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dispatched {
    Midi {
        frame: u64,
        seconds: f64,
        track: usize,
        bytes: Vec<u8>,
    },
    Timer {
        frame: u64,
        operation: TimerOperation,
        parameters: [i32; 4],
        text: String,
    },
    ClipCommand {
        frame: u64,
        clip: Option<ClipId>,
        start: bool,
        stop: bool,
    },
    ClipReleased {
        clip: ClipId,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub callbacks: usize,
    pub frames: u64,
    pub peak: f32,
    pub timecode: TimecodePosition,
    pub pools: PoolReport,
    pub dropped_events: u64,
}

pub struct Simulation {
    pub dispatched: Vec<Dispatched>,
    pub summary: Summary,
}

fn sine_clip(tone: &ClipSpec, sample_rate: u32) -> Arc<Clip> {
    let len = (tone.seconds.max(0.0) * sample_rate as f32) as usize;
    let step = TAU * tone.frequency / sample_rate as f32;
    let samples = (0..len).map(|i| (i as f32 * step).sin() * 0.5).collect();
    let clip = Clip::new(tone.id, sample_rate, samples, None);
    clip.update_settings(|settings| {
        if tone.looping {
            settings.root.style = PlaybackStyle::Looping;
        }
        if let Some(beats) = tone.length_beats {
            settings.root.length_beats = beats;
        }
    });
    Arc::new(clip)
}

/// Plays `pattern` from a stopped transport and returns what came out.
pub fn simulate(mut config: EngineConfig, pattern: &Pattern) -> Result<Simulation> {
    // The simulation is the clock: ticks are driven from the callback loop.
    config.tick_thread = false;
    config.realtime_priority = None;
    if let Some(bpm) = pattern.bpm {
        config.bpm = bpm;
    }
    let sample_rate = config.sample_rate;
    let nframes = config.buffer_size;
    let mut ports: Vec<_> = (0..config.track_count)
        .map(|_| MidiPortBuffer::with_capacity(config.midi_events_per_callback))
        .collect();
    let (scheduler, mut engine, mut events) = build(config).context("failed to build engine")?;

    for clip in pattern.clips.iter() {
        scheduler.register_clip(sine_clip(clip, sample_rate), 0)?;
    }
    for note in pattern.notes.iter() {
        scheduler
            .schedule_note(note.note, note.channel, true, note.velocity, note.duration, note.delay, note.track)
            .with_context(|| format!("failed to schedule note {}", note.note))?;
    }
    for entry in pattern.clip_commands.iter() {
        let command = ClipCommand {
            start_playback: entry.start,
            stop_playback: entry.stop,
            change_volume: entry.volume.is_some(),
            volume: entry.volume.unwrap_or(0.0),
            ..ClipCommand::for_clip(entry.clip, entry.channel)
        };
        scheduler.schedule_clip_command(command, entry.delay)?;
    }
    for timer in pattern.timers.iter() {
        let command = TimerCommand::new(timer.operation)
            .with_parameters(timer.parameters)
            .with_text(&timer.text);
        scheduler.schedule_timer_command(timer.delay, command)?;
    }
    if pattern.countin_bars > 0 {
        scheduler.start_with_countin(pattern.countin_bars, false)?;
    } else {
        scheduler.start();
    }

    let usecs_per_frame = 1_000_000.0 / sample_rate as f64;
    let mut left = vec![0.0; nframes as usize];
    let mut right = vec![0.0; nframes as usize];
    let mut dispatched = Vec::new();
    let mut peak = 0.0f32;
    let mut callbacks = 0;
    let mut frames = 0;
    let countin = pattern.countin_bars as u64 * TICKS_PER_BAR;
    let target = pattern.bars as u64 * TICKS_PER_BAR + countin;

    for cycle in CycleTimes::sequence(sample_rate, nframes) {
        if scheduler.cumulative_playhead() >= target {
            break;
        }
        scheduler.tick();
        engine.process(&cycle, &mut ports, &mut left, &mut right);
        callbacks += 1;
        frames = cycle.current_frames + nframes as u64;
        peak = left
            .iter()
            .chain(right.iter())
            .fold(peak, |peak, sample| peak.max(sample.abs()));

        for (track, port) in ports.iter().enumerate() {
            for event in port.events() {
                let frame = cycle.current_frames + event.frame as u64;
                dispatched.push(Dispatched::Midi {
                    frame,
                    seconds: frame as f64 * usecs_per_frame / 1_000_000.0,
                    track,
                    bytes: event.message.bytes().to_vec(),
                });
            }
        }
        for event in events.drain() {
            scheduler.apply_transport_event(&event);
            dispatched.push(match event {
                EngineEvent::Timer { command, frame, .. } => Dispatched::Timer {
                    frame,
                    operation: command.operation,
                    parameters: command.parameters(),
                    text: command.text.to_string(),
                },
                EngineEvent::ClipCommandSent { command, frame } => Dispatched::ClipCommand {
                    frame,
                    clip: command.clip,
                    start: command.start_playback,
                    stop: command.stop_playback,
                },
                EngineEvent::ClipReleased(clip) => Dispatched::ClipReleased { clip: clip.id() },
            });
        }
        events.drain_positions().for_each(drop);
    }

    tracing::debug!(callbacks, frames, "simulation finished");
    Ok(Simulation {
        summary: Summary {
            callbacks,
            frames,
            peak,
            timecode: scheduler.timecode(),
            pools: scheduler.pool_stats(),
            dropped_events: events.dropped_events(),
        },
        dispatched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATTERN: &str = r#"{
        "bpm": 120,
        "bars": 1,
        "notes": [{ "note": 60, "delay": 0, "duration": 96 }],
        "clips": [{ "id": 1, "seconds": 0.25 }],
        "clip_commands": [{ "clip": 1, "delay": 4, "start": true, "volume": 1.0 }],
        "timers": [{ "delay": 8, "operation": "GuiMessage", "text": "hello" }]
    }"#;

    fn config() -> EngineConfig {
        EngineConfig {
            track_count: 2,
            max_lookahead_bars: 2,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn pattern_plays_notes_clips_and_timers() {
        let pattern = Pattern::from_json(PATTERN).expect("pattern");
        let simulation = simulate(config(), &pattern).expect("simulation");
        let midi: Vec<_> = simulation
            .dispatched
            .iter()
            .filter_map(|line| match line {
                Dispatched::Midi { frame, bytes, .. } => Some((*frame, bytes.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(midi, vec![(0, vec![0x90, 60, 100]), (24_000, vec![0x80, 60, 64])]);
        assert!(simulation
            .dispatched
            .iter()
            .any(|line| matches!(line, Dispatched::ClipCommand { clip: Some(1), start: true, .. })));
        assert!(simulation.dispatched.iter().any(|line| matches!(
            line,
            Dispatched::Timer { operation: TimerOperation::GuiMessage, text, .. } if text == "hello"
        )));
        assert!(simulation.summary.peak > 0.1);
        assert_eq!(simulation.summary.timecode.bar, 1);
    }

    #[test]
    fn incomplete_notes_fail_to_parse() {
        assert!(Pattern::from_json(r#"{ "notes": [{ "note": 60 }] }"#).is_err());
        let empty = Pattern::from_json("{}").expect("defaults");
        assert_eq!(empty.bars, 1);
    }
}
