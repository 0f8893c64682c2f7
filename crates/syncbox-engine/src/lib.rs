//! Syncbox Engine
//! ==============
//! Sample-accurate scheduling for a live sequencer. Control code queues MIDI,
//! clip and timer commands ticks ahead of time through a [`Scheduler`]; the
//! [`AudioEngine`] running inside the audio callback dispatches them at the
//! right sample offset and plays clips through a pooled sampler.

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
mod grain;
pub mod midi;
pub mod rt;
mod sampler;
pub mod scheduler;
pub mod source;
mod step;
pub mod tick;
pub mod time;
mod transport;
mod voice;

use std::sync::Arc;

use anyhow::Context;

pub use command::{ClipCommand, PoolStats, TimerCommand, TimerOperation};
pub use config::{EngineConfig, RingSizing};
pub use dispatcher::{AudioEngine, ClockSnapshot, CycleTimes};
pub use error::{ConfigError, MidiWriteError, ScheduleError};
pub use events::{EngineEvent, EngineEvents, MidiInput, MidiInputEvent};
pub use midi::{MidiMessage, MidiOutput, MidiPortBuffer, TimedMidi};
pub use scheduler::{PoolReport, Scheduler, TickListener, DEFAULT_BUNDLE_DELAY};
pub use source::{
    AdsrParameters, Clip, ClipId, ClipSettings, GranularSettings, PickingStyle, PlaybackStyle,
    PositionReport, SliceSettings, SubvoiceSettings,
};
pub use time::{Tempo, TimecodePosition, TICKS_PER_BAR, TICKS_PER_BEAT};

/// Builds the three halves of an engine: the cloneable control handle, the
/// audio side for the callback, and the receiver for its notifications.
pub fn build(config: EngineConfig) -> anyhow::Result<(Scheduler, AudioEngine, EngineEvents)> {
    config.validate().context("invalid engine configuration")?;
    let event_capacity = config.event_queue_capacity;
    let midi_capacity = config.midi_input_capacity;
    let core = Arc::new(scheduler::Core::new(config));
    let sizing = core.sizing;
    let scheduler = Scheduler::new(Arc::clone(&core)).context("failed to start the scheduler")?;
    let (bridge, events) = events::event_channel(event_capacity);
    let engine = AudioEngine::new(core, bridge, events::midi_input_channel(midi_capacity));
    tracing::info!(
        step_ring = sizing.step_ring,
        clip_commands = sizing.clip_commands,
        timer_commands = sizing.timer_commands,
        grace_usecs = sizing.grace_usecs,
        "engine built"
    );
    Ok((scheduler, engine, events))
}
