//! Control-side handle for putting MIDI, clip and timer commands on the step ring.
//!
//! Nothing here touches playback state. Every operation resolves a slot in
//! the [`StepRing`] relative to the audio read head and leaves the rest to the
//! audio callback.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::command::{
    ClipCommand, ClipHandle, CommandPool, PoolStats, TimerCommand, TimerHandle, TimerOperation,
    TimerRecord,
};
use crate::config::{EngineConfig, RingSizing, MIDI_CHANNEL_COUNT};
use crate::error::ScheduleError;
use crate::events::EngineEvent;
use crate::midi::{MidiMessage, ALL_NOTES_OFF};
use crate::source::{Clip, ClipId};
use crate::step::{ChannelTable, Step, StepRing};
use crate::tick::{TickGenerator, TickSettings};
use crate::time::{latency_millis, Tempo, TimecodePosition, BEATS_PER_BAR, TICKS_PER_BAR, TICKS_PER_BEAT};
use crate::transport::TransportState;

/// Default anchor for timer command bundles.
pub const DEFAULT_BUNDLE_DELAY: u64 = 2;
const NOTE_OFF_VELOCITY: u8 = 64;
const COUNTIN_DISPLAY_PADDING_MS: u64 = 50;

/// Observer notified once per queued tick, with the position inside the bar.
///
/// Runs on the tick thread. Implementations must not register or remove
/// listeners from inside the callback.
pub trait TickListener: Send + Sync {
    fn on_tick(&self, beat: u64);
}

/// State shared between the control side and the audio callback.
pub(crate) struct Core {
    pub(crate) config: EngineConfig,
    pub(crate) sizing: RingSizing,
    pub(crate) transport: TransportState,
    pub(crate) steps: StepRing,
    pub(crate) clip_pool: CommandPool<ClipCommand>,
    pub(crate) timer_pool: CommandPool<TimerRecord>,
}

impl Core {
    pub(crate) fn new(config: EngineConfig) -> Self {
        let sizing = RingSizing::derive(&config);
        Self {
            transport: TransportState::new(config.tempo(), config.latency_millis()),
            steps: StepRing::new(sizing.step_ring, config.track_count),
            clip_pool: CommandPool::new("clip", sizing.clip_commands, sizing.grace_usecs),
            timer_pool: CommandPool::new("timer", sizing.timer_commands, sizing.grace_usecs),
            sizing,
            config,
        }
    }

    #[inline]
    pub(crate) fn now_usecs(&self) -> u64 {
        self.transport.now_usecs()
    }
}

struct ControlState {
    bundle_depth: u32,
    bundle: Vec<(TimerHandle, u64)>,
    channels: ChannelTable,
    /// Tick and tock clips.
    metronome: Option<(ClipId, ClipId)>,
    audible_metronome: bool,
    recently_requested_bpm: u64,
    current_track: usize,
}

struct Shared {
    core: Arc<Core>,
    control: Mutex<ControlState>,
    listeners: RwLock<Vec<Arc<dyn TickListener>>>,
    ticker: OnceCell<TickGenerator>,
}

/// Occupancy of both command pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub clip_commands: PoolStats,
    pub timer_commands: PoolStats,
}

/// Cloneable control handle. The tick thread stops once every clone is gone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<Core>) -> anyhow::Result<Self> {
        let config = &core.config;
        let control = ControlState {
            bundle_depth: 0,
            bundle: Vec::new(),
            channels: ChannelTable::new(config.track_count, config.master_channel),
            metronome: None,
            audible_metronome: config.metronome,
            recently_requested_bpm: config.tempo().bpm(),
            current_track: 0,
        };
        let settings = TickSettings {
            tempo: config.tempo(),
            spin_margin: Duration::from_micros(config.tick_spin_margin_us),
            realtime_priority: config.realtime_priority,
        };
        let spawn_ticker = config.tick_thread;
        let shared = Arc::new(Shared {
            core,
            control: Mutex::new(control),
            listeners: RwLock::new(Vec::new()),
            ticker: OnceCell::new(),
        });

        if spawn_ticker {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            let ticker = TickGenerator::spawn(settings, move || match weak.upgrade() {
                Some(shared) => {
                    Scheduler { shared }.tick();
                    true
                }
                None => false,
            })?;
            if shared.ticker.set(ticker).is_err() {
                anyhow::bail!("tick generator initialised twice");
            }
        }
        Ok(Self { shared })
    }

    #[inline]
    fn core(&self) -> &Core {
        &self.shared.core
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core().config
    }

    pub fn sizing(&self) -> RingSizing {
        self.core().sizing
    }

    pub fn pool_stats(&self) -> PoolReport {
        PoolReport {
            clip_commands: self.core().clip_pool.stats(),
            timer_commands: self.core().timer_pool.stats(),
        }
    }

    pub fn is_playing(&self) -> bool {
        !self.core().transport.is_paused()
    }

    pub fn bpm(&self) -> u64 {
        self.core().transport.tempo().bpm()
    }

    /// Ticks queued ahead of the playhead to cover the audio latency.
    pub fn schedule_ahead(&self) -> u64 {
        self.core().transport.schedule_ahead.load(Ordering::Relaxed)
    }

    /// Ticks played since start, or the read head while stopped.
    pub fn playhead(&self) -> u64 {
        let transport = &self.core().transport;
        if transport.is_paused() {
            transport.step_read_head.load(Ordering::Acquire) as u64
        } else {
            transport.playhead.load(Ordering::Acquire)
        }
    }

    pub fn cumulative_playhead(&self) -> u64 {
        self.core().transport.cumulative_playhead.load(Ordering::Acquire)
    }

    pub fn cumulative_beat(&self) -> u64 {
        self.core().transport.cumulative_beat.load(Ordering::Acquire)
    }

    /// Frame at which the latest StartPlayback fired.
    pub fn playhead_at_start(&self) -> u64 {
        self.core().transport.playhead_at_start.load(Ordering::Acquire)
    }

    pub fn timecode(&self) -> TimecodePosition {
        self.core().transport.timecode()
    }

    pub fn add_tick_listener(&self, listener: Arc<dyn TickListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn remove_tick_listener(&self, listener: &Arc<dyn TickListener>) {
        self.shared
            .listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Track used by MIDI calls that pass `-1`.
    pub fn set_current_track(&self, track: usize) {
        let track = track.min(self.core().config.track_count - 1);
        self.shared.control.lock().current_track = track;
    }

    fn resolve_track(&self, track: i32) -> usize {
        if track < 0 {
            self.shared.control.lock().current_track
        } else {
            (track as usize).min(self.core().config.track_count - 1)
        }
    }

    fn check_delay(&self, delay: u64) -> Result<(), ScheduleError> {
        let capacity = self.core().steps.capacity();
        // A delay of a full lap would alias the slot being read next.
        if delay >= capacity as u64 {
            tracing::error!(delay, capacity, "refusing to schedule beyond the step ring");
            return Err(ScheduleError::DelayExceedsRing { delay, capacity });
        }
        Ok(())
    }

    /// Ring slot `delay` ticks from now.
    fn step_for_delay(&self, delay: u64, immediate: bool) -> usize {
        let transport = &self.core().transport;
        let capacity = self.core().steps.capacity() as u64;
        if immediate || transport.is_paused() {
            let read_head = transport.step_read_head.load(Ordering::Acquire) as u64;
            ((read_head + delay) % capacity) as usize
        } else {
            let start = transport.read_head_on_start.load(Ordering::Acquire) as u64;
            let queued = transport.cumulative_beat.load(Ordering::Acquire) + delay;
            let earliest = transport.playhead.load(Ordering::Acquire) + 1;
            ((start + queued.max(earliest)) % capacity) as usize
        }
    }

    /// Absolute tick at which `index` will be read.
    fn tick_for_index(&self, index: usize) -> u64 {
        let transport = &self.core().transport;
        let capacity = self.core().steps.capacity();
        let read_head = transport.step_read_head.load(Ordering::Acquire) % capacity;
        let distance = (index + capacity - read_head) % capacity;
        transport.cumulative_playhead.load(Ordering::Acquire) + distance as u64
    }

    fn write_step<R>(&self, delay: u64, immediate: bool, update: impl FnOnce(&mut Step, usize) -> R) -> R {
        let core = self.core();
        core.steps.write(
            || self.step_for_delay(delay, immediate),
            &core.clip_pool,
            &core.timer_pool,
            core.now_usecs(),
            update,
        )
    }

    /// Queues a clip command, folding it into an equivalent one already due
    /// on the same tick.
    pub fn schedule_clip_command(&self, command: ClipCommand, delay: u64) -> Result<(), ScheduleError> {
        self.check_delay(delay)?;
        let core = self.core();
        let now = core.now_usecs();
        self.write_step(delay, false, |step, _| {
            if let Some(existing) = step
                .clips
                .iter_mut()
                .find(|handle| core.clip_pool.get(handle).equivalent_to(&command))
            {
                core.clip_pool.get_mut(existing).merge_from(&command);
                return Ok(());
            }
            let mut handle = core
                .clip_pool
                .acquire(now)
                .ok_or(ScheduleError::PoolExhausted("clip"))?;
            *core.clip_pool.get_mut(&mut handle) = command;
            step.clips.push(handle);
            Ok(())
        })
    }

    /// Same as [`Self::schedule_clip_command`] for a command that is already pooled.
    fn schedule_clip_handle(&self, handle: ClipHandle, delay: u64) {
        let core = self.core();
        let now = core.now_usecs();
        self.write_step(delay, false, |step, _| {
            let incoming = *core.clip_pool.get(&handle);
            match step
                .clips
                .iter_mut()
                .find(|existing| core.clip_pool.get(existing).equivalent_to(&incoming))
            {
                Some(existing) => {
                    core.clip_pool.get_mut(existing).merge_from(&incoming);
                    core.clip_pool.release(handle, now);
                }
                None => step.clips.push(handle),
            }
        });
    }

    fn acquire_timer(
        &self,
        command: TimerCommand,
        clip_command: Option<ClipHandle>,
        registration: Option<Arc<Clip>>,
    ) -> Result<TimerHandle, ScheduleError> {
        let core = self.core();
        let now = core.now_usecs();
        let Some(mut handle) = core.timer_pool.acquire(now) else {
            if let Some(clip) = clip_command {
                core.clip_pool.release(clip, now);
            }
            return Err(ScheduleError::PoolExhausted("timer"));
        };
        let record = core.timer_pool.get_mut(&mut handle);
        record.command = command;
        record.clip_command = clip_command;
        record.registration = registration;
        Ok(handle)
    }

    fn release_timer(&self, mut handle: TimerHandle) {
        let core = self.core();
        let now = core.now_usecs();
        if let Some(clip) = core.timer_pool.get_mut(&mut handle).clip_command.take() {
            core.clip_pool.release(clip, now);
        }
        core.timer_pool.release(handle, now);
    }

    /// Places a pooled timer command, or buffers it while a bundle is open.
    fn submit_timer(&self, handle: TimerHandle, delay: u64) -> Result<(), ScheduleError> {
        if let Err(err) = self.check_delay(delay) {
            self.release_timer(handle);
            return Err(err);
        }
        let handle = {
            let mut control = self.shared.control.lock();
            if control.bundle_depth > 0 {
                control.bundle.push((handle, delay));
                return Ok(());
            }
            handle
        };
        self.write_step(delay, false, |step, _| step.timers.push(handle));
        Ok(())
    }

    pub fn schedule_timer_command(&self, delay: u64, command: TimerCommand) -> Result<(), ScheduleError> {
        self.check_delay(delay)?;
        let handle = self.acquire_timer(command, None, None)?;
        self.submit_timer(handle, delay)
    }

    /// Sends a clip command through the timer path so it can join a bundle.
    pub fn schedule_timer_clip_command(&self, delay: u64, command: ClipCommand) -> Result<(), ScheduleError> {
        self.check_delay(delay)?;
        let core = self.core();
        let mut clip = core
            .clip_pool
            .acquire(core.now_usecs())
            .ok_or(ScheduleError::PoolExhausted("clip"))?;
        *core.clip_pool.get_mut(&mut clip) = command;
        let handle = self.acquire_timer(TimerCommand::new(TimerOperation::ClipCommand), Some(clip), None)?;
        self.submit_timer(handle, delay)
    }

    /// Opens (or nests) a bundle. Timer commands are held back until the
    /// outermost bundle closes and then land relative to one anchor step.
    pub fn start_timer_command_bundle(&self) {
        self.shared.control.lock().bundle_depth += 1;
    }

    pub fn end_timer_command_bundle(&self, start_delay: u64) -> Result<(), ScheduleError> {
        let bundle = {
            let mut control = self.shared.control.lock();
            if control.bundle_depth == 0 {
                tracing::warn!("timer command bundle closed without being opened");
                return Ok(());
            }
            control.bundle_depth -= 1;
            if control.bundle_depth > 0 {
                return Ok(());
            }
            std::mem::take(&mut control.bundle)
        };
        if let Err(err) = self.check_delay(start_delay) {
            for (handle, _) in bundle {
                self.release_timer(handle);
            }
            return Err(err);
        }

        let anchor = self.step_for_delay(start_delay, false);
        let core = self.core();
        let count = bundle.len();
        for (handle, delay) in bundle {
            core.steps.write(
                || anchor + delay as usize,
                &core.clip_pool,
                &core.timer_pool,
                core.now_usecs(),
                |step, _| step.timers.push(handle),
            );
        }
        tracing::trace!(count, anchor, "timer command bundle placed");
        Ok(())
    }

    /// Writes MIDI into one track of a step and records note activity.
    fn push_midi(&self, track: usize, messages: &[MidiMessage], delay: u64, immediate: bool) {
        if messages.is_empty() {
            return;
        }
        let index = self.write_step(delay, immediate, |step, index| {
            if let Some(buffer) = step.tracks.get_mut(track) {
                buffer.extend_from_slice(messages);
            }
            index
        });
        let tick = self.tick_for_index(index);
        let mut control = self.shared.control.lock();
        for message in messages {
            control.channels.observe(track, message, tick);
        }
    }

    /// `track` of `-1` targets the current track.
    pub fn schedule_midi_buffer(&self, messages: &[MidiMessage], delay: u64, track: i32) -> Result<(), ScheduleError> {
        self.check_delay(delay)?;
        self.push_midi(self.resolve_track(track), messages, delay, false);
        Ok(())
    }

    /// Queues a note-on or note-off. A note-on with a non-zero `duration` gets
    /// its note-off `duration` ticks later.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_note(
        &self,
        note: u8,
        channel: u8,
        on: bool,
        velocity: u8,
        duration: u64,
        delay: u64,
        track: i32,
    ) -> Result<(), ScheduleError> {
        let off_delay = delay.saturating_add(duration);
        self.check_delay(delay)?;
        if on && duration > 0 {
            self.check_delay(off_delay)?;
        }
        let track = self.resolve_track(track);
        let channel = channel.min(MIDI_CHANNEL_COUNT as u8 - 1);
        let note = note.min(127);
        if on {
            let velocity = velocity.clamp(1, 127);
            self.push_midi(track, &[MidiMessage::note_on(channel, note, velocity)], delay, false);
            if duration > 0 {
                self.push_midi(
                    track,
                    &[MidiMessage::note_off(channel, note, NOTE_OFF_VELOCITY)],
                    off_delay,
                    false,
                );
            }
        } else {
            self.push_midi(track, &[MidiMessage::note_off(channel, note, velocity.min(127))], delay, false);
        }
        Ok(())
    }

    pub fn send_note_immediately(&self, note: u8, channel: u8, on: bool, velocity: u8, track: i32) {
        let channel = channel.min(MIDI_CHANNEL_COUNT as u8 - 1);
        let message = if on {
            MidiMessage::note_on(channel, note.min(127), velocity.clamp(1, 127))
        } else {
            MidiMessage::note_off(channel, note.min(127), velocity.min(127))
        };
        self.push_midi(self.resolve_track(track), &[message], 0, true);
    }

    /// Sends one to three raw bytes; anything longer is cut.
    pub fn send_midi_message_immediately(&self, bytes: &[u8], track: i32) {
        if bytes.is_empty() {
            tracing::warn!("ignoring empty midi message");
            return;
        }
        let message = MidiMessage::from_bytes(bytes);
        self.push_midi(self.resolve_track(track), &[message], 0, true);
    }

    pub fn send_program_change_immediately(&self, program: u8, channel: u8, track: i32) {
        let message = MidiMessage::program_change(channel.min(MIDI_CHANNEL_COUNT as u8 - 1), program.min(127));
        self.push_midi(self.resolve_track(track), &[message], 0, true);
    }

    pub fn send_cc_message_immediately(&self, control: u8, value: u8, channel: u8, track: i32) {
        let message = MidiMessage::control_change(
            channel.min(MIDI_CHANNEL_COUNT as u8 - 1),
            control.min(127),
            value.min(127),
        );
        self.push_midi(self.resolve_track(track), &[message], 0, true);
    }

    pub fn send_midi_buffer_immediately(&self, messages: &[MidiMessage], track: i32) {
        self.push_midi(self.resolve_track(track), messages, 0, true);
    }

    /// A channel on `track` that is quiet `delay` ticks from now. The channel
    /// counts as busy until note activity on it says otherwise.
    pub fn next_available_channel(&self, track: i32, delay: u64) -> u8 {
        let track = self.resolve_track(track);
        let available_from = self.cumulative_playhead() + delay;
        self.shared
            .control
            .lock()
            .channels
            .next_available_channel(track, available_from)
    }

    pub fn schedule_start_playback(
        &self,
        delay: u64,
        song_mode: bool,
        offset: i32,
        duration: u64,
    ) -> Result<(), ScheduleError> {
        let mut command = TimerCommand::new(TimerOperation::StartPlayback);
        if song_mode {
            command.parameter = 1;
            command.parameter2 = offset;
            command.big_parameter = duration;
        }
        self.schedule_timer_command(delay, command)
    }

    pub fn schedule_stop_playback(&self, delay: u64) -> Result<(), ScheduleError> {
        self.schedule_timer_command(delay, TimerCommand::new(TimerOperation::StopPlayback))
    }

    /// The tempo changes when the audio thread reaches the SetBpm step.
    pub fn set_bpm(&self, bpm: u64) -> Result<(), ScheduleError> {
        let tempo = Tempo::new(bpm);
        self.shared.control.lock().recently_requested_bpm = tempo.bpm();
        let mut command = TimerCommand::new(TimerOperation::SetBpm);
        command.parameter = tempo.bpm() as i32;
        self.schedule_timer_command(0, command)
    }

    pub fn increase_bpm(&self) -> Result<(), ScheduleError> {
        let requested = self.shared.control.lock().recently_requested_bpm;
        self.set_bpm(Tempo::new(requested).faster().bpm())
    }

    pub fn decrease_bpm(&self) -> Result<(), ScheduleError> {
        let requested = self.shared.control.lock().recently_requested_bpm;
        self.set_bpm(Tempo::new(requested).slower().bpm())
    }

    pub fn set_latency(&self, buffer_size: u32, latency_max: u32, sample_rate: u32) {
        let core = self.core();
        core.transport
            .set_latency_millis(latency_millis(buffer_size, latency_max, sample_rate));
        let ahead = core.transport.schedule_ahead.load(Ordering::Relaxed);
        if ahead > core.sizing.max_schedule_ahead {
            tracing::warn!(
                ahead,
                sized_for = core.sizing.max_schedule_ahead,
                "latency exceeds what the step ring was sized for"
            );
        }
        tracing::debug!(buffer_size, latency_max, sample_rate, ahead, "latency updated");
    }

    /// Hands a clip to the audio side once `delay` ticks have passed.
    pub fn register_clip(&self, clip: Arc<Clip>, delay: u64) -> Result<(), ScheduleError> {
        self.check_delay(delay)?;
        let mut command = TimerCommand::new(TimerOperation::RegisterClip);
        command.big_parameter = clip.id() as u64;
        let handle = self.acquire_timer(command, None, Some(clip))?;
        self.submit_timer(handle, delay)
    }

    /// The audio side returns the clip as [`EngineEvent::ClipReleased`].
    pub fn unregister_clip(&self, clip: ClipId, delay: u64) -> Result<(), ScheduleError> {
        let mut command = TimerCommand::new(TimerOperation::UnregisterClip);
        command.big_parameter = clip as u64;
        self.schedule_timer_command(delay, command)
    }

    /// `channel` is the sampler channel, `-1` for the global one.
    pub fn set_sampler_channel_enabled(&self, channel: i8, enabled: bool, delay: u64) -> Result<(), ScheduleError> {
        let mut command = TimerCommand::new(TimerOperation::SamplerChannelEnabledState);
        command.parameter = channel as i32;
        command.parameter2 = enabled as i32;
        self.schedule_timer_command(delay, command)
    }

    /// Clips played on bar starts and on every other beat. Clearing them also
    /// silences the metronome.
    pub fn set_metronome_clips(&self, clips: Option<(ClipId, ClipId)>) {
        let mut control = self.shared.control.lock();
        control.metronome = clips;
        if clips.is_none() {
            control.audible_metronome = false;
        }
    }

    pub fn set_audible_metronome(&self, audible: bool) {
        let mut control = self.shared.control.lock();
        if audible && control.metronome.is_none() {
            tracing::warn!("no metronome clips set, metronome stays silent");
            return;
        }
        control.audible_metronome = audible;
    }

    pub fn audible_metronome(&self) -> bool {
        self.shared.control.lock().audible_metronome
    }

    fn metronome_hit(clip: ClipId) -> ClipCommand {
        ClipCommand {
            start_playback: true,
            change_volume: true,
            volume: 1.0,
            ..ClipCommand::for_clip(clip, -1)
        }
    }

    /// Restarts `clip` looping on the next bar.
    pub fn queue_clip_to_start(&self, clip: ClipId, channel: i8) -> Result<(), ScheduleError> {
        let transport = &self.core().transport;
        let delay = if transport.is_paused() {
            0
        } else {
            let cumulative = transport.cumulative_beat.load(Ordering::Acquire);
            let mut next_bar = TICKS_PER_BAR - cumulative % TICKS_PER_BAR;
            if cumulative + next_bar < transport.playhead.load(Ordering::Acquire) {
                next_bar += TICKS_PER_BAR;
            }
            next_bar
        };
        let command = ClipCommand {
            midi_note: 60,
            stop_playback: true,
            start_playback: true,
            change_volume: true,
            volume: 1.0,
            change_looping: true,
            looping: true,
            ..ClipCommand::for_clip(clip, channel)
        };
        self.schedule_clip_command(command, delay)
    }

    /// Drops anything still queued for `clip` and stops it right away.
    pub fn queue_clip_to_stop(&self, clip: ClipId, channel: i8) -> Result<(), ScheduleError> {
        let core = self.core();
        let now = core.now_usecs();
        let capacity = core.steps.capacity();
        let read_head = core.transport.step_read_head.load(Ordering::Acquire);
        let mut removed = 0usize;
        for offset in 0..capacity {
            core.steps.write_if_pending(read_head + offset, |step| {
                let mut index = 0;
                while index < step.clips.len() {
                    let command = core.clip_pool.get(&step.clips[index]);
                    if command.clip == Some(clip) && command.midi_channel == channel {
                        let handle = step.clips.swap_remove(index);
                        core.clip_pool.release(handle, now);
                        removed += 1;
                    } else {
                        index += 1;
                    }
                }
            });
        }
        tracing::debug!(clip, removed, "cleared queued commands before stopping clip");
        let command = ClipCommand {
            midi_note: 60,
            stop_playback: true,
            ..ClipCommand::for_clip(clip, channel)
        };
        self.schedule_clip_command(command, 0)
    }

    /// Counts in `bars` bars with the metronome clips and on-screen beat
    /// messages, then starts the transport.
    pub fn start_with_countin(&self, bars: u32, song_mode: bool) -> Result<(), ScheduleError> {
        let beats = bars as u64 * BEATS_PER_BAR;
        let start_delay = (beats * TICKS_PER_BEAT).saturating_sub(1);
        self.check_delay(start_delay)?;

        let tempo = self.core().transport.tempo();
        let display_ms = COUNTIN_DISPLAY_PADDING_MS + tempo.ticks_to_nanos(TICKS_PER_BEAT) / 1_000_000;
        let metronome = self.shared.control.lock().metronome;
        for beat in 0..beats {
            let delay = beat * TICKS_PER_BEAT;
            if let Some((tick, tock)) = metronome {
                let clip = if beat % BEATS_PER_BAR == 0 { tick } else { tock };
                self.schedule_clip_command(Self::metronome_hit(clip), delay)?;
            }
            let mut message = TimerCommand::new(TimerOperation::GuiMessage)
                .with_parameters([
                    1,
                    (beat % BEATS_PER_BAR + 1) as i32,
                    (beat / BEATS_PER_BAR + 1) as i32,
                    bars as i32,
                ])
                .with_text("countin");
            message.big_parameter = display_ms;
            self.schedule_timer_command(delay, message)?;
        }
        self.schedule_start_playback(start_delay, song_mode, 0, 0)
    }

    /// Starts the transport and the tick thread.
    pub fn start(&self) {
        let transport = &self.core().transport;
        if !transport.is_paused() {
            return;
        }
        transport.read_head_on_start.store(
            transport.step_read_head.load(Ordering::Acquire),
            Ordering::Release,
        );
        transport.paused.store(false, Ordering::Release);
        if let Some(ticker) = self.shared.ticker.get() {
            ticker.resume();
        }
        tracing::info!(bpm = transport.tempo().bpm(), "transport started");
    }

    /// Pulls the tick thread forward to catch up with an external clock.
    /// Returns false when the engine runs without a tick thread.
    pub fn add_adjustment_by_microseconds(&self, microseconds: u64) -> bool {
        match self.shared.ticker.get() {
            Some(ticker) => {
                ticker.add_adjustment_by_microseconds(microseconds);
                true
            }
            None => {
                tracing::debug!(microseconds, "no tick thread to adjust");
                false
            }
        }
    }

    /// Stops the transport. Every note-off still queued goes out immediately,
    /// all other MIDI is dropped, and queued clip commands are muted and moved
    /// to the next step so their stop requests are not lost.
    pub fn stop(&self) {
        let core = self.core();
        let transport = &core.transport;
        if let Some(ticker) = self.shared.ticker.get() {
            ticker.pause();
        }
        transport.paused.store(true, Ordering::Release);
        transport.beat.store(0, Ordering::Relaxed);
        transport.cumulative_beat.store(0, Ordering::Release);
        transport.playhead.store(0, Ordering::Release);

        let capacity = core.steps.capacity();
        let read_head = transport.step_read_head.load(Ordering::Acquire);
        let mut note_offs: Vec<(usize, MidiMessage)> = Vec::new();
        let mut muted: Vec<ClipHandle> = Vec::new();
        for offset in 0..capacity {
            core.steps.write_if_pending(read_head + offset, |step| {
                for (track, buffer) in step.tracks.iter_mut().enumerate() {
                    note_offs.extend(
                        buffer
                            .iter()
                            .filter(|message| message.is_note_off())
                            .map(|message| (track, *message)),
                    );
                    buffer.clear();
                }
                for mut handle in step.clips.drain(..) {
                    let command = core.clip_pool.get_mut(&mut handle);
                    command.change_volume = true;
                    command.volume = 0.0;
                    muted.push(handle);
                }
            });
        }

        if !note_offs.is_empty() {
            self.write_step(0, true, |step, _| {
                for (track, message) in note_offs.iter() {
                    step.tracks[*track].push(*message);
                }
            });
        }
        self.shared.control.lock().channels.clear();
        let clips = muted.len();
        for handle in muted {
            self.schedule_clip_handle(handle, 0);
        }
        tracing::info!(note_offs = note_offs.len(), clips, "transport stopped");
    }

    /// Applies transport changes reported by the audio callback. Call this
    /// with every event drained from [`crate::EngineEvents`].
    pub fn apply_transport_event(&self, event: &EngineEvent) {
        let EngineEvent::Timer { command, .. } = event else {
            return;
        };
        match command.operation {
            TimerOperation::StartPlayback => self.start(),
            TimerOperation::StopPlayback => {
                if !self.is_playing() {
                    tracing::debug!("stop requested while already stopped");
                    return;
                }
                self.stop();
                // One all-notes-off per track.
                for track in 0..self.core().config.track_count {
                    let channel = (track % MIDI_CHANNEL_COUNT) as u8;
                    self.push_midi(
                        track,
                        &[MidiMessage::control_change(channel, ALL_NOTES_OFF, 0)],
                        0,
                        true,
                    );
                }
            }
            _ => {}
        }
    }

    /// Queues ticks until the look-ahead window is full. Called by the tick
    /// thread; drive it by hand when the engine runs without one.
    pub fn tick(&self) {
        let core = self.core();
        let transport = &core.transport;
        if transport.is_paused() {
            return;
        }
        if let Some(ticker) = self.shared.ticker.get() {
            let tempo = transport.tempo();
            if ticker.tempo() != tempo {
                ticker.set_tempo(tempo);
            }
        }
        let horizon = transport.playhead.load(Ordering::Acquire)
            + 2 * transport.schedule_ahead.load(Ordering::Relaxed);
        let metronome = {
            let control = self.shared.control.lock();
            control.metronome.filter(|_| control.audible_metronome)
        };

        loop {
            let cumulative = transport.cumulative_beat.load(Ordering::Acquire);
            if cumulative >= horizon {
                break;
            }
            let beat = transport.beat.load(Ordering::Relaxed);
            for listener in self.shared.listeners.read().iter() {
                listener.on_tick(beat);
            }
            if let Some((tick, tock)) = metronome {
                let clip = if beat == 0 {
                    Some(tick)
                } else if beat % TICKS_PER_BEAT == 0 {
                    Some(tock)
                } else {
                    None
                };
                if let Some(clip) = clip {
                    if let Err(err) = self.schedule_clip_command(Self::metronome_hit(clip), 0) {
                        tracing::warn!(%err, "failed to queue metronome");
                    }
                }
            }
            transport.beat.store((beat + 1) % TICKS_PER_BAR, Ordering::Relaxed);
            transport.cumulative_beat.store(cumulative + 1, Ordering::Release);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    use crate::step::Claim;

    pub(crate) fn manual_config() -> EngineConfig {
        EngineConfig {
            tick_thread: false,
            track_count: 2,
            max_lookahead_bars: 2,
            realtime_priority: None,
            ..EngineConfig::default()
        }
    }

    fn scheduler() -> (Scheduler, Arc<Core>) {
        let core = Arc::new(Core::new(manual_config()));
        let scheduler = Scheduler::new(Arc::clone(&core)).expect("scheduler");
        (scheduler, core)
    }

    /// Takes whatever is due at `index`, as the audio thread would.
    fn take(core: &Core, index: usize, inspect: impl FnOnce(&mut Step)) {
        match core.steps.claim(index) {
            Claim::Ready(mut step) => inspect(&mut step),
            _ => panic!("step {index} should be pending"),
        }
    }

    #[test]
    fn delay_beyond_ring_is_rejected_untouched() {
        let (scheduler, core) = scheduler();
        let capacity = core.steps.capacity() as u64;
        let err = scheduler
            .schedule_clip_command(ClipCommand::for_clip(1, 0), capacity + 1)
            .expect_err("too far");
        assert!(matches!(err, ScheduleError::DelayExceedsRing { .. }));
        assert!((0..core.steps.capacity()).all(|index| !core.steps.is_pending(index)));
        assert_eq!(scheduler.pool_stats().clip_commands.live, 0);
    }

    #[test]
    fn equivalent_commands_share_a_slot() {
        let (scheduler, core) = scheduler();
        let mut first = ClipCommand::for_clip(3, 0);
        first.start_playback = true;
        let mut second = ClipCommand::for_clip(3, 0);
        second.change_volume = true;
        second.volume = 0.5;
        scheduler.schedule_clip_command(first, 4).expect("first");
        scheduler.schedule_clip_command(second, 4).expect("second");
        assert_eq!(scheduler.pool_stats().clip_commands.live, 1);
        take(&core, 4, |step| {
            assert_eq!(step.clips.len(), 1);
            let command = core.clip_pool.get(&step.clips[0]);
            assert!(command.start_playback);
            assert_eq!(command.volume, 0.5);
            for handle in step.clips.drain(..) {
                core.clip_pool.release(handle, 0);
            }
        });
    }

    #[test]
    fn note_with_duration_queues_its_note_off() {
        let (scheduler, core) = scheduler();
        scheduler.schedule_note(60, 1, true, 100, 96, 0, 1).expect("note");
        take(&core, 0, |step| {
            assert_eq!(step.tracks[1], vec![MidiMessage::note_on(1, 60, 100)]);
            step.tracks[1].clear();
        });
        take(&core, 96, |step| {
            assert_eq!(step.tracks[1], vec![MidiMessage::note_off(1, 60, 64)]);
            step.tracks[1].clear();
        });
        // Channel 1 frees up once the note-off tick has passed.
        assert_eq!(scheduler.next_available_channel(1, 200), 0);
        assert_eq!(scheduler.next_available_channel(1, 200), 1);
    }

    #[test]
    fn bundle_lands_relative_to_one_anchor() {
        let (scheduler, core) = scheduler();
        scheduler.start_timer_command_bundle();
        scheduler.start_timer_command_bundle();
        scheduler
            .schedule_timer_command(5, TimerCommand::new(TimerOperation::GuiMessage))
            .expect("inner");
        scheduler.end_timer_command_bundle(10).expect("inner close");
        assert!(!core.steps.is_pending(DEFAULT_BUNDLE_DELAY as usize + 5));
        scheduler
            .schedule_timer_command(1, TimerCommand::new(TimerOperation::StopPart))
            .expect("outer");
        scheduler.end_timer_command_bundle(DEFAULT_BUNDLE_DELAY).expect("outer close");
        assert!(core.steps.is_pending(7));
        assert!(core.steps.is_pending(3));

        scheduler.start_timer_command_bundle();
        let err = scheduler.schedule_timer_command(u64::MAX, TimerCommand::new(TimerOperation::StopPart));
        assert!(err.is_err());
        scheduler.end_timer_command_bundle(DEFAULT_BUNDLE_DELAY).expect("empty close");
    }

    #[test]
    fn stop_sends_note_offs_now_and_mutes_clips() {
        let (scheduler, core) = scheduler();
        scheduler.start();
        scheduler.schedule_note(64, 0, true, 90, 200, 10, 0).expect("note");
        let mut command = ClipCommand::for_clip(2, 0);
        command.stop_playback = true;
        scheduler.schedule_clip_command(command, 40).expect("clip");

        scheduler.stop();
        assert!(!scheduler.is_playing());
        assert_eq!(scheduler.cumulative_beat(), 0);
        take(&core, 0, |step| {
            assert_eq!(step.tracks[0], vec![MidiMessage::note_off(0, 64, 64)]);
            let muted = core.clip_pool.get(&step.clips[0]);
            assert!(muted.stop_playback);
            assert!(muted.change_volume);
            assert_eq!(muted.volume, 0.0);
            step.tracks[0].clear();
            for handle in step.clips.drain(..) {
                core.clip_pool.release(handle, 0);
            }
        });
        assert!((1..core.steps.capacity()).all(|index| !core.steps.is_pending(index)));
    }

    #[test]
    fn queued_clip_waits_for_the_next_bar() {
        let (scheduler, core) = scheduler();
        scheduler.start();
        core.transport.cumulative_beat.store(400, Ordering::Release);
        core.transport.playhead.store(390, Ordering::Release);
        scheduler.queue_clip_to_start(5, 1).expect("queue");
        // 400 + (384 - 16) = 768, past the playhead
        assert!(core.steps.is_pending(768));
        scheduler.queue_clip_to_stop(5, 1).expect("stop");
        assert!(!core.steps.is_pending(768));
        assert_eq!(scheduler.pool_stats().clip_commands.live, 1);
    }

    #[test]
    fn countin_queues_beats_then_start() {
        let (scheduler, core) = scheduler();
        scheduler.set_metronome_clips(Some((10, 11)));
        scheduler.start_with_countin(1, false).expect("countin");
        take(&core, 96, |step| {
            let clip = core.clip_pool.get(&step.clips[0]);
            assert_eq!(clip.clip, Some(11));
            let timer = core.timer_pool.get(&step.timers[0]);
            assert_eq!(timer.command.parameters(), [1, 2, 1, 1]);
            assert_eq!(timer.command.big_parameter, 550);
            for handle in step.clips.drain(..) {
                core.clip_pool.release(handle, 0);
            }
            for handle in step.timers.drain(..) {
                core.timer_pool.release(handle, 0);
            }
        });
        take(&core, 383, |step| {
            let timer = core.timer_pool.get(&step.timers[0]);
            assert_eq!(timer.command.operation, TimerOperation::StartPlayback);
            for handle in step.timers.drain(..) {
                core.timer_pool.release(handle, 0);
            }
        });
    }

    struct CountingListener(AtomicU64);

    impl TickListener for CountingListener {
        fn on_tick(&self, _beat: u64) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn tick_fills_the_lookahead_window() {
        let (scheduler, core) = scheduler();
        let listener = Arc::new(CountingListener(AtomicU64::new(0)));
        scheduler.add_tick_listener(listener.clone());
        scheduler.set_metronome_clips(Some((1, 2)));
        scheduler.set_audible_metronome(true);

        scheduler.tick();
        assert_eq!(scheduler.cumulative_beat(), 0, "paused transport does not tick");

        scheduler.start();
        scheduler.tick();
        let horizon = 2 * scheduler.schedule_ahead();
        assert_eq!(scheduler.cumulative_beat(), horizon);
        assert_eq!(listener.0.load(Ordering::Relaxed), horizon);
        // The bar-start click lands on the first queued tick.
        take(&core, 1, |step| {
            assert_eq!(core.clip_pool.get(&step.clips[0]).clip, Some(1));
            for handle in step.clips.drain(..) {
                core.clip_pool.release(handle, 0);
            }
        });

        let dynamic: Arc<dyn TickListener> = listener;
        scheduler.remove_tick_listener(&dynamic);
        assert!(scheduler.shared.listeners.read().is_empty());
    }

    #[test]
    fn bpm_requests_are_clamped_and_scheduled() {
        let (scheduler, core) = scheduler();
        scheduler.set_bpm(500).expect("bpm");
        scheduler.decrease_bpm().expect("slower");
        take(&core, 0, |step| {
            let values: Vec<i32> = step
                .timers
                .iter()
                .map(|handle| core.timer_pool.get(handle).command.parameter)
                .collect();
            assert_eq!(values, vec![200, 199]);
            for handle in step.timers.drain(..) {
                core.timer_pool.release(handle, 0);
            }
        });
    }

    #[test]
    fn clock_adjustment_reaches_the_tick_thread() {
        let (manual, _core) = scheduler();
        assert!(!manual.add_adjustment_by_microseconds(1_000));

        let config = EngineConfig {
            tick_thread: true,
            bpm: 50,
            ..manual_config()
        };
        let threaded = Scheduler::new(Arc::new(Core::new(config))).expect("scheduler");
        threaded.start();
        // 12.5ms per tick at 50 bpm; eight ticks of catch-up fire at once.
        assert!(threaded.add_adjustment_by_microseconds(100_000));
        std::thread::sleep(std::time::Duration::from_millis(30));
        threaded.stop();
        let ticker = threaded.shared.ticker.get().expect("tick thread");
        assert!(ticker.ticks_fired() >= 8);
    }
}
