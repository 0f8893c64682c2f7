//! One sounding clip note: command intake, sample playback and tail-off.
//!
//! A voice receives pooled [`ClipCommand`]s stamped with the absolute frame
//! they apply at. Per frame it applies due commands and expression events,
//! then renders one interpolated, enveloped and panned sample into the
//! channel mix. Looping notes whose slice lasts a whole number of beats are
//! restarted on the scheduler's tick clock, so they cannot drift from it.

mod envelope;
mod expression;
mod filter;

use std::sync::Arc;

use arc_swap::Guard;
use heapless::Deque;

use crate::command::{ClipCommand, ClipHandle, CommandKey, CommandPool};
use crate::dispatcher::ClockSnapshot;
use crate::midi::ALL_NOTES_OFF;
use crate::source::{db_to_gain, Clip, ClipId, ClipRegistry, ClipSettings, PositionReport, SliceSettings};
use crate::time::TICKS_PER_BEAT;

pub(crate) use envelope::AdsrEnvelope;
pub(crate) use expression::Expression;
use expression::ExpressionQueue;
use filter::{controller_cutoff, FilterMode, OnePoleFilter};

/// Commands a voice can hold before it starts refusing them.
const COMMAND_CAPACITY: usize = 16;
/// Largest per-frame gain change.
const MAX_GAIN_STEP: f32 = 0.0001;
const GAIN_SNAP: f32 = 1e-6;
/// Aftertouch pressure 0..127 maps onto this many dB below unity.
const AFTERTOUCH_RANGE_DB: f32 = 24.0;
const CC_BRIGHTNESS: u8 = 74;
const CC_TIMBRE: u8 = 71;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum VoiceState {
    #[default]
    Idle,
    Starting,
    Playing,
    TailingOff,
}

/// Shared state a voice needs while handling commands and rendering.
pub(crate) struct VoiceContext<'a> {
    pub(crate) registry: &'a ClipRegistry,
    pub(crate) pool: &'a CommandPool<ClipCommand>,
    pub(crate) clock: &'a ClockSnapshot,
    /// Audio clock used for pool grace deadlines.
    pub(crate) now_usecs: u64,
    pub(crate) sample_rate: f32,
}

#[derive(Debug)]
struct QueuedCommand {
    frame: u64,
    tick: f64,
    handle: ClipHandle,
}

/// Sample bounds of the current note, in source samples.
#[derive(Debug, Clone, Copy, Default)]
struct PlaybackWindow {
    start: f64,
    stop: f64,
    loop_position: f64,
    forward_tail: f64,
    backward_tail: f64,
    pan: f32,
    looping: bool,
}

impl PlaybackWindow {
    fn resolve(command: &ClipCommand, clip: &Clip, slice: &SliceSettings, release_seconds: f32) -> Self {
        let rate = clip.sample_rate() as f64;
        let length = clip.len() as f64;
        let start = if command.set_start_position {
            command.start_position * rate
        } else {
            slice.start_samples as f64
        }
        .clamp(0.0, length);
        let stop = if command.set_stop_position {
            command.stop_position * rate
        } else if slice.stop_samples == 0 {
            length
        } else {
            slice.stop_samples as f64
        }
        .clamp(start, length);
        let mut loop_position = start + slice.loop_delta_samples as f64;
        if loop_position >= stop {
            loop_position = start;
        }
        let release = release_seconds as f64 * rate;
        let subvoice_pan = slice.subvoice(command.subvoice).map_or(0.0, |subvoice| subvoice.pan);
        Self {
            start,
            stop,
            loop_position,
            forward_tail: stop - release,
            backward_tail: start + release,
            pan: (slice.pan + command.pan + subvoice_pan).clamp(-1.0, 1.0),
            looping: command_loops(command, slice),
        }
    }
}

/// A command loops when it says so, or defers to the slice style.
fn command_loops(command: &ClipCommand, slice: &SliceSettings) -> bool {
    if command.change_looping {
        command.looping
    } else {
        command.looping || slice.looping()
    }
}

#[derive(Debug, Clone, Copy)]
struct BeatLock {
    next_restart_tick: f64,
    loop_ticks: f64,
    restart_frame: u64,
}

/// Per-note values that only change when a command is applied.
struct NoteSource<'a> {
    clip: &'a Clip,
    settings: Guard<Arc<ClipSettings>>,
    command: ClipCommand,
}

impl NoteSource<'_> {
    /// Pitch contributed by the clip, the command and the subvoice.
    fn clip_pitch(&self, engine_rate: f32) -> f64 {
        let slice = self.settings.slice(self.command.slice);
        let mut pitch = self.settings.pitch_ratio() as f64;
        if self.command.change_pitch {
            pitch *= self.command.pitch_change as f64;
        }
        if let Some(subvoice) = slice.subvoice(self.command.subvoice) {
            pitch *= semitone_ratio(subvoice.pitch_semitones) as f64;
        }
        let mut speed = self.settings.speed_ratio as f64;
        if self.command.change_speed {
            speed *= self.command.speed_ratio as f64;
        }
        pitch * speed * self.clip.sample_rate() as f64 / engine_rate.max(1.0) as f64
    }

    fn clip_gain(&self) -> f32 {
        let slice = self.settings.slice(self.command.slice);
        // The root slice gain is applied once.
        let root = if slice.index == -1 { 1.0 } else { self.settings.root.gain() };
        let subvoice = slice
            .subvoice(self.command.subvoice)
            .map_or(1.0, |subvoice| db_to_gain(subvoice.gain_db));
        let command = if self.command.change_gain_db {
            db_to_gain(self.command.gain_db)
        } else {
            1.0
        };
        root * slice.gain() * subvoice * self.settings.gain() * command
    }
}

#[inline]
fn semitone_ratio(semitones: f32) -> f32 {
    2f32.powf(semitones / 12.0)
}

#[inline]
fn sample_at(data: &[f32], index: i64) -> f32 {
    usize::try_from(index)
        .ok()
        .and_then(|index| data.get(index))
        .copied()
        .unwrap_or(0.0)
}

#[inline]
fn interpolate(data: &[f32], position: f64) -> f32 {
    let index = position.floor();
    let fraction = (position - index) as f32;
    let a = sample_at(data, index as i64);
    if fraction == 0.0 {
        return a;
    }
    let b = sample_at(data, index as i64 + 1);
    a + (b - a) * fraction
}

pub(crate) struct Voice {
    state: VoiceState,
    command: Option<ClipHandle>,
    key: Option<CommandKey>,
    most_recent_start: Option<CommandKey>,
    available_after: u64,
    queue: Deque<QueuedCommand, COMMAND_CAPACITY>,
    expression: ExpressionQueue,
    envelope: AdsrEnvelope,
    lowpass: OnePoleFilter,
    highpass: OnePoleFilter,
    window: PlaybackWindow,
    clip: ClipId,
    source_len: usize,
    root_note: u8,
    position: f64,
    note_ratio: f64,
    gain: f32,
    target_gain: f32,
    beat_lock: Option<BeatLock>,
    held_frames: u32,
    loop_restart_frame: Option<u64>,
    loop_deviation: f32,
    peak: [f32; 2],
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            state: VoiceState::Idle,
            command: None,
            key: None,
            most_recent_start: None,
            available_after: 0,
            queue: Deque::new(),
            expression: ExpressionQueue::default(),
            envelope: AdsrEnvelope::default(),
            lowpass: OnePoleFilter::new(FilterMode::LowPass),
            highpass: OnePoleFilter::new(FilterMode::HighPass),
            window: PlaybackWindow::default(),
            clip: 0,
            source_len: 0,
            root_note: 60,
            position: 0.0,
            note_ratio: 1.0,
            gain: 0.0,
            target_gain: 0.0,
            beat_lock: None,
            held_frames: 0,
            loop_restart_frame: None,
            loop_deviation: 0.0,
            peak: [0.0; 2],
        }
    }
}

impl Voice {
    #[cfg(test)]
    pub(crate) fn state(&self) -> VoiceState {
        self.state
    }

    /// Nothing sounding and nothing queued; the voice can go back to the pool.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == VoiceState::Idle && self.queue.is_empty()
    }

    pub(crate) fn is_tailing_off(&self) -> bool {
        self.state == VoiceState::TailingOff
    }

    pub(crate) fn is_available_at(&self, frame: u64) -> bool {
        self.available_after < frame
    }

    pub(crate) fn most_recent_start(&self) -> Option<CommandKey> {
        self.most_recent_start
    }

    /// Queues a command for the frame it applies at and books the voice until
    /// the note it starts or stops is expected to be over.
    pub(crate) fn handle_command(&mut self, frame: u64, tick: f64, handle: ClipHandle, ctx: &VoiceContext<'_>) {
        let command = *ctx.pool.get(&handle);
        if let Some(clip) = command.clip.and_then(|id| ctx.registry.get(id)) {
            let settings = clip.settings();
            let slice = settings.slice(command.slice);
            let rate = clip.sample_rate() as f64;
            if command.stop_playback {
                self.available_after = frame + (slice.envelope().release as f64 * rate) as u64;
                self.most_recent_start = None;
            }
            if command.start_playback {
                self.available_after = if command_loops(&command, slice) {
                    u64::MAX
                } else {
                    let window = PlaybackWindow::resolve(&command, clip, slice, 0.0);
                    frame + (window.stop - window.start).max(0.0) as u64
                };
                self.most_recent_start = Some(command.key());
            }
        }
        if let Err(rejected) = self.queue.push_back(QueuedCommand { frame, tick, handle }) {
            tracing::warn!(frame, "voice command queue full, dropping command");
            ctx.pool.release(rejected.handle, ctx.now_usecs);
        }
    }

    /// Queues a stop for the current note if it belongs to `group`.
    pub(crate) fn check_exclusivity(&mut self, group: i32, frame: u64, ctx: &VoiceContext<'_>) {
        let Some(current) = self.command.as_ref().map(|handle| *ctx.pool.get(handle)) else {
            return;
        };
        if current.exclusivity_group != group || self.state == VoiceState::TailingOff {
            return;
        }
        let Some(mut handle) = ctx.pool.acquire(ctx.now_usecs) else {
            return;
        };
        {
            let stop = ctx.pool.get_mut(&mut handle);
            stop.clip = current.clip;
            stop.midi_channel = current.midi_channel;
            stop.midi_note = current.midi_note;
            stop.slice = current.slice;
            stop.subvoice = current.subvoice;
            stop.stop_playback = true;
            stop.volume = 1.0;
        }
        self.handle_command(frame, 0.0, handle, ctx);
    }

    pub(crate) fn push_expression(&mut self, frame: u32, expression: Expression) {
        if self.state != VoiceState::Idle {
            self.expression.push(frame, expression);
        }
    }

    /// Renders one callback's worth of frames, mixing into `left`/`right`.
    pub(crate) fn process(
        &mut self,
        ctx: &VoiceContext<'_>,
        left: &mut [f32],
        right: &mut [f32],
        report: &mut impl FnMut(PositionReport),
    ) {
        let nframes = left.len().min(right.len());
        let current_frames = ctx.clock.current_frames;
        self.peak = [0.0; 2];
        if let Some(lock) = self.beat_lock.as_mut() {
            lock.restart_frame = ctx.clock.frame_for_tick(lock.next_restart_tick);
        }

        let mut source: Option<NoteSource<'_>> = None;
        let mut clip_pitch = 1.0;
        let mut clip_gain = 1.0;
        for frame in 0..nframes {
            let now = current_frames + frame as u64;
            while self.queue.front().is_some_and(|queued| queued.frame <= now) {
                if let Some(queued) = self.queue.pop_front() {
                    self.apply(queued, now, ctx, report);
                    source = None;
                }
            }
            if self.state == VoiceState::Idle {
                continue;
            }
            if source.is_none() {
                match self.resolve_source(ctx) {
                    Some(resolved) => {
                        clip_pitch = resolved.clip_pitch(ctx.sample_rate);
                        clip_gain = resolved.clip_gain();
                        let slice = resolved.settings.slice(resolved.command.slice);
                        let position = self.position;
                        self.window = PlaybackWindow::resolve(
                            &resolved.command,
                            resolved.clip,
                            slice,
                            self.envelope.release_seconds(),
                        );
                        self.position = position;
                        source = Some(resolved);
                    }
                    None => {
                        tracing::warn!(clip = self.clip, "voice clip is no longer registered");
                        self.hard_stop(now, ctx, report);
                        continue;
                    }
                }
            }
            let Some(note) = source.as_ref() else {
                continue;
            };

            while let Some(event) = self.expression.pop_due(frame as u32) {
                self.apply_expression(event, &note.command, now, ctx, report);
            }
            if self.state == VoiceState::Idle {
                continue;
            }

            let pitch = self.note_ratio * clip_pitch;
            self.follow_beat_lock(now, pitch, ctx.clock);

            let envelope = self.envelope.next_sample();
            let delta = self.target_gain - self.gain;
            if delta.abs() <= GAIN_SNAP {
                self.gain = self.target_gain;
            } else {
                self.gain += delta.clamp(-MAX_GAIN_STEP, MAX_GAIN_STEP);
            }
            if self.state == VoiceState::Starting {
                self.state = VoiceState::Playing;
            }

            if self.held_frames == 0 {
                let level = self.gain * envelope * clip_gain;
                let l = interpolate(note.clip.left(), self.position) * level;
                let r = interpolate(note.clip.right(), self.position) * level;
                let (l, r) = self.lowpass.process(l, r);
                let (l, r) = self.highpass.process(l, r);
                let (l, r) = pan(l, r, self.window.pan);
                left[frame] += l;
                right[frame] += r;
                self.peak[0] = self.peak[0].max(l.abs());
                self.peak[1] = self.peak[1].max(r.abs());
                self.position += pitch;
            } else {
                self.held_frames += 1;
            }

            if !self.envelope.is_active() {
                self.hard_stop(now, ctx, report);
            } else {
                self.follow_bounds(now, pitch, ctx, report);
            }
        }

        self.expression.rebase();
        if self.state != VoiceState::Idle {
            report(self.report(current_frames + nframes as u64, true));
        }
    }

    fn resolve_source<'a>(&self, ctx: &VoiceContext<'a>) -> Option<NoteSource<'a>> {
        let command = *ctx.pool.get(self.command.as_ref()?);
        let clip = ctx.registry.get(command.clip?)?;
        Some(NoteSource {
            clip,
            settings: clip.settings(),
            command,
        })
    }

    fn apply(
        &mut self,
        queued: QueuedCommand,
        now: u64,
        ctx: &VoiceContext<'_>,
        report: &mut impl FnMut(PositionReport),
    ) {
        let QueuedCommand { tick, handle, .. } = queued;
        let incoming = *ctx.pool.get(&handle);
        if incoming.stop_playback {
            self.stop_note(!incoming.start_playback, now, ctx, report);
        }
        if incoming.start_playback {
            self.set_current_command(handle, &incoming, now, ctx, report);
            self.start_note(now, tick, ctx, report);
            return;
        }
        if !incoming.stop_playback {
            let mut merged_volume = None;
            if let Some(current) = self.command.as_mut() {
                let current = ctx.pool.get_mut(current);
                if current.equivalent_to(&incoming) {
                    current.merge_from(&incoming);
                    merged_volume = incoming.change_volume.then_some(incoming.volume);
                }
            }
            if let Some(volume) = merged_volume {
                self.target_gain = volume;
            }
        }
        ctx.pool.release(handle, ctx.now_usecs);
    }

    fn set_current_command(
        &mut self,
        handle: ClipHandle,
        incoming: &ClipCommand,
        now: u64,
        ctx: &VoiceContext<'_>,
        report: &mut impl FnMut(PositionReport),
    ) {
        match self.command.take() {
            Some(mut current) if ctx.pool.get(&current).equivalent_to(incoming) => {
                ctx.pool.get_mut(&mut current).merge_from(incoming);
                ctx.pool.release(handle, ctx.now_usecs);
                self.command = Some(current);
            }
            Some(previous) => {
                if self.state != VoiceState::Idle {
                    report(self.report(now, false));
                }
                ctx.pool.release(previous, ctx.now_usecs);
                self.command = Some(handle);
            }
            None => self.command = Some(handle),
        }
    }

    fn start_note(
        &mut self,
        now: u64,
        tick: f64,
        ctx: &VoiceContext<'_>,
        report: &mut impl FnMut(PositionReport),
    ) {
        let Some(note) = self.resolve_source(ctx) else {
            tracing::warn!("start command for an unregistered clip");
            self.hard_stop(now, ctx, report);
            return;
        };
        let command = note.command;
        let slice = note.settings.slice(command.slice);
        let rate = note.clip.sample_rate() as f32;

        self.clip = note.clip.id();
        self.source_len = note.clip.len();
        self.key = Some(command.key());
        self.root_note = slice.root_note;
        self.gain = command.volume;
        self.target_gain = command.volume;
        self.envelope.reset();
        self.envelope.set_parameters(slice.envelope(), rate);
        self.envelope.note_on();
        self.window = PlaybackWindow::resolve(&command, note.clip, slice, self.envelope.release_seconds());
        self.note_ratio = semitone_ratio(command.midi_note as f32 - slice.root_note as f32) as f64;
        self.position = if command.change_pitch && command.pitch_change < 0.0 {
            self.window.stop
        } else {
            self.window.start
        };
        self.lowpass.reset();
        self.highpass.reset();
        self.expression.clear();
        self.held_frames = 0;
        self.loop_restart_frame = None;
        self.loop_deviation = 0.0;
        self.beat_lock = match slice.snapped_length_beats() {
            Some(beats) if self.window.looping => {
                let loop_ticks = (beats * TICKS_PER_BEAT) as f64;
                let next_restart_tick = tick + loop_ticks;
                Some(BeatLock {
                    next_restart_tick,
                    loop_ticks,
                    restart_frame: ctx.clock.frame_for_tick(next_restart_tick),
                })
            }
            _ => None,
        };
        self.state = VoiceState::Starting;
    }

    fn stop_note(
        &mut self,
        allow_tail: bool,
        now: u64,
        ctx: &VoiceContext<'_>,
        report: &mut impl FnMut(PositionReport),
    ) {
        match self.state {
            VoiceState::Idle => {}
            VoiceState::TailingOff if allow_tail => {}
            _ if allow_tail => {
                self.state = VoiceState::TailingOff;
                self.envelope.note_off();
            }
            _ => self.hard_stop(now, ctx, report),
        }
    }

    fn hard_stop(&mut self, now: u64, ctx: &VoiceContext<'_>, report: &mut impl FnMut(PositionReport)) {
        if let Some(handle) = self.command.take() {
            if self.state != VoiceState::Idle {
                report(self.report(now, false));
            }
            ctx.pool.release(handle, ctx.now_usecs);
        }
        self.state = VoiceState::Idle;
        self.key = None;
        self.envelope.reset();
        self.expression.clear();
        self.beat_lock = None;
        self.held_frames = 0;
    }

    fn apply_expression(
        &mut self,
        event: Expression,
        command: &ClipCommand,
        now: u64,
        ctx: &VoiceContext<'_>,
        report: &mut impl FnMut(PositionReport),
    ) {
        if !event.addresses(command.midi_channel) {
            return;
        }
        match event {
            Expression::Control { control, .. } if control == ALL_NOTES_OFF => {
                self.hard_stop(now, ctx, report);
            }
            _ if self.state == VoiceState::TailingOff => {}
            Expression::Control { control, value, .. } => match control {
                CC_BRIGHTNESS => {
                    let cutoff = (value < 127).then(|| controller_cutoff(value));
                    self.lowpass.set_cutoff(cutoff, ctx.sample_rate);
                }
                CC_TIMBRE => {
                    let cutoff = (value > 0).then(|| controller_cutoff(value));
                    self.highpass.set_cutoff(cutoff, ctx.sample_rate);
                }
                _ => {}
            },
            Expression::PitchBend { semitones, .. } => {
                let note = (command.midi_note as f32 + semitones).clamp(0.0, 127.0);
                self.note_ratio = semitone_ratio(note - self.root_note as f32) as f64;
            }
            Expression::Aftertouch { note, pressure, .. } => {
                if note == -1 || note == command.midi_note as i16 {
                    let db = AFTERTOUCH_RANGE_DB * (pressure.min(127) as f32 / 127.0 - 1.0);
                    self.target_gain = db_to_gain(db);
                }
            }
        }
    }

    /// Restarts a beat-locked loop once the clock reaches its boundary tick.
    fn follow_beat_lock(&mut self, now: u64, pitch: f64, clock: &ClockSnapshot) {
        let Some(lock) = self.beat_lock.as_mut() else {
            return;
        };
        if now < lock.restart_frame {
            return;
        }
        let forward = pitch >= 0.0;
        let remaining = if forward {
            self.window.stop - self.position
        } else {
            self.position - self.window.start
        };
        self.loop_deviation = (remaining - self.held_frames as f64 * pitch.abs()) as f32;
        self.loop_restart_frame = Some(now);
        self.position = if forward { self.window.start } else { self.window.stop };
        self.held_frames = 0;
        lock.next_restart_tick += lock.loop_ticks;
        lock.restart_frame = clock.frame_for_tick(lock.next_restart_tick).max(now + 1);
        tracing::trace!(
            frame = now,
            deviation = self.loop_deviation,
            next_tick = lock.next_restart_tick,
            "beat-locked loop restart"
        );
    }

    fn follow_bounds(
        &mut self,
        now: u64,
        pitch: f64,
        ctx: &VoiceContext<'_>,
        report: &mut impl FnMut(PositionReport),
    ) {
        let window = self.window;
        if pitch >= 0.0 {
            if window.looping {
                if self.position >= window.stop {
                    self.wrap_loop(now, window.stop, window.loop_position, ctx);
                }
            } else if self.position >= window.stop {
                self.hard_stop(now, ctx, report);
            } else if self.state != VoiceState::TailingOff && self.position >= window.forward_tail {
                self.stop_note(true, now, ctx, report);
            }
        } else if window.looping {
            if self.position <= window.start {
                self.wrap_loop(now, window.start, window.stop, ctx);
            }
        } else if self.position <= window.start {
            self.hard_stop(now, ctx, report);
        } else if self.state != VoiceState::TailingOff && self.position <= window.backward_tail {
            self.stop_note(true, now, ctx, report);
        }
    }

    /// Wraps a loop at its end. A beat-locked loop ending just short of its
    /// restart frame holds silence instead, so the restart lands on the beat.
    fn wrap_loop(&mut self, now: u64, end: f64, wrapped: f64, ctx: &VoiceContext<'_>) {
        if self.held_frames > 0 {
            return;
        }
        if let Some(lock) = self.beat_lock.as_mut() {
            lock.restart_frame = ctx.clock.frame_for_tick(lock.next_restart_tick);
            let max_deviation = ctx.clock.buffer_frames;
            if lock.restart_frame.saturating_sub(now) <= max_deviation {
                self.position = end;
                self.held_frames = 1;
                return;
            }
        }
        self.position = wrapped;
    }

    fn report(&self, frame: u64, playing: bool) -> PositionReport {
        PositionReport {
            clip: self.clip,
            key: self.key.unwrap_or_else(|| ClipCommand::default().key()),
            frame,
            progress: if self.source_len > 0 {
                (self.position / self.source_len as f64) as f32
            } else {
                0.0
            },
            gain_left: self.peak[0],
            gain_right: self.peak[1],
            pan: self.window.pan,
            playing,
            loop_restart_frame: self.loop_restart_frame,
            loop_deviation: self.loop_deviation,
        }
    }
}

/// Mid/side balance: panning attenuates the mid signal on the far side.
#[inline]
fn pan(left: f32, right: f32, pan: f32) -> (f32, f32) {
    let mid = 0.5 * (left + right);
    let side = 0.5 * (left - right);
    let left_pan = 1.0 - pan.max(0.0);
    let right_pan = 1.0 + pan.min(0.0);
    (left_pan * mid + side, right_pan * mid - side)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AdsrParameters, PlaybackStyle};

    const RATE: u32 = 48_000;

    struct Rig {
        registry: ClipRegistry,
        pool: CommandPool<ClipCommand>,
        clock: ClockSnapshot,
        reports: Vec<PositionReport>,
    }

    impl Rig {
        fn new(clip: Clip) -> Self {
            let mut registry = ClipRegistry::default();
            assert!(registry.insert(Arc::new(clip)).is_ok());
            Self {
                registry,
                pool: CommandPool::new("clip", 64, 0),
                clock: ClockSnapshot::at_rest(RATE, 64, 120),
                reports: Vec::new(),
            }
        }

        fn command(&self, edit: impl FnOnce(&mut ClipCommand)) -> ClipHandle {
            let mut handle = self.pool.acquire(0).expect("slot");
            let command = self.pool.get_mut(&mut handle);
            *command = ClipCommand::for_clip(1, 0);
            edit(command);
            handle
        }

        fn send(&mut self, voice: &mut Voice, frame: u64, handle: ClipHandle) {
            let ctx = VoiceContext {
                registry: &self.registry,
                pool: &self.pool,
                clock: &self.clock,
                now_usecs: 0,
                sample_rate: RATE as f32,
            };
            voice.handle_command(frame, 0.0, handle, &ctx);
        }

        fn render(&mut self, voice: &mut Voice) -> (Vec<f32>, Vec<f32>) {
            let mut left = vec![0.0; self.clock.buffer_frames as usize];
            let mut right = left.clone();
            let ctx = VoiceContext {
                registry: &self.registry,
                pool: &self.pool,
                clock: &self.clock,
                now_usecs: 0,
                sample_rate: RATE as f32,
            };
            let reports = &mut self.reports;
            voice.process(&ctx, &mut left, &mut right, &mut |report| reports.push(report));
            self.clock = self.clock.advanced();
            (left, right)
        }
    }

    fn ramp_clip(len: usize, release: f32) -> Clip {
        let samples = (0..len).map(|i| i as f32 / len as f32).collect();
        let clip = Clip::new(1, RATE, samples, None);
        clip.update_settings(|settings| {
            settings.root.adsr = AdsrParameters {
                release,
                ..AdsrParameters::default()
            };
        });
        clip
    }

    fn start(edit: impl FnOnce(&mut ClipCommand)) -> impl FnOnce(&mut ClipCommand) {
        move |command| {
            command.start_playback = true;
            command.change_volume = true;
            command.volume = 1.0;
            edit(command);
        }
    }

    #[test]
    fn plays_source_samples_at_unity_pitch() {
        let mut rig = Rig::new(ramp_clip(1_000, 0.0));
        let mut voice = Voice::default();
        let handle = rig.command(start(|_| {}));
        rig.send(&mut voice, 10, handle);
        let (left, right) = rig.render(&mut voice);
        assert_eq!(left[..10], [0.0; 10]);
        assert_eq!(left[10], 0.0);
        assert!((left[11] - 0.001).abs() < 1e-6);
        assert!((right[20] - 0.010).abs() < 1e-6);
        assert_eq!(voice.state(), VoiceState::Playing);
        let report = rig.reports.last().expect("report");
        assert!(report.playing);
        assert_eq!(report.frame, 64);
    }

    #[test]
    fn note_stops_at_the_end_of_a_one_shot() {
        let mut rig = Rig::new(ramp_clip(100, 0.0));
        let mut voice = Voice::default();
        let handle = rig.command(start(|_| {}));
        rig.send(&mut voice, 0, handle);
        assert!(!voice.is_available_at(100));
        assert!(voice.is_available_at(101));
        rig.render(&mut voice);
        rig.render(&mut voice);
        assert!(voice.is_idle());
        let last = rig.reports.last().expect("final report");
        assert!(!last.playing);
        assert_eq!(rig.pool.stats().live, 0);
    }

    #[test]
    fn stop_tails_off_then_goes_idle() {
        let mut rig = Rig::new(ramp_clip(48_000, 0.001));
        let mut voice = Voice::default();
        let handle = rig.command(start(|command| {
            command.change_looping = true;
            command.looping = true;
        }));
        rig.send(&mut voice, 0, handle);
        assert!(!voice.is_available_at(1_000_000));
        rig.render(&mut voice);
        let stop = rig.command(|command| command.stop_playback = true);
        rig.send(&mut voice, 120, stop);
        rig.render(&mut voice);
        assert!(voice.is_tailing_off());
        // 48 frames of release, over by frame 168
        rig.render(&mut voice);
        assert!(voice.is_idle());
        assert_eq!(rig.pool.stats().live, 0);
    }

    #[test]
    fn exclusivity_queues_a_stop_for_the_group() {
        let mut rig = Rig::new(ramp_clip(48_000, 0.0));
        let mut voice = Voice::default();
        let handle = rig.command(start(|command| command.exclusivity_group = 3));
        rig.send(&mut voice, 0, handle);
        rig.render(&mut voice);
        let ctx = VoiceContext {
            registry: &rig.registry,
            pool: &rig.pool,
            clock: &rig.clock,
            now_usecs: 0,
            sample_rate: RATE as f32,
        };
        voice.check_exclusivity(2, 64, &ctx);
        voice.check_exclusivity(3, 64, &ctx);
        rig.render(&mut voice);
        assert!(voice.is_idle());
    }

    #[test]
    fn aftertouch_ramps_gain_toward_target() {
        let mut rig = Rig::new(ramp_clip(48_000, 0.0));
        let mut voice = Voice::default();
        let handle = rig.command(start(|_| {}));
        rig.send(&mut voice, 0, handle);
        rig.render(&mut voice);
        voice.push_expression(
            0,
            Expression::Aftertouch {
                channel: 0,
                note: -1,
                pressure: 0,
            },
        );
        rig.render(&mut voice);
        assert_eq!(voice.target_gain, db_to_gain(-AFTERTOUCH_RANGE_DB));
        assert!((voice.gain - (1.0 - 64.0 * MAX_GAIN_STEP)).abs() < 1e-4);
    }

    #[test]
    fn all_notes_off_stops_hard() {
        let mut rig = Rig::new(ramp_clip(48_000, 0.5));
        let mut voice = Voice::default();
        let handle = rig.command(start(|_| {}));
        rig.send(&mut voice, 0, handle);
        rig.render(&mut voice);
        voice.push_expression(
            5,
            Expression::Control {
                channel: -1,
                control: ALL_NOTES_OFF,
                value: 0,
            },
        );
        rig.render(&mut voice);
        assert!(voice.is_idle());
    }

    #[test]
    fn negative_pitch_plays_backwards_from_the_stop() {
        let mut rig = Rig::new(ramp_clip(1_000, 0.0));
        let mut voice = Voice::default();
        let handle = rig.command(start(|command| {
            command.change_pitch = true;
            command.pitch_change = -1.0;
        }));
        rig.send(&mut voice, 0, handle);
        let (left, _) = rig.render(&mut voice);
        assert!(left[1] > left[10]);
    }

    #[test]
    fn beat_locked_loop_restarts_on_the_tick_clock() {
        // Two beats at 120 bpm are 48000 frames; the sample is 100 frames longer.
        let clip = ramp_clip(48_100, 0.0);
        clip.update_settings(|settings| {
            settings.root.style = PlaybackStyle::Looping;
            settings.root.length_beats = 2.0;
        });
        let mut rig = Rig::new(clip);
        let mut voice = Voice::default();
        let handle = rig.command(start(|_| {}));
        rig.send(&mut voice, 0, handle);
        for _ in 0..(48_000 * 3 / 64 + 2) {
            rig.render(&mut voice);
        }
        let restarts: Vec<_> = rig
            .reports
            .iter()
            .filter_map(|report| report.loop_restart_frame)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(restarts, vec![48_000, 96_000, 144_000]);
        assert!(rig.reports.iter().all(|report| report.loop_deviation.abs() <= 101.0));
    }
}
