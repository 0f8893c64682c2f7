//! Sampler channels: route clip commands and live MIDI onto pooled voices.
//!
//! There is one channel per track plus the global channel (slot 0, MIDI
//! channel `-1`). Scheduled commands land in a channel's queue during the
//! step loop and are handed to voices when the channel renders, so every
//! command reaches its voice with the frame it applies at.

use std::iter;
use std::sync::Arc;

use arrayvec::ArrayVec;
use heapless::Deque;

use crate::command::{ClipCommand, ClipHandle, CommandPool};
use crate::config::EngineConfig;
use crate::dispatcher::ClockSnapshot;
use crate::events::MidiInputEvent;
use crate::grain::Grainerator;
use crate::midi::{
    MidiMessage, CHANNEL_AFTERTOUCH, CONTROL_CHANGE, NOTE_OFF, NOTE_ON, PITCH_BEND, POLY_AFTERTOUCH,
};
use crate::source::{Clip, ClipId, ClipRegistry, PickingStyle, PlaybackStyle, PositionReport};
use crate::voice::{Expression, Voice, VoiceContext};

/// Scheduled commands a channel holds between two renders.
const CHANNEL_COMMANDS: usize = 256;
/// Commands a single note message can expand into.
const NOTE_COMMANDS: usize = 64;
/// Pitch bend range in semitones on note channels and on the master channel.
const NOTE_BEND_RANGE: f32 = 48.0;
const MASTER_BEND_RANGE: f32 = 2.0;
const BEND_CENTER: i32 = 8192;

struct QueuedClipCommand {
    frame: u64,
    tick: f64,
    handle: ClipHandle,
}

struct SamplerChannel {
    /// `-1` for the global channel.
    index: i8,
    enabled: bool,
    commands: Deque<QueuedClipCommand, CHANNEL_COMMANDS>,
    /// Indices into the voice bank, preallocated to the bank size.
    voices: Vec<usize>,
    grains: Grainerator,
}

/// Fixed set of voices shared by every channel.
struct VoiceBank {
    voices: Box<[Voice]>,
    free: Vec<usize>,
}

impl VoiceBank {
    fn new(count: usize) -> Self {
        Self {
            voices: (0..count).map(|_| Voice::default()).collect(),
            free: (0..count).rev().collect(),
        }
    }

    /// Finds the voice a command belongs to on a channel, taking a fresh one
    /// from the bank for starts nobody can take.
    fn dispatch(
        &mut self,
        active: &mut Vec<usize>,
        frame: u64,
        tick: f64,
        handle: ClipHandle,
        ctx: &VoiceContext<'_>,
    ) {
        let command = *ctx.pool.get(&handle);
        let key = command.key();
        if command.start_playback && command.exclusivity_group > -1 {
            for &index in active.iter() {
                self.voices[index].check_exclusivity(command.exclusivity_group, frame, ctx);
            }
        }
        if command.stop_playback {
            let playing = active.iter().copied().find(|&index| {
                let voice = &self.voices[index];
                voice.most_recent_start() == Some(key) && !voice.is_tailing_off()
            });
            if let Some(index) = playing {
                self.voices[index].handle_command(frame, tick, handle, ctx);
                return;
            }
            if !command.start_playback {
                ctx.pool.release(handle, ctx.now_usecs);
                return;
            }
        }
        if command.start_playback {
            let reusable = active
                .iter()
                .copied()
                .find(|&index| self.voices[index].is_available_at(frame));
            let index = match reusable {
                Some(index) => index,
                None => match self.free.pop() {
                    Some(index) => {
                        active.push(index);
                        index
                    }
                    None => {
                        tracing::warn!(frame, "sampler has no free voice, dropping start");
                        ctx.pool.release(handle, ctx.now_usecs);
                        return;
                    }
                },
            };
            self.voices[index].handle_command(frame, tick, handle, ctx);
            return;
        }
        let sounding = active
            .iter()
            .copied()
            .find(|&index| self.voices[index].most_recent_start() == Some(key));
        match sounding {
            Some(index) => self.voices[index].handle_command(frame, tick, handle, ctx),
            None => ctx.pool.release(handle, ctx.now_usecs),
        }
    }

    fn expression(&mut self, active: &[usize], frame: u32, expression: Expression) {
        for &index in active {
            self.voices[index].push_expression(frame, expression);
        }
    }
}

pub(crate) struct Sampler {
    channels: Box<[SamplerChannel]>,
    bank: VoiceBank,
    registry: ClipRegistry,
    master_channel: u8,
    sample_rate: f32,
}

impl Sampler {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        let channel_count = config.sampler_channel_count();
        let channels = (0..channel_count)
            .map(|slot| SamplerChannel {
                index: slot as i8 - 1,
                enabled: true,
                commands: Deque::new(),
                voices: Vec::with_capacity(config.voice_count),
                grains: Grainerator::new(config.grain_seed.wrapping_add(slot as u64)),
            })
            .collect();
        Self {
            channels,
            bank: VoiceBank::new(config.voice_count),
            registry: ClipRegistry::default(),
            master_channel: config.master_channel,
            sample_rate: config.sample_rate as f32,
        }
    }

    pub(crate) fn register_clip(&mut self, clip: Arc<Clip>) -> Result<Option<Arc<Clip>>, Arc<Clip>> {
        self.registry.insert(clip)
    }

    pub(crate) fn unregister_clip(&mut self, id: ClipId) -> Option<Arc<Clip>> {
        self.registry.remove(id)
    }

    pub(crate) fn registered_clips(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn active_voices(&self) -> usize {
        self.bank.voices.len() - self.bank.free.len()
    }

    /// The global channel cannot be switched off.
    pub(crate) fn set_channel_enabled(&mut self, channel: i8, enabled: bool) {
        match self.channel_mut(channel) {
            Some(target) if target.index >= 0 => target.enabled = enabled,
            Some(_) => {}
            None => tracing::warn!(channel, "no such sampler channel"),
        }
    }

    fn channel_mut(&mut self, channel: i8) -> Option<&mut SamplerChannel> {
        usize::try_from(channel as i16 + 1)
            .ok()
            .and_then(|slot| self.channels.get_mut(slot))
    }

    /// Queues a scheduled command on its channel. Commands for channels past
    /// the last track go to the global channel.
    pub(crate) fn handle_clip_command(
        &mut self,
        frame: u64,
        tick: f64,
        handle: ClipHandle,
        pool: &CommandPool<ClipCommand>,
        now_usecs: u64,
    ) {
        let slot = pool.get(&handle).channel_slot();
        let slot = if slot < self.channels.len() { slot } else { 0 };
        let queued = QueuedClipCommand { frame, tick, handle };
        if let Err(rejected) = self.channels[slot].commands.push_back(queued) {
            tracing::warn!(slot, frame, "sampler channel command queue full");
            pool.release(rejected.handle, now_usecs);
        }
    }

    /// Renders every channel into `left`/`right` for the callback the clock
    /// snapshot describes. `midi` must be ordered by frame.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn render(
        &mut self,
        pool: &CommandPool<ClipCommand>,
        clock: &ClockSnapshot,
        now_usecs: u64,
        midi: &[MidiInputEvent],
        left: &mut [f32],
        right: &mut [f32],
        report: &mut impl FnMut(PositionReport),
    ) {
        let nframes = left.len().min(right.len());
        let ctx = VoiceContext {
            registry: &self.registry,
            pool,
            clock,
            now_usecs,
            sample_rate: self.sample_rate,
        };
        let master_channel = self.master_channel;
        let channel_count = self.channels.len();

        for (slot, channel) in self.channels.iter_mut().enumerate() {
            while let Some(queued) = channel.commands.pop_front() {
                self.bank
                    .dispatch(&mut channel.voices, queued.frame, queued.tick, queued.handle, &ctx);
            }

            if channel.enabled {
                let mut cursor = 0;
                let live = midi
                    .iter()
                    .filter(|event| live_channel(master_channel, channel_count, &event.message) == Some(slot));
                for event in live {
                    let frame = (event.frame as usize).min(nframes.saturating_sub(1));
                    if frame > cursor {
                        run_grains(channel, &mut self.bank, cursor, frame, &ctx);
                        cursor = frame;
                    }
                    let on_master = event.message.channel() == master_channel;
                    handle_live_event(channel, &mut self.bank, frame, on_master, &event.message, &ctx);
                }
                run_grains(channel, &mut self.bank, cursor, nframes, &ctx);
            }

            for &index in channel.voices.iter() {
                self.bank.voices[index].process(&ctx, &mut left[..nframes], &mut right[..nframes], report);
            }
            let bank = &mut self.bank;
            channel.voices.retain(|&index| {
                if bank.voices[index].is_idle() {
                    bank.free.push(index);
                    false
                } else {
                    true
                }
            });
        }
    }
}

/// Sampler channel slot for a live message: the master channel drives the
/// global slot, channel `n` drives slot `n + 1`.
fn live_channel(master_channel: u8, channel_count: usize, message: &MidiMessage) -> Option<usize> {
    let channel = message.channel();
    if channel == master_channel {
        return Some(0);
    }
    let slot = channel as usize + 1;
    (slot < channel_count).then_some(slot)
}

fn run_grains(
    channel: &mut SamplerChannel,
    bank: &mut VoiceBank,
    from: usize,
    to: usize,
    ctx: &VoiceContext<'_>,
) {
    let voices = &mut channel.voices;
    channel.grains.process(from, to, ctx, &mut |frame, handle| {
        let tick = ctx.clock.tick_for_frame(frame);
        bank.dispatch(voices, frame, tick, handle, ctx);
    });
}

fn handle_live_event(
    channel: &mut SamplerChannel,
    bank: &mut VoiceBank,
    frame: usize,
    on_master: bool,
    message: &MidiMessage,
    ctx: &VoiceContext<'_>,
) {
    let bytes = message.bytes();
    let absolute = ctx.clock.current_frames + frame as u64;
    let offset = frame as u32;
    let data1 = bytes.get(1).copied().unwrap_or(0);
    let data2 = bytes.get(2).copied().unwrap_or(0);
    match message.status() & 0xF0 {
        NOTE_OFF | NOTE_ON => {
            let tick = ctx.clock.tick_for_frame(absolute);
            let commands = note_commands(channel.index, message, ctx);
            for handle in commands {
                let command = *ctx.pool.get(&handle);
                let granular = command
                    .clip
                    .and_then(|id| ctx.registry.get(id))
                    .is_some_and(|clip| clip.settings().slice(command.slice).is_granular());
                if !granular {
                    bank.dispatch(&mut channel.voices, absolute, tick, handle, ctx);
                } else if command.stop_playback {
                    channel.grains.stop(&command, ctx);
                    ctx.pool.release(handle, ctx.now_usecs);
                } else {
                    channel.grains.start(handle, ctx);
                }
            }
        }
        POLY_AFTERTOUCH => {
            let expression = Expression::Aftertouch {
                channel: channel.index,
                note: data1 as i16,
                pressure: data2,
            };
            bank.expression(&channel.voices, offset, expression);
            channel.grains.aftertouch(channel.index, Some(data1), data2);
        }
        CONTROL_CHANGE => {
            let expression = Expression::Control {
                channel: channel.index,
                control: data1,
                value: data2,
            };
            bank.expression(&channel.voices, offset, expression);
            channel.grains.control_change(channel.index, data1);
        }
        CHANNEL_AFTERTOUCH => {
            let expression = Expression::Aftertouch {
                channel: channel.index,
                note: -1,
                pressure: data1,
            };
            bank.expression(&channel.voices, offset, expression);
            channel.grains.aftertouch(channel.index, None, data1);
        }
        PITCH_BEND => {
            let range = if on_master { MASTER_BEND_RANGE } else { NOTE_BEND_RANGE };
            let value = data2 as i32 * 128 + data1 as i32;
            let semitones = range * (value - BEND_CENTER) as f32 / 16_383.0;
            let expression = Expression::PitchBend {
                channel: channel.index,
                semitones,
            };
            bank.expression(&channel.voices, offset, expression);
            channel.grains.pitch_bend(channel.index, semitones);
        }
        _ => {}
    }
}

/// Expands a note message into one command per matching slice and subvoice
/// of every polyphonic clip on the channel's track. Slices are tried in
/// order with the root slice last.
fn note_commands(
    channel: i8,
    message: &MidiMessage,
    ctx: &VoiceContext<'_>,
) -> ArrayVec<ClipHandle, NOTE_COMMANDS> {
    let mut commands = ArrayVec::new();
    let bytes = message.bytes();
    let (Some(&note), Some(&velocity)) = (bytes.get(1), bytes.get(2)) else {
        return commands;
    };
    let stop = message.status() < NOTE_ON || velocity == 0;
    for clip in ctx.registry.iter() {
        let settings = clip.settings();
        if !settings.polyphonic || settings.track != channel {
            continue;
        }
        for slice in settings.slices.iter().chain(iter::once(&settings.root)) {
            if !slice.accepts(note, velocity, stop) {
                continue;
            }
            // One-shots ignore note-off and run out on their own.
            if !(stop && slice.style == PlaybackStyle::OneShot) {
                for subvoice in -1..slice.subvoices.len() as i32 {
                    if commands.is_full() {
                        tracing::warn!(note, "note expands into too many commands");
                        return commands;
                    }
                    let Some(mut handle) = ctx.pool.acquire(ctx.now_usecs) else {
                        return commands;
                    };
                    let command = ctx.pool.get_mut(&mut handle);
                    *command = ClipCommand::for_clip(clip.id(), channel);
                    command.midi_note = note;
                    command.slice = slice.index;
                    command.subvoice = subvoice;
                    command.exclusivity_group = slice.exclusivity_group;
                    command.start_playback = !stop;
                    command.stop_playback = stop;
                    command.change_volume = !stop;
                    command.volume = velocity as f32 / 127.0;
                    command.change_looping = true;
                    command.looping = slice.looping();
                    commands.push(handle);
                }
            }
            if settings.slice_picking == PickingStyle::First {
                break;
            }
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AdsrParameters, ClipSettings, SliceSettings};

    const RATE: u32 = 48_000;
    const FRAMES: usize = 64;

    struct Rig {
        sampler: Sampler,
        pool: CommandPool<ClipCommand>,
        clock: ClockSnapshot,
        reports: Vec<PositionReport>,
    }

    impl Rig {
        fn new() -> Self {
            let config = EngineConfig {
                track_count: 2,
                voice_count: 8,
                ..EngineConfig::default()
            };
            Self {
                sampler: Sampler::new(&config),
                pool: CommandPool::new("clip", 128, 0),
                clock: ClockSnapshot::at_rest(RATE, FRAMES as u64, 120),
                reports: Vec::new(),
            }
        }

        fn render(&mut self, midi: &[MidiInputEvent]) -> Vec<f32> {
            let mut left = vec![0.0; FRAMES];
            let mut right = vec![0.0; FRAMES];
            let reports = &mut self.reports;
            self.sampler.render(
                &self.pool,
                &self.clock,
                0,
                midi,
                &mut left,
                &mut right,
                &mut |report| reports.push(report),
            );
            self.clock = self.clock.advanced();
            left
        }

        fn schedule(&mut self, frame: u64, edit: impl FnOnce(&mut ClipCommand)) {
            let mut handle = self.pool.acquire(0).expect("slot");
            edit(self.pool.get_mut(&mut handle));
            self.sampler.handle_clip_command(frame, 0.0, handle, &self.pool, 0);
        }
    }

    fn keyzone_clip(id: ClipId, track: i8) -> Arc<Clip> {
        let mut settings = ClipSettings {
            polyphonic: true,
            track,
            ..ClipSettings::default()
        };
        settings.root.stop_samples = 4_800;
        settings.root.adsr = AdsrParameters {
            release: 0.0,
            ..AdsrParameters::default()
        };
        settings.slices.push(SliceSettings {
            index: 0,
            stop_samples: 4_800,
            keyzone_start: 36,
            keyzone_end: 47,
            adsr: settings.root.adsr,
            ..SliceSettings::default()
        });
        Arc::new(Clip::new(id, RATE, vec![0.25; 4_800], None).with_settings(settings))
    }

    #[test]
    fn live_messages_route_by_midi_channel() {
        let master = 15;
        assert_eq!(live_channel(master, 17, &MidiMessage::note_on(15, 60, 90)), Some(0));
        assert_eq!(live_channel(master, 17, &MidiMessage::note_on(0, 60, 90)), Some(1));
        assert_eq!(live_channel(master, 17, &MidiMessage::note_on(14, 60, 90)), Some(15));
        assert_eq!(live_channel(master, 4, &MidiMessage::note_on(3, 60, 90)), None);
    }

    fn live(frame: u32, message: MidiMessage) -> MidiInputEvent {
        MidiInputEvent { frame, message }
    }

    #[test]
    fn scheduled_start_and_stop_reach_one_voice() {
        let mut rig = Rig::new();
        assert!(rig.sampler.register_clip(keyzone_clip(1, 0)).is_ok());
        rig.schedule(10, |command| {
            *command = ClipCommand::for_clip(1, 0);
            command.start_playback = true;
            command.change_volume = true;
            command.volume = 1.0;
        });
        let left = rig.render(&[]);
        assert_eq!(left[9], 0.0);
        assert!((left[10] - 0.25).abs() < 1e-6);
        assert_eq!(rig.sampler.active_voices(), 1);

        rig.schedule(70, |command| {
            *command = ClipCommand::for_clip(1, 0);
            command.stop_playback = true;
        });
        rig.render(&[]);
        assert_eq!(rig.sampler.active_voices(), 0);
        assert_eq!(rig.pool.stats().live, 0);
        assert!(rig.reports.iter().any(|report| !report.playing));
    }

    #[test]
    fn live_notes_pick_slices_by_keyzone() {
        let mut rig = Rig::new();
        assert!(rig.sampler.register_clip(keyzone_clip(1, 0)).is_ok());
        // Slice 0 and the root both cover note 40.
        rig.render(&[live(0, MidiMessage::note_on(0, 40, 100))]);
        assert_eq!(rig.sampler.active_voices(), 2);
        rig.render(&[live(0, MidiMessage::note_off(0, 40, 0))]);
        assert_eq!(rig.sampler.active_voices(), 0);

        // Only the root covers note 60.
        rig.render(&[live(3, MidiMessage::note_on(0, 60, 100))]);
        assert_eq!(rig.sampler.active_voices(), 1);
    }

    #[test]
    fn first_picking_takes_one_slice() {
        let mut rig = Rig::new();
        let clip = keyzone_clip(1, 0);
        clip.update_settings(|settings| settings.slice_picking = PickingStyle::First);
        assert!(rig.sampler.register_clip(clip).is_ok());
        rig.render(&[live(0, MidiMessage::note_on(0, 40, 100))]);
        assert_eq!(rig.sampler.active_voices(), 1);
    }

    #[test]
    fn disabled_channels_ignore_live_notes() {
        let mut rig = Rig::new();
        assert!(rig.sampler.register_clip(keyzone_clip(1, 1)).is_ok());
        rig.sampler.set_channel_enabled(1, false);
        rig.render(&[live(0, MidiMessage::note_on(1, 60, 100))]);
        assert_eq!(rig.sampler.active_voices(), 0);
        rig.sampler.set_channel_enabled(1, true);
        rig.render(&[live(0, MidiMessage::note_on(1, 60, 100))]);
        assert_eq!(rig.sampler.active_voices(), 1);
    }

    #[test]
    fn exclusive_starts_silence_their_group() {
        let mut rig = Rig::new();
        assert!(rig.sampler.register_clip(keyzone_clip(1, -1)).is_ok());
        assert!(rig.sampler.register_clip(keyzone_clip(2, -1)).is_ok());
        for (frame, clip) in [(0, 1), (74, 2)] {
            rig.schedule(frame, |command| {
                *command = ClipCommand::for_clip(clip, -1);
                command.start_playback = true;
                command.change_volume = true;
                command.volume = 1.0;
                command.exclusivity_group = 5;
            });
            rig.render(&[]);
        }
        assert_eq!(rig.sampler.active_voices(), 1);
    }

    #[test]
    fn unregistered_clips_stop_their_voices() {
        let mut rig = Rig::new();
        assert!(rig.sampler.register_clip(keyzone_clip(1, 0)).is_ok());
        rig.render(&[live(0, MidiMessage::note_on(0, 60, 100))]);
        assert_eq!(rig.sampler.active_voices(), 1);
        let released = rig.sampler.unregister_clip(1).expect("registered");
        assert_eq!(released.id(), 1);
        rig.render(&[]);
        assert_eq!(rig.sampler.active_voices(), 0);
        assert_eq!(rig.sampler.registered_clips(), 0);
    }
}
