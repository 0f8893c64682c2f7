//! Per-note granular event generator.
//!
//! A granular note does not sound by itself. It holds its start command,
//! runs the slice envelope, and every few milliseconds synthesises a short
//! start command for one grain, handed to the channel like any other command.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::command::{ClipCommand, ClipHandle};
use crate::midi::ALL_NOTES_OFF;
use crate::voice::{AdsrEnvelope, VoiceContext};

/// Notes a single channel can granulate at once.
pub(crate) const GRAIN_VOICES: usize = 16;
const MINIMUM_GRAIN_PITCH: f64 = 1e-3;

#[derive(Default)]
struct GrainVoice {
    command: Option<ClipHandle>,
    midi_channel: i8,
    midi_note: u8,
    exclusivity_group: i32,
    active: bool,
    tailing_off: bool,
    envelope: AdsrEnvelope,
    envelope_value: f32,
    aftertouch: f32,
    /// Bend in semitones.
    bend: f32,
    /// Window and read position, in seconds.
    start: f64,
    stop: f64,
    window: f64,
    position: f64,
    scan_rate: f64,
    countdown: u64,
}

impl GrainVoice {
    fn stop(&mut self) {
        self.tailing_off = true;
        self.envelope.note_off();
    }

    fn matches_channel(&self, channel: i8) -> bool {
        channel == -1 || channel == self.midi_channel
    }
}

/// Uniform value in `[0, span)`; degenerate spans yield 0.
#[inline]
fn spread(rng: &mut StdRng, span: f64) -> f64 {
    if span == 0.0 || !span.is_finite() {
        0.0
    } else {
        rng.gen::<f64>() * span
    }
}

pub(crate) struct Grainerator {
    voices: [GrainVoice; GRAIN_VOICES],
    rng: StdRng,
}

impl Grainerator {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            voices: Default::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn active_notes(&self) -> usize {
        self.voices.iter().filter(|voice| voice.command.is_some()).count()
    }

    /// Takes ownership of a granular start command. The first grain fires on
    /// the next processed frame.
    pub(crate) fn start(&mut self, handle: ClipHandle, ctx: &VoiceContext<'_>) {
        let command = *ctx.pool.get(&handle);
        if command.exclusivity_group > -1 {
            for voice in self.voices.iter_mut() {
                if voice.command.is_some() && voice.exclusivity_group == command.exclusivity_group {
                    voice.stop();
                }
            }
        }
        let Some(clip) = command.clip.and_then(|id| ctx.registry.get(id)) else {
            ctx.pool.release(handle, ctx.now_usecs);
            return;
        };
        let Some(voice) = self.voices.iter_mut().find(|voice| voice.command.is_none()) else {
            tracing::warn!(voices = GRAIN_VOICES, "no free grain voice, dropping note");
            ctx.pool.release(handle, ctx.now_usecs);
            return;
        };

        let settings = clip.settings();
        let slice = settings.slice(command.slice);
        let rate = clip.sample_rate();
        let start = slice.start_seconds(rate);
        let stop = if slice.stop_samples == 0 {
            clip.duration_seconds()
        } else {
            slice.stop_seconds(rate)
        };
        voice.midi_channel = command.midi_channel;
        voice.midi_note = command.midi_note;
        voice.exclusivity_group = command.exclusivity_group;
        voice.aftertouch = command.volume;
        voice.bend = 0.0;
        voice.envelope.reset();
        voice.envelope.set_parameters(slice.adsr, rate as f32);
        voice.envelope_value = 0.0;
        voice.start = start;
        voice.stop = stop;
        voice.window = (stop - start) * slice.granular.spray as f64;
        voice.position = start + slice.granular.position as f64 * (stop - start);
        voice.scan_rate = if slice.granular.scan != 0.0 {
            100.0 * rate as f64 / ctx.sample_rate.max(1.0) as f64
        } else {
            0.0
        };
        voice.countdown = 0;
        voice.active = false;
        voice.tailing_off = false;
        voice.command = Some(handle);
    }

    /// Lets the matching note's envelope release. Grains already sounding
    /// play out under their own envelopes.
    pub(crate) fn stop(&mut self, command: &ClipCommand, ctx: &VoiceContext<'_>) -> bool {
        let found = self.voices.iter_mut().find(|voice| {
            !voice.tailing_off
                && voice
                    .command
                    .as_ref()
                    .is_some_and(|held| ctx.pool.get(held).equivalent_to(command))
        });
        match found {
            Some(voice) => {
                voice.stop();
                true
            }
            None => false,
        }
    }

    pub(crate) fn pitch_bend(&mut self, channel: i8, semitones: f32) {
        if let Some(voice) = self.first_on(channel, None) {
            voice.bend = semitones;
        }
    }

    pub(crate) fn aftertouch(&mut self, channel: i8, note: Option<u8>, pressure: u8) {
        if let Some(voice) = self.first_on(channel, note) {
            voice.aftertouch = pressure.min(127) as f32 / 127.0;
        }
    }

    pub(crate) fn control_change(&mut self, channel: i8, control: u8) {
        if control != ALL_NOTES_OFF {
            return;
        }
        for voice in self.voices.iter_mut() {
            if voice.command.is_some() && voice.matches_channel(channel) {
                voice.stop();
            }
        }
    }

    fn first_on(&mut self, channel: i8, note: Option<u8>) -> Option<&mut GrainVoice> {
        self.voices.iter_mut().find(|voice| {
            voice.command.is_some()
                && voice.matches_channel(channel)
                && note.map_or(true, |note| note == voice.midi_note)
        })
    }

    /// Runs frames `from..to` of the current callback, handing every new
    /// grain to `emit` with the absolute frame it starts at.
    pub(crate) fn process(
        &mut self,
        from: usize,
        to: usize,
        ctx: &VoiceContext<'_>,
        emit: &mut impl FnMut(u64, ClipHandle),
    ) {
        let frames_per_ms = ctx.sample_rate as f64 / 1_000.0;
        for frame in from..to {
            let now = ctx.clock.current_frames + frame as u64;
            for voice in self.voices.iter_mut() {
                let Some(note) = voice.command.as_ref().map(|held| *ctx.pool.get(held)) else {
                    continue;
                };
                if voice.active {
                    voice.envelope_value = voice.envelope.next_sample();
                }
                if voice.countdown == 0 {
                    if !voice.active {
                        voice.active = true;
                        voice.envelope.note_on();
                        voice.envelope_value = voice.envelope.next_sample();
                    }
                    let Some(clip) = note.clip.and_then(|id| ctx.registry.get(id)) else {
                        if let Some(held) = voice.command.take() {
                            ctx.pool.release(held, ctx.now_usecs);
                        }
                        voice.active = false;
                        continue;
                    };
                    let settings = clip.settings();
                    let granular = settings.slice(note.slice).granular;
                    if !voice.tailing_off {
                        if let Some(grain) =
                            Self::pick_grain(voice, &note, clip.duration_seconds(), &mut self.rng, ctx)
                        {
                            emit(now, grain);
                        }
                    }
                    let additional = spread(&mut self.rng, granular.interval_additional as f64);
                    let interval = if granular.interval == 0.0 {
                        voice.window * 1_000.0 + additional
                    } else {
                        granular.interval as f64 + additional
                    };
                    voice.countdown = ((frames_per_ms * interval) as u64).max(1);
                    if voice.scan_rate != 0.0 {
                        let scan = granular.scan as f64;
                        voice.position += (scan / voice.scan_rate).clamp(-voice.window, voice.window);
                        if scan < 0.0 && voice.position < voice.start {
                            voice.position = voice.stop - (voice.start - voice.position);
                        } else if scan > 0.0 && voice.position > voice.stop {
                            voice.position = voice.start + (voice.position - voice.stop);
                        }
                    }
                }
                if voice.active && !voice.envelope.is_active() {
                    if let Some(held) = voice.command.take() {
                        ctx.pool.release(held, ctx.now_usecs);
                    }
                    voice.active = false;
                    voice.tailing_off = false;
                    continue;
                }
                voice.countdown = voice.countdown.saturating_sub(1);
            }
        }
    }

    fn pick_grain(
        voice: &GrainVoice,
        note: &ClipCommand,
        clip_duration: f64,
        rng: &mut StdRng,
        ctx: &VoiceContext<'_>,
    ) -> Option<ClipHandle> {
        let clip = ctx.registry.get(note.clip?)?;
        let settings = clip.settings();
        let granular = settings.slice(note.slice).granular;
        let mut handle = ctx.pool.acquire(ctx.now_usecs)?;
        let grain = ctx.pool.get_mut(&mut handle);
        *grain = ClipCommand::for_clip(clip.id(), note.midi_channel);
        grain.midi_note = note.midi_note;
        grain.slice = note.slice;
        grain.start_playback = true;
        grain.change_volume = true;
        grain.volume = voice.aftertouch * voice.envelope_value;
        grain.set_start_position = true;
        grain.set_stop_position = true;
        grain.change_pan = true;

        if granular.pitch_is_fixed() {
            grain.change_pitch = false;
            grain.pitch_change = 1.0;
        } else {
            let (minimum, maximum) = if rng.gen::<f32>() < granular.pitch_priority {
                (granular.pitch_minimum1, granular.pitch_maximum1)
            } else {
                (granular.pitch_minimum2, granular.pitch_maximum2)
            };
            let pitch = minimum as f64 + spread(rng, (maximum - minimum) as f64);
            grain.change_pitch = true;
            grain.pitch_change = (pitch * 2f64.powf(voice.bend as f64 / 12.0)) as f32;
        }

        let size = granular.grain_size() as f64 + spread(rng, granular.size_additional as f64);
        let pitch = (grain.pitch_change as f64).abs().max(MINIMUM_GRAIN_PITCH);
        let duration = (size / (pitch * 1_000.0)).min(clip_duration);
        let mut start = if voice.window < duration {
            voice.position
        } else {
            voice.position + spread(rng, voice.window - duration)
        };
        if start > voice.stop {
            start = voice.start + (start - voice.stop);
        }
        grain.start_position = start;
        grain.stop_position = start + duration;
        grain.pan = granular.pan_minimum + spread(rng, (granular.pan_maximum - granular.pan_minimum) as f64) as f32;
        Some(handle)
    }
}
