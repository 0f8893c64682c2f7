//! Audio-callback side of the engine.
//!
//! [`AudioEngine::process`] walks the step ring in step with the audio clock:
//! every tick whose time falls inside the callback is claimed, its MIDI goes
//! to the track's output port at a sample offset, its clip commands go to the
//! sampler and its timer commands are executed. The sampler then renders the
//! whole buffer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use arrayvec::ArrayVec;
use rtrb::Consumer;

use crate::command::{ClipHandle, TimerHandle, TimerOperation};
use crate::events::{EngineEvent, EventBridge, MidiInput, MidiInputEvent};
use crate::midi::{CarryOver, MidiMessage, MidiOutput};
use crate::rt::RtAllocGuard;
use crate::sampler::Sampler;
use crate::scheduler::Core;
use crate::source::ClipId;
use crate::step::{Claim, Step};
use crate::time::{Tempo, TICKS_PER_MIDI_CLOCK};
use crate::transport::TimecodeCounters;

/// Steps a writer held when their time came, retried next callback.
const DEFERRED_STEPS: usize = 64;
/// Live MIDI messages handed to the sampler per callback.
const MIDI_INPUT_PER_CALLBACK: usize = 256;

/// Audio clock of one callback, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimes {
    /// Frames rendered before this callback.
    pub current_frames: u64,
    pub current_usecs: u64,
    /// Expected start of the following callback.
    pub next_usecs: u64,
    pub nframes: u32,
}

impl CycleTimes {
    /// Consecutive callbacks of `nframes` starting at frame zero.
    pub fn sequence(sample_rate: u32, nframes: u32) -> impl Iterator<Item = CycleTimes> {
        let usecs_per_frame = 1_000_000.0 / sample_rate.max(1) as f64;
        (0u64..).map(move |cycle| {
            let current_frames = cycle * nframes as u64;
            let next_frames = current_frames + nframes as u64;
            CycleTimes {
                current_frames,
                current_usecs: (current_frames as f64 * usecs_per_frame).round() as u64,
                next_usecs: (next_frames as f64 * usecs_per_frame).round() as u64,
                nframes,
            }
        })
    }
}

/// Maps between ticks and frames for the callback being rendered.
///
/// Anchored on the next step the dispatcher has not reached yet, so ticks
/// further out follow the current tempo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub next_tick: u64,
    pub next_tick_usecs: f64,
    pub usecs_per_tick: f64,
    pub current_frames: u64,
    pub current_usecs: f64,
    pub usecs_per_frame: f64,
    pub buffer_frames: u64,
}

impl ClockSnapshot {
    /// Nearest frame to `tick`; ticks in the past map to frames in the past.
    pub fn frame_for_tick(&self, tick: f64) -> u64 {
        let usecs = self.next_tick_usecs + (tick - self.next_tick as f64) * self.usecs_per_tick;
        let offset = ((usecs - self.current_usecs) / self.usecs_per_frame).round();
        (self.current_frames as f64 + offset).max(0.0) as u64
    }

    pub fn tick_for_frame(&self, frame: u64) -> f64 {
        let usecs = (frame as f64 - self.current_frames as f64) * self.usecs_per_frame + self.current_usecs;
        self.next_tick as f64 + (usecs - self.next_tick_usecs) / self.usecs_per_tick
    }

    #[cfg(test)]
    pub(crate) fn at_rest(sample_rate: u32, buffer_frames: u64, bpm: u64) -> Self {
        Self {
            next_tick: 0,
            next_tick_usecs: 0.0,
            usecs_per_tick: Tempo::new(bpm).tick_micros(),
            current_frames: 0,
            current_usecs: 0.0,
            usecs_per_frame: 1_000_000.0 / sample_rate as f64,
            buffer_frames,
        }
    }

    /// Same tempo map, one buffer later.
    #[cfg(test)]
    pub(crate) fn advanced(&self) -> Self {
        Self {
            current_frames: self.current_frames + self.buffer_frames,
            current_usecs: self.current_usecs + self.buffer_frames as f64 * self.usecs_per_frame,
            ..*self
        }
    }
}

/// Where a step lands inside the callback.
#[derive(Debug, Clone, Copy)]
struct StepTiming {
    offset: u32,
    frame: u64,
    usecs: u64,
    tick: u64,
}

/// Dispatch state that survives between callbacks.
struct DispatchState {
    bridge: EventBridge,
    carry: Box<[CarryOver]>,
    deferred: ArrayVec<usize, DEFERRED_STEPS>,
    /// Time of the next step, set by the first callback.
    step_usecs: Option<f64>,
    timecode: TimecodeCounters,
    midi_clock_phase: u64,
    midi_clock: bool,
}

/// Audio side of the engine, owned by the audio callback.
pub struct AudioEngine {
    core: Arc<Core>,
    state: DispatchState,
    sampler: Sampler,
    midi_input: Consumer<MidiInputEvent>,
    midi_input_producer: Option<MidiInput>,
    usecs_per_frame: f64,
}

impl AudioEngine {
    pub(crate) fn new(
        core: Arc<Core>,
        bridge: EventBridge,
        midi_input: (MidiInput, Consumer<MidiInputEvent>),
    ) -> Self {
        let config = &core.config;
        let carry = (0..config.track_count)
            .map(|_| CarryOver::with_capacity(config.midi_events_per_callback))
            .collect();
        let state = DispatchState {
            bridge,
            carry,
            deferred: ArrayVec::new(),
            step_usecs: None,
            timecode: TimecodeCounters::default(),
            midi_clock_phase: 0,
            midi_clock: config.midi_clock,
        };
        let sampler = Sampler::new(config);
        let usecs_per_frame = 1_000_000.0 / config.sample_rate.max(1) as f64;
        let (producer, consumer) = midi_input;
        Self {
            core,
            state,
            sampler,
            midi_input: consumer,
            midi_input_producer: Some(producer),
            usecs_per_frame,
        }
    }

    /// Producer for live MIDI into the sampler. Only the first call gets it.
    pub fn take_midi_input(&mut self) -> Option<MidiInput> {
        self.midi_input_producer.take()
    }

    pub fn registered_clips(&self) -> usize {
        self.sampler.registered_clips()
    }

    pub fn active_voices(&self) -> usize {
        self.sampler.active_voices()
    }

    /// Events waiting in the carry-over buffers for the next callback.
    pub fn carried_over(&self) -> usize {
        self.state.carry.iter().map(CarryOver::len).sum()
    }

    /// Runs one audio callback. `midi_out` holds one port per track; tracks
    /// without a port are muted. `left` and `right` are overwritten.
    pub fn process<O: MidiOutput>(
        &mut self,
        cycle: &CycleTimes,
        midi_out: &mut [O],
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let _guard = RtAllocGuard::enter();
        let core: &Core = &self.core;
        let transport = &core.transport;
        let state = &mut self.state;
        let sampler = &mut self.sampler;
        let nframes = cycle.nframes.max(1);
        let now_usecs = cycle.current_usecs;
        transport.now_usecs.store(now_usecs, Ordering::Release);

        for port in midi_out.iter_mut() {
            port.begin_cycle(nframes);
        }
        state.bridge.flush_parked();
        for (carry, port) in state.carry.iter_mut().zip(midi_out.iter_mut()) {
            carry.flush(port);
        }

        let start = StepTiming {
            offset: 0,
            frame: cycle.current_frames,
            usecs: now_usecs,
            tick: transport.cumulative_playhead.load(Ordering::Acquire),
        };
        let retry = std::mem::take(&mut state.deferred);
        for index in retry {
            match core.steps.claim(index) {
                Claim::Ready(mut step) => {
                    tracing::debug!(index, "dispatching step deferred from the last callback");
                    state.run_step(core, sampler, &mut step, start, midi_out);
                }
                Claim::Busy => state.defer(index),
                Claim::Empty => {}
            }
        }

        let current_usecs = now_usecs as f64;
        let next_usecs = cycle.next_usecs as f64;
        let mut step_usecs = state.step_usecs.unwrap_or(current_usecs);
        let mut first_available = 0u32;
        let mut weighted_bpm = 0.0;
        let mut weight = 0.0;

        while step_usecs < next_usecs && first_available < nframes {
            let paused = transport.is_paused();
            if !paused && transport.playhead.load(Ordering::Acquire) == 0 {
                state.timecode = TimecodeCounters::default();
                state.midi_clock_phase = TICKS_PER_MIDI_CLOCK - 1;
            }

            // Late steps take one frame each so a backlog drains over several callbacks.
            let offset = if step_usecs > current_usecs {
                let offset = ((step_usecs - current_usecs) / self.usecs_per_frame).round() as u32;
                first_available = offset.clamp(first_available, nframes - 1);
                first_available
            } else {
                first_available += 1;
                first_available - 1
            };
            let timing = StepTiming {
                offset,
                frame: cycle.current_frames + offset as u64,
                usecs: step_usecs as u64,
                tick: transport.cumulative_playhead.load(Ordering::Acquire),
            };

            let read_head = transport.step_read_head.load(Ordering::Acquire);
            transport.step_read_head.store(read_head + 1, Ordering::Release);
            match core.steps.claim(read_head) {
                Claim::Ready(mut step) => state.run_step(core, sampler, &mut step, timing, midi_out),
                Claim::Busy => state.defer(read_head),
                Claim::Empty => {}
            }

            let tempo = transport.tempo();
            let tick_usecs = tempo.tick_micros();
            weighted_bpm += tempo.bpm() as f64 * tick_usecs;
            weight += tick_usecs;

            if !paused {
                transport.playhead.fetch_add(1, Ordering::AcqRel);
                state.timecode.advance();
                state.midi_clock_phase += 1;
                if state.midi_clock_phase >= TICKS_PER_MIDI_CLOCK {
                    state.midi_clock_phase = 0;
                    if state.midi_clock {
                        state.send_clock(timing.offset, midi_out);
                    }
                }
            }
            transport.cumulative_playhead.fetch_add(1, Ordering::AcqRel);
            step_usecs += tick_usecs;
        }
        state.step_usecs = Some(step_usecs);

        if weight > 0.0 {
            let quantized = (weighted_bpm / weight * 100.0).round() / 100.0;
            transport.quantized_bpm.store(quantized, Ordering::Relaxed);
        }
        transport.publish_timecode(&state.timecode);

        let clock = ClockSnapshot {
            next_tick: transport.cumulative_playhead.load(Ordering::Acquire),
            next_tick_usecs: step_usecs,
            usecs_per_tick: transport.tempo().tick_micros(),
            current_frames: cycle.current_frames,
            current_usecs,
            usecs_per_frame: self.usecs_per_frame,
            buffer_frames: nframes as u64,
        };

        let mut midi: ArrayVec<MidiInputEvent, MIDI_INPUT_PER_CALLBACK> = ArrayVec::new();
        let mut latest = 0;
        while !midi.is_full() {
            let Ok(mut event) = self.midi_input.pop() else {
                break;
            };
            // Out of order input plays at the latest frame seen so far.
            event.frame = event.frame.min(nframes - 1).max(latest);
            latest = event.frame;
            midi.push(event);
        }

        let frames = left.len().min(right.len()).min(nframes as usize);
        left[..frames].fill(0.0);
        right[..frames].fill(0.0);
        let bridge = &mut state.bridge;
        sampler.render(
            &core.clip_pool,
            &clock,
            now_usecs,
            &midi,
            &mut left[..frames],
            &mut right[..frames],
            &mut |report| bridge.report(report),
        );
    }
}

impl DispatchState {
    fn defer(&mut self, index: usize) {
        if self.deferred.try_push(index).is_err() {
            tracing::error!(index, "too many busy steps, dropping one");
        } else {
            tracing::warn!(index, "step still being written, retrying next callback");
        }
    }

    fn run_step<O: MidiOutput>(
        &mut self,
        core: &Core,
        sampler: &mut Sampler,
        step: &mut Step,
        timing: StepTiming,
        midi_out: &mut [O],
    ) {
        for (track, messages) in step.tracks.iter_mut().enumerate() {
            for message in messages.drain(..) {
                self.write_midi(track, timing.offset, message, midi_out);
            }
        }

        for handle in step.clips.drain(..) {
            self.dispatch_clip(core, sampler, handle, timing);
        }

        for handle in step.timers.drain(..) {
            self.execute_timer(core, sampler, handle, timing, midi_out);
        }
    }

    fn write_midi<O: MidiOutput>(&mut self, track: usize, offset: u32, message: MidiMessage, midi_out: &mut [O]) {
        let Some(port) = midi_out.get_mut(track) else {
            return;
        };
        if let Err(err) = port.write(offset, message) {
            tracing::warn!(track, offset, %err, "midi output full, deferring to next callback");
            if let Some(carry) = self.carry.get_mut(track) {
                carry.push(message);
            }
        }
    }

    fn send_clock<O: MidiOutput>(&mut self, offset: u32, midi_out: &mut [O]) {
        for track in 0..midi_out.len() {
            self.write_midi(track, offset, MidiMessage::timing_clock(), midi_out);
        }
    }

    fn dispatch_clip(&mut self, core: &Core, sampler: &mut Sampler, handle: ClipHandle, timing: StepTiming) {
        self.bridge.push(EngineEvent::ClipCommandSent {
            command: *core.clip_pool.get(&handle),
            frame: timing.frame,
        });
        sampler.handle_clip_command(timing.frame, timing.tick as f64, handle, &core.clip_pool, core.now_usecs());
    }

    fn execute_timer<O: MidiOutput>(
        &mut self,
        core: &Core,
        sampler: &mut Sampler,
        mut handle: TimerHandle,
        timing: StepTiming,
        midi_out: &mut [O],
    ) {
        let now = core.now_usecs();
        let record = core.timer_pool.get_mut(&mut handle);
        let command = record.command;
        self.bridge.push(EngineEvent::Timer {
            command,
            frame: timing.frame,
            usecs: timing.usecs,
        });

        match command.operation {
            TimerOperation::StartPlayback => {
                core.transport
                    .playhead_at_start
                    .store(timing.frame, Ordering::Release);
            }
            TimerOperation::SetBpm => {
                core.transport.set_tempo(Tempo::new(command.parameter.max(0) as u64));
            }
            TimerOperation::ClipCommand => match record.clip_command.take() {
                Some(clip) => self.dispatch_clip(core, sampler, clip, timing),
                None => tracing::warn!("clip timer command without a clip command"),
            },
            TimerOperation::SendMidiMessage => {
                let (bytes, size) = command.midi_bytes();
                let message = MidiMessage::from_bytes(&bytes[..size]);
                match usize::try_from(command.parameter) {
                    Ok(track) => self.write_midi(track, timing.offset, message, midi_out),
                    Err(_) => tracing::warn!(track = command.parameter, "midi message for no track"),
                }
            }
            TimerOperation::RegisterClip => match record.registration.take() {
                Some(clip) => match sampler.register_clip(clip) {
                    Ok(Some(replaced)) => self.bridge.push(EngineEvent::ClipReleased(replaced)),
                    Ok(None) => {}
                    Err(rejected) => {
                        tracing::warn!(clip = rejected.id(), "clip registry full");
                        self.bridge.push(EngineEvent::ClipReleased(rejected));
                    }
                },
                None => tracing::warn!("register command without a clip"),
            },
            TimerOperation::UnregisterClip => {
                let id = command.big_parameter as ClipId;
                match sampler.unregister_clip(id) {
                    Some(clip) => self.bridge.push(EngineEvent::ClipReleased(clip)),
                    None => tracing::debug!(clip = id, "unregistering a clip that is not registered"),
                }
            }
            TimerOperation::SamplerChannelEnabledState => {
                let channel = command.parameter.clamp(i8::MIN as i32, i8::MAX as i32) as i8;
                sampler.set_channel_enabled(channel, command.parameter2 != 0);
            }
            _ => {}
        }

        if let Some(clip) = record.clip_command.take() {
            core.clip_pool.release(clip, now);
        }
        core.timer_pool.release(handle, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ClipCommand, TimerCommand};
    use crate::config::EngineConfig;
    use crate::events::{event_channel, midi_input_channel, EngineEvents};
    use crate::midi::{MidiPortBuffer, TimedMidi};
    use crate::scheduler::tests::manual_config;
    use crate::scheduler::Scheduler;
    use crate::source::Clip;

    struct Rig {
        scheduler: Scheduler,
        engine: AudioEngine,
        events: EngineEvents,
        cycles: Box<dyn Iterator<Item = CycleTimes>>,
        ports: Vec<MidiPortBuffer>,
        left: Vec<f32>,
        right: Vec<f32>,
    }

    impl Rig {
        fn new(config: EngineConfig) -> Self {
            let core = Arc::new(Core::new(config));
            let scheduler = Scheduler::new(Arc::clone(&core)).expect("scheduler");
            let (bridge, events) = event_channel(256);
            let frames = core.config.buffer_size;
            let ports = (0..core.config.track_count)
                .map(|_| MidiPortBuffer::with_capacity(core.config.midi_events_per_callback))
                .collect();
            let cycles = Box::new(CycleTimes::sequence(core.config.sample_rate, frames));
            let engine = AudioEngine::new(core, bridge, midi_input_channel(64));
            Self {
                scheduler,
                engine,
                events,
                cycles,
                ports,
                left: vec![0.0; frames as usize],
                right: vec![0.0; frames as usize],
            }
        }

        fn run(&mut self) -> CycleTimes {
            let cycle = self.cycles.next().expect("endless");
            self.engine
                .process(&cycle, &mut self.ports, &mut self.left, &mut self.right);
            for event in self.events.drain() {
                self.scheduler.apply_transport_event(&event);
            }
            cycle
        }

        /// Runs callbacks until `track` produced something, returning the
        /// absolute frame and message of each event.
        fn run_until_midi(&mut self, track: usize, limit: usize) -> Vec<(u64, MidiMessage)> {
            for _ in 0..limit {
                let cycle = self.run();
                let events = self.ports[track].events();
                if !events.is_empty() {
                    return events
                        .iter()
                        .map(|TimedMidi { frame, message }| (cycle.current_frames + *frame as u64, *message))
                        .collect();
                }
            }
            Vec::new()
        }
    }

    #[test]
    fn clock_maps_two_beats_onto_one_second() {
        let clock = ClockSnapshot::at_rest(48_000, 256, 120);
        assert_eq!(clock.frame_for_tick(192.0), 48_000);
        assert!((clock.tick_for_frame(48_000) - 192.0).abs() < 1e-9);
        let later = clock.advanced();
        assert_eq!(later.frame_for_tick(192.0), 48_000);
        assert_eq!(later.current_frames, 256);
    }

    #[test]
    fn steps_land_on_their_tick_frame() {
        let mut rig = Rig::new(manual_config());
        rig.scheduler
            .schedule_midi_buffer(&[MidiMessage::note_on(0, 60, 100)], 10, 0)
            .expect("schedule");
        let events = rig.run_until_midi(0, 40);
        // 10 ticks at 120 bpm is 52083us, frame 2500 at 48k.
        assert_eq!(events, vec![(2_500, MidiMessage::note_on(0, 60, 100))]);
        assert_eq!(rig.scheduler.cumulative_playhead(), 11);
    }

    #[test]
    fn overflow_is_replayed_at_frame_zero() {
        let config = EngineConfig {
            midi_events_per_callback: 2,
            ..manual_config()
        };
        let mut rig = Rig::new(config);
        let burst: Vec<_> = (60..63).map(|note| MidiMessage::note_on(0, note, 100)).collect();
        rig.scheduler.schedule_midi_buffer(&burst, 0, 1).expect("schedule");
        rig.run();
        assert_eq!(rig.ports[1].events().len(), 2);
        assert_eq!(rig.engine.carried_over(), 1);
        rig.run();
        assert_eq!(
            rig.ports[1].events(),
            &[TimedMidi {
                frame: 0,
                message: MidiMessage::note_on(0, 62, 100)
            }]
        );
        assert_eq!(rig.engine.carried_over(), 0);
    }

    #[test]
    fn timer_operations_reach_the_engine() {
        let mut rig = Rig::new(manual_config());
        let clip = Arc::new(Clip::new(4, 48_000, vec![0.1; 480], None));
        rig.scheduler.register_clip(Arc::clone(&clip), 0).expect("register");
        rig.scheduler.set_bpm(150).expect("bpm");
        rig.scheduler.schedule_start_playback(3, false, 0, 0).expect("start");
        for _ in 0..4 {
            rig.run();
        }
        assert_eq!(rig.engine.registered_clips(), 1);
        assert_eq!(rig.scheduler.bpm(), 150);
        assert!(rig.scheduler.is_playing());
        assert!(rig.scheduler.playhead_at_start() > 0);

        rig.scheduler.unregister_clip(4, 0).expect("unregister");
        let mut released = None;
        for _ in 0..4 {
            let cycle = rig.cycles.next().expect("endless");
            rig.engine
                .process(&cycle, &mut rig.ports, &mut rig.left, &mut rig.right);
            for event in rig.events.drain() {
                if let EngineEvent::ClipReleased(clip) = event {
                    released = Some(clip);
                }
            }
        }
        assert_eq!(released.map(|clip| clip.id()), Some(4));
        assert_eq!(rig.engine.registered_clips(), 0);
        assert_eq!(rig.scheduler.pool_stats().timer_commands.live, 0);
    }

    #[test]
    fn midi_clock_runs_at_24_ppqn() {
        let config = EngineConfig {
            midi_clock: true,
            ..manual_config()
        };
        let mut rig = Rig::new(config);
        rig.scheduler.start();
        let mut clocks = 0;
        // 40 callbacks of 256 frames cover 40 * 256 / 250 = 40.96 ticks.
        for _ in 0..40 {
            rig.run();
            clocks += rig.ports[0]
                .events()
                .iter()
                .filter(|event| event.message == MidiMessage::timing_clock())
                .count();
        }
        assert_eq!(clocks, 14);
        assert_eq!(rig.scheduler.timecode().tick, 41);
        assert!((rig.scheduler.timecode().beats_per_minute - 120.0).abs() < 1e-9);
    }

    #[test]
    fn clip_timer_commands_are_sent_once() {
        let mut rig = Rig::new(manual_config());
        let mut command = ClipCommand::for_clip(9, 0);
        command.stop_playback = true;
        rig.scheduler.schedule_timer_clip_command(2, command).expect("timer clip");
        rig.scheduler
            .schedule_timer_command(2, TimerCommand::new(TimerOperation::GuiMessage).with_text("hello"))
            .expect("gui");
        let mut sent = 0;
        let mut gui = 0;
        for _ in 0..3 {
            let cycle = rig.cycles.next().expect("endless");
            rig.engine
                .process(&cycle, &mut rig.ports, &mut rig.left, &mut rig.right);
            for event in rig.events.drain() {
                match event {
                    EngineEvent::ClipCommandSent { command, .. } => {
                        assert_eq!(command.clip, Some(9));
                        sent += 1;
                    }
                    EngineEvent::Timer { command, .. } if command.operation == TimerOperation::GuiMessage => {
                        assert_eq!(command.text.as_str(), "hello");
                        gui += 1;
                    }
                    _ => {}
                }
            }
        }
        assert_eq!((sent, gui), (1, 1));
    }
}
