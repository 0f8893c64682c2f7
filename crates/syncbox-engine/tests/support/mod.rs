#![allow(dead_code)]

use syncbox_engine::{
    build, AudioEngine, CycleTimes, EngineConfig, EngineEvent, EngineEvents, MidiMessage, MidiPortBuffer,
    PositionReport, Scheduler,
};

pub const RATE: u32 = 48_000;
pub const FRAMES: u32 = 256;
/// One tick at 120 bpm in frames at 48 kHz.
pub const FRAMES_PER_TICK: u64 = 250;

/// Single-threaded engine without a tick thread.
pub fn manual_config() -> EngineConfig {
    EngineConfig {
        sample_rate: RATE,
        buffer_size: FRAMES,
        tick_thread: false,
        realtime_priority: None,
        track_count: 2,
        max_lookahead_bars: 4,
        ..EngineConfig::default()
    }
}

/// Drives an engine callback by callback and records everything it emits.
pub struct Harness {
    pub scheduler: Scheduler,
    pub engine: AudioEngine,
    pub events: EngineEvents,
    cycles: Box<dyn Iterator<Item = CycleTimes>>,
    pub ports: Vec<MidiPortBuffer>,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    /// `(absolute frame, track, message)` for every MIDI event written so far.
    pub midi: Vec<(u64, usize, MidiMessage)>,
    pub log: Vec<EngineEvent>,
    pub positions: Vec<PositionReport>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let ports = (0..config.track_count)
            .map(|_| MidiPortBuffer::with_capacity(config.midi_events_per_callback))
            .collect();
        let frames = config.buffer_size as usize;
        let cycles = Box::new(CycleTimes::sequence(config.sample_rate, config.buffer_size));
        let (scheduler, engine, events) = build(config).expect("engine");
        Self {
            scheduler,
            engine,
            events,
            cycles,
            ports,
            left: vec![0.0; frames],
            right: vec![0.0; frames],
            midi: Vec::new(),
            log: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// One callback, then hands transport events back to the scheduler.
    pub fn run(&mut self) -> CycleTimes {
        let cycle = self.cycles.next().expect("endless cycles");
        self.run_cycle(cycle)
    }

    /// Like [`Harness::run`] with a clock supplied by the caller.
    pub fn run_cycle(&mut self, cycle: CycleTimes) -> CycleTimes {
        self.engine
            .process(&cycle, &mut self.ports, &mut self.left, &mut self.right);
        for (track, port) in self.ports.iter().enumerate() {
            self.midi.extend(
                port.events()
                    .iter()
                    .map(|event| (cycle.current_frames + event.frame as u64, track, event.message)),
            );
        }
        let events: Vec<_> = self.events.drain().collect();
        for event in events.iter() {
            self.scheduler.apply_transport_event(event);
        }
        self.log.extend(events);
        self.positions.extend(self.events.drain_positions());
        cycle
    }

    pub fn run_cycles(&mut self, count: usize) {
        for _ in 0..count {
            self.run();
        }
    }

    /// Runs until the audio side has dispatched `ticks` more steps.
    pub fn run_ticks(&mut self, ticks: u64) {
        let target = self.scheduler.cumulative_playhead() + ticks;
        while self.scheduler.cumulative_playhead() < target {
            self.run();
        }
    }

    pub fn take_midi(&mut self) -> Vec<(u64, usize, MidiMessage)> {
        std::mem::take(&mut self.midi)
    }
}
