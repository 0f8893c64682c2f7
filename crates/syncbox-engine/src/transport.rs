use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use atomic_float::AtomicF64;

use crate::time::{Tempo, TimecodePosition, BEATS_PER_BAR, TICKS_PER_BEAT};

/// Transport counters shared by the control side, the tick thread and the
/// audio callback. Each counter is advanced by one context only. `stop` on
/// the control side also resets the beat counters and the playhead while the
/// transport is paused, when the audio thread no longer advances them.
#[derive(Debug)]
pub(crate) struct TransportState {
    /// Written by `start`/`stop`.
    pub(crate) paused: AtomicBool,
    /// Tick thread: position inside the bar and total ticks queued.
    pub(crate) beat: AtomicU64,
    pub(crate) cumulative_beat: AtomicU64,
    /// Audio thread: ticks played since start, and ticks dispatched ever.
    pub(crate) playhead: AtomicU64,
    pub(crate) cumulative_playhead: AtomicU64,
    /// Audio thread: next ring slot to be read.
    pub(crate) step_read_head: AtomicUsize,
    /// Control side: read head captured when the transport started.
    pub(crate) read_head_on_start: AtomicUsize,
    pub(crate) bpm: AtomicU64,
    pub(crate) latency_millis: AtomicU64,
    pub(crate) schedule_ahead: AtomicU64,
    /// Audio clock at the start of the latest callback.
    pub(crate) now_usecs: AtomicU64,
    pub(crate) playhead_at_start: AtomicU64,
    pub(crate) quantized_bpm: AtomicF64,
    bar: AtomicU32,
    beat_in_bar: AtomicU32,
    tick_in_beat: AtomicU32,
    bar_start_tick: AtomicU32,
}

impl TransportState {
    pub(crate) fn new(tempo: Tempo, latency_millis: u64) -> Self {
        Self {
            paused: AtomicBool::new(true),
            beat: AtomicU64::new(0),
            cumulative_beat: AtomicU64::new(0),
            playhead: AtomicU64::new(0),
            cumulative_playhead: AtomicU64::new(0),
            step_read_head: AtomicUsize::new(0),
            read_head_on_start: AtomicUsize::new(0),
            bpm: AtomicU64::new(tempo.bpm()),
            latency_millis: AtomicU64::new(latency_millis),
            schedule_ahead: AtomicU64::new(tempo.schedule_ahead_ticks(latency_millis)),
            now_usecs: AtomicU64::new(0),
            playhead_at_start: AtomicU64::new(0),
            quantized_bpm: AtomicF64::new(tempo.bpm() as f64),
            bar: AtomicU32::new(0),
            beat_in_bar: AtomicU32::new(0),
            tick_in_beat: AtomicU32::new(0),
            bar_start_tick: AtomicU32::new(0),
        }
    }

    #[inline]
    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn tempo(&self) -> Tempo {
        Tempo::new(self.bpm.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn now_usecs(&self) -> u64 {
        self.now_usecs.load(Ordering::Acquire)
    }

    /// Applies a tempo and recomputes how far ahead events must be queued.
    pub(crate) fn set_tempo(&self, tempo: Tempo) {
        self.bpm.store(tempo.bpm(), Ordering::Relaxed);
        self.refresh_schedule_ahead();
    }

    pub(crate) fn set_latency_millis(&self, latency_millis: u64) {
        self.latency_millis.store(latency_millis, Ordering::Relaxed);
        self.refresh_schedule_ahead();
    }

    fn refresh_schedule_ahead(&self) {
        let ahead = self
            .tempo()
            .schedule_ahead_ticks(self.latency_millis.load(Ordering::Relaxed));
        self.schedule_ahead.store(ahead, Ordering::Relaxed);
    }

    pub(crate) fn publish_timecode(&self, timecode: &TimecodeCounters) {
        self.bar.store(timecode.bar, Ordering::Relaxed);
        self.beat_in_bar.store(timecode.beat, Ordering::Relaxed);
        self.tick_in_beat.store(timecode.beat_tick, Ordering::Relaxed);
        self.bar_start_tick.store(timecode.bar_start_tick, Ordering::Relaxed);
    }

    pub(crate) fn timecode(&self) -> TimecodePosition {
        TimecodePosition {
            bar: self.bar.load(Ordering::Relaxed),
            beat: self.beat_in_bar.load(Ordering::Relaxed),
            tick: self.tick_in_beat.load(Ordering::Relaxed),
            bar_start_tick: self.bar_start_tick.load(Ordering::Relaxed),
            beats_per_bar: BEATS_PER_BAR as u32,
            ticks_per_beat: TICKS_PER_BEAT as u32,
            beats_per_minute: self.quantized_bpm.load(Ordering::Relaxed),
        }
    }
}

/// Bar/Beat/Tick counters kept by the audio thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TimecodeCounters {
    pub(crate) bar: u32,
    pub(crate) beat: u32,
    pub(crate) beat_tick: u32,
    pub(crate) tick: u32,
    pub(crate) bar_start_tick: u32,
}

impl TimecodeCounters {
    pub(crate) fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        self.beat_tick += 1;
        if self.beat_tick as u64 == TICKS_PER_BEAT {
            self.beat_tick = 0;
            self.beat += 1;
            if self.beat as u64 == BEATS_PER_BAR {
                self.beat = 0;
                self.bar += 1;
                self.bar_start_tick = self.tick;
            }
        }
    }
}
