//! Dedicated high resolution pulse thread driving the scheduler's look-ahead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::{Condvar, Mutex};

use crate::rt::apply_realtime_priority;
use crate::time::Tempo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSettings {
    pub tempo: Tempo,
    /// Time before a deadline spent busy-waiting instead of sleeping.
    pub spin_margin: Duration,
    pub realtime_priority: Option<i32>,
}

#[derive(Debug, Default)]
struct TickControl {
    paused: bool,
    aborted: bool,
    restart: bool,
}

struct TickShared {
    control: Mutex<TickControl>,
    wake: Condvar,
    paused: AtomicBool,
    bpm: AtomicU64,
    adjustment_usecs: AtomicU64,
    ticks_fired: AtomicU64,
}

/// Counters reset on every resume.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    start: Instant,
    elapsed_nanos: f64,
    next_extra_nanos: f64,
}

impl TickClock {
    fn starting_now() -> Self {
        Self {
            start: Instant::now(),
            elapsed_nanos: 0.0,
            next_extra_nanos: 0.0,
        }
    }
}

/// Owns the tick thread. Starts paused; dropping it stops and joins the thread.
pub struct TickGenerator {
    shared: Arc<TickShared>,
    worker: Option<JoinHandle<()>>,
}

impl TickGenerator {
    /// Spawns the thread. `on_tick` runs once per tick while resumed and ends
    /// the thread by returning `false`.
    pub fn spawn<F>(settings: TickSettings, on_tick: F) -> anyhow::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shared = Arc::new(TickShared {
            control: Mutex::new(TickControl {
                paused: true,
                ..TickControl::default()
            }),
            wake: Condvar::new(),
            paused: AtomicBool::new(true),
            bpm: AtomicU64::new(settings.tempo.bpm()),
            adjustment_usecs: AtomicU64::new(0),
            ticks_fired: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("syncbox-tick".into())
            .spawn(move || run(thread_shared, settings, on_tick))
            .context("failed to spawn tick thread")?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn pause(&self) {
        let mut control = self.shared.control.lock();
        control.paused = true;
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Restarts the pulse from now with fresh counters.
    pub fn resume(&self) {
        let mut control = self.shared.control.lock();
        if control.paused {
            control.paused = false;
            control.restart = true;
            self.shared.adjustment_usecs.store(0, Ordering::Relaxed);
            self.shared.paused.store(false, Ordering::Release);
            self.shared.wake.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn set_tempo(&self, tempo: Tempo) {
        self.shared.bpm.store(tempo.bpm(), Ordering::Relaxed);
    }

    pub fn tempo(&self) -> Tempo {
        Tempo::new(self.shared.bpm.load(Ordering::Relaxed))
    }

    /// Pulls the pulse forward. Extra ticks fire straight away until the
    /// accumulated offset has been caught up on, so no position is skipped.
    pub fn add_adjustment_by_microseconds(&self, microseconds: u64) {
        self.shared
            .adjustment_usecs
            .fetch_add(microseconds, Ordering::Relaxed);
    }

    pub fn ticks_fired(&self) -> u64 {
        self.shared.ticks_fired.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        {
            let mut control = self.shared.control.lock();
            control.aborted = true;
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            // The last scheduler handle can be released from inside a tick.
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("tick thread panicked");
            }
        }
    }
}

impl Drop for TickGenerator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F>(shared: Arc<TickShared>, settings: TickSettings, mut on_tick: F)
where
    F: FnMut() -> bool,
{
    let mut clock = TickClock::starting_now();
    loop {
        {
            let mut control = shared.control.lock();
            while control.paused && !control.aborted {
                shared.wake.wait(&mut control);
            }
            if control.aborted {
                break;
            }
            if control.restart {
                control.restart = false;
                drop(control);
                if let Some(priority) = settings.realtime_priority {
                    if let Err(err) = apply_realtime_priority(priority) {
                        tracing::warn!(?err, "failed to apply realtime priority to tick thread");
                    }
                }
                clock = TickClock::starting_now();
                tracing::debug!(bpm = shared.bpm.load(Ordering::Relaxed), "tick thread resumed");
            }
        }

        let tick_nanos = Tempo::new(shared.bpm.load(Ordering::Relaxed)).tick_nanos();
        clock.elapsed_nanos += tick_nanos;
        wait_until(
            clock.start + Duration::from_nanos(clock.elapsed_nanos as u64),
            settings.spin_margin,
        );
        if shared.paused.load(Ordering::Acquire) {
            continue;
        }
        if !fire(&shared, &mut on_tick) {
            break;
        }

        let adjustment_nanos = shared.adjustment_usecs.load(Ordering::Relaxed) as f64 * 1_000.0;
        while clock.next_extra_nanos < adjustment_nanos {
            if !fire(&shared, &mut on_tick) {
                return;
            }
            clock.next_extra_nanos += tick_nanos;
        }
    }
    tracing::debug!("tick thread exiting");
}

#[inline]
fn fire<F: FnMut() -> bool>(shared: &TickShared, on_tick: &mut F) -> bool {
    shared.ticks_fired.fetch_add(1, Ordering::Relaxed);
    on_tick()
}

/// Sleeps until just before `target`, then spins the rest of the way.
fn wait_until(target: Instant, spin_margin: Duration) {
    let now = Instant::now();
    if let Some(remaining) = target.checked_duration_since(now) {
        if remaining > spin_margin {
            thread::sleep(remaining - spin_margin);
        }
    }
    while Instant::now() < target {
        std::hint::spin_loop();
    }
}
