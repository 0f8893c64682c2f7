use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use syncbox_engine::{
    build, Clip, ClipCommand, CycleTimes, EngineConfig, MidiPortBuffer, PlaybackStyle,
};

const SAMPLE_RATE: u32 = 48_000;
const BLOCK: u32 = 128;

fn tone(id: u32, seconds: f32, frequency: f32) -> Arc<Clip> {
    let len = (seconds * SAMPLE_RATE as f32) as usize;
    let step = TAU * frequency / SAMPLE_RATE as f32;
    let samples = (0..len).map(|i| (i as f32 * step).sin() * 0.1).collect();
    Arc::new(Clip::new(id, SAMPLE_RATE, samples, None))
}

fn config(track_count: usize) -> EngineConfig {
    EngineConfig {
        sample_rate: SAMPLE_RATE,
        buffer_size: BLOCK,
        track_count,
        tick_thread: false,
        realtime_priority: None,
        ..EngineConfig::default()
    }
}

fn dispatch_busy_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(30);

    group.bench_function("16_tracks_block128", |b| {
        let config = config(16);
        let mut ports: Vec<_> = (0..config.track_count)
            .map(|_| MidiPortBuffer::with_capacity(config.midi_events_per_callback))
            .collect();
        let (scheduler, mut engine, mut events) = build(config).expect("engine");
        scheduler.start();
        let mut cycles = CycleTimes::sequence(SAMPLE_RATE, BLOCK);
        let mut left = vec![0.0; BLOCK as usize];
        let mut right = vec![0.0; BLOCK as usize];
        let mut note = 0u8;

        b.iter(|| {
            for track in 0..16 {
                scheduler
                    .schedule_note(36 + note % 48, 0, true, 100, 12, 4, track)
                    .ok();
            }
            note = note.wrapping_add(1);
            scheduler.tick();
            if let Some(cycle) = cycles.next() {
                engine.process(&cycle, &mut ports, &mut left, &mut right);
            }
            events.drain().for_each(drop);
        });
    });

    group.finish();
}

fn render_looping_clips(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampler");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(30);

    group.bench_function("8_loops_block128", |b| {
        let config = config(1);
        let mut ports = vec![MidiPortBuffer::with_capacity(config.midi_events_per_callback)];
        let (scheduler, mut engine, mut events) = build(config).expect("engine");
        for id in 0..8 {
            let clip = tone(id, 2.0, 110.0 * (id + 1) as f32);
            clip.update_settings(|settings| settings.root.style = PlaybackStyle::Looping);
            scheduler.register_clip(clip, 0).expect("register");
            let command = ClipCommand {
                start_playback: true,
                ..ClipCommand::for_clip(id, -1)
            };
            scheduler.schedule_clip_command(command, 1).expect("start clip");
        }
        scheduler.start();
        let mut cycles = CycleTimes::sequence(SAMPLE_RATE, BLOCK);
        let mut left = vec![0.0; BLOCK as usize];
        let mut right = vec![0.0; BLOCK as usize];

        b.iter(|| {
            scheduler.tick();
            if let Some(cycle) = cycles.next() {
                engine.process(&cycle, &mut ports, &mut left, &mut right);
            }
            events.drain().for_each(drop);
            events.drain_positions().for_each(drop);
        });
    });

    group.finish();
}

criterion_group!(benches, dispatch_busy_steps, render_looping_clips);
criterion_main!(benches);
