use syncbox_engine::{build, EngineConfig, RingSizing, Tempo, TICKS_PER_BAR};

fn configs() -> Vec<EngineConfig> {
    let base = EngineConfig {
        tick_thread: false,
        realtime_priority: None,
        ..EngineConfig::default()
    };
    vec![
        base.clone(),
        EngineConfig {
            sample_rate: 44_100,
            buffer_size: 1_024,
            latency_max_frames: 4_096,
            ..base.clone()
        },
        EngineConfig {
            buffer_size: 32,
            grace_periods: 8,
            max_lookahead_bars: 1,
            voice_count: 16,
            ..base.clone()
        },
        EngineConfig {
            sample_rate: 96_000,
            max_lookahead_bars: 100,
            track_count: 16,
            ..base
        },
    ]
}

#[test]
fn ring_covers_lookahead_plus_latency() {
    for config in configs() {
        let sizing = RingSizing::derive(&config);
        let fastest = Tempo::new(u64::MAX).schedule_ahead_ticks(config.latency_millis());
        assert_eq!(sizing.max_schedule_ahead, fastest);
        let needed = config.max_lookahead_bars as u64 * TICKS_PER_BAR + 2 * fastest;
        assert!(sizing.step_ring as u64 > needed, "{config:?}");
        assert!(sizing.step_ring.is_power_of_two());
    }
}

#[test]
fn grace_spans_the_configured_periods() {
    for config in configs() {
        let sizing = RingSizing::derive(&config);
        let periods = config.period_usecs() * config.grace_periods as f64;
        assert!(sizing.grace_usecs as f64 >= periods.floor(), "{config:?}");
        assert!(sizing.grace_usecs >= 1_000);
    }
}

#[test]
fn pools_hold_every_voice_in_flight() {
    for config in configs() {
        let sizing = RingSizing::derive(&config);
        assert!(sizing.clip_commands >= config.voice_count * 2);
        assert!(sizing.timer_commands >= config.track_count);
        let (scheduler, _engine, _events) = build(config.clone()).expect("engine");
        assert_eq!(scheduler.sizing(), sizing);
        let stats = scheduler.pool_stats();
        assert_eq!(stats.clip_commands.capacity, sizing.clip_commands);
        assert_eq!(stats.clip_commands.free, sizing.clip_commands);
    }
}
