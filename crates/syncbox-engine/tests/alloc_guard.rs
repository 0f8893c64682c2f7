mod support;

use std::sync::Arc;

use support::{manual_config, Harness, RATE};
use syncbox_engine::rt::AllocationCounter;
use syncbox_engine::{Clip, ClipCommand, MidiMessage, PlaybackStyle};

#[global_allocator]
static ALLOCATOR: AllocationCounter = AllocationCounter;

#[test]
fn audio_callback_never_allocates() {
    let mut harness = Harness::new(manual_config());
    let clip = Clip::new(1, RATE, vec![0.25; RATE as usize / 2], None);
    clip.update_settings(|settings| settings.root.style = PlaybackStyle::Looping);
    harness.scheduler.register_clip(Arc::new(clip), 0).expect("register");

    let workload = |harness: &mut Harness| {
        for delay in 0..16 {
            harness
                .scheduler
                .schedule_note(60 + delay as u8, 0, true, 100, 24, delay * 4, 0)
                .expect("note");
        }
        let command = ClipCommand {
            start_playback: true,
            change_volume: true,
            volume: 0.8,
            ..ClipCommand::for_clip(1, 0)
        };
        harness.scheduler.schedule_clip_command(command, 8).expect("start");
        let stop = ClipCommand {
            stop_playback: true,
            ..ClipCommand::for_clip(1, 0)
        };
        harness.scheduler.schedule_clip_command(stop, 90).expect("stop");
        harness.run_cycles(120);
        harness.take_midi();
    };

    // First pass warms up thread locals and lazily initialised state.
    workload(&mut harness);
    let before = AllocationCounter::guarded_allocations();
    let freed = AllocationCounter::guarded_deallocations();
    workload(&mut harness);
    let input = harness.engine.take_midi_input();
    if let Some(mut input) = input {
        input.send(0, MidiMessage::control_change(0, 74, 20));
    }
    harness.run_cycles(4);
    assert_eq!(
        AllocationCounter::guarded_allocations(),
        before,
        "allocations detected inside the audio callback"
    );
    assert_eq!(AllocationCounter::guarded_deallocations(), freed);
}
