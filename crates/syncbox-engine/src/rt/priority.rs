#[cfg(target_os = "linux")]
pub(crate) fn apply_realtime_priority(priority: i32) -> anyhow::Result<()> {
    let priority = priority.clamp(1, 99);
    unsafe {
        let sched_param = libc::sched_param {
            sched_priority: priority,
        };
        let result = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &sched_param);
        if result != 0 {
            return Err(anyhow::anyhow!(
                "failed to elevate thread priority to SCHED_FIFO {priority}: errno {result}"
            ));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn apply_realtime_priority(priority: i32) -> anyhow::Result<()> {
    Err(anyhow::anyhow!(
        "realtime priority {priority} is only supported on linux"
    ))
}
