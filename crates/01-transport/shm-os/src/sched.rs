//! Scheduling class of the rx dispatcher thread.

use std::io;

use crate::config::DispatchPriority;

/// Applies `priority` to the calling thread.
#[cfg(target_os = "linux")]
pub fn apply_priority(priority: DispatchPriority) -> io::Result<()> {
    match priority {
        DispatchPriority::Inherit => Ok(()),
        DispatchPriority::Realtime => {
            // SAFETY: plain syscall wrapper without pointer arguments.
            let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
            if max < 0 {
                return Err(io::Error::last_os_error());
            }
            let param = libc::sched_param {
                sched_priority: max,
            };
            // SAFETY: `param` is a valid sched_param for the duration of the
            // call and pthread_self() names the calling thread.
            let rc = unsafe {
                libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
            };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            log::debug!("rx dispatcher promoted to SCHED_FIFO priority {max}");
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn apply_priority(priority: DispatchPriority) -> io::Result<()> {
    match priority {
        DispatchPriority::Inherit => Ok(()),
        DispatchPriority::Realtime => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "real-time dispatch priority requires Linux",
        )),
    }
}
