//! Zombie reaping for PID 1 duty.
//!
//! While the supervisor runs as init, children orphaned by their parents get
//! re-parented onto it. Supervisors wait on their own children directly; this
//! loop only harvests the strays so the kernel process table does not fill
//! with zombies.

use crate::event::channel::EventConsumer;
use crate::utils::thread_context::{CancellationMessage, NotStartedThreadContext, StartedThreadContext};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::Duration;
use tracing::{debug, warn};

pub const REAPER_THREAD_NAME: &str = "reaper";

/// Spawns the periodic reaping loop; it exits promptly on cancellation.
pub fn spawn_reaper(interval: Duration) -> StartedThreadContext {
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| loop {
        let reaped = reap_once();
        if reaped > 0 {
            debug!(reaped, "harvested orphaned children");
        }
        if stop_consumer.is_cancelled(interval) {
            break;
        }
    };
    NotStartedThreadContext::new(REAPER_THREAD_NAME, callback).start()
}

/// Calls the non-blocking wait in a tight loop until it reports no more
/// children or an error, returning how many children were harvested. Errors
/// other than "no children" end the tick and are logged.
pub fn reap_once() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code, "reaped exited child");
                reaped += 1;
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                debug!(pid = pid.as_raw(), signal = %signal, "reaped signaled child");
                reaped += 1;
            }
            Ok(_) => {
                // stop/continue notifications carry no zombie to free
            }
            Err(Errno::ECHILD) => break,
            Err(err) => {
                warn!(%err, "reaping failed");
                break;
            }
        }
    }
    reaped
}

// The reaper's non-blocking wait targets every child of the process, so its
// tests live in their own integration-test binary (tests/reaper.rs) where
// they cannot steal children spawned by other tests.
