use super::error::CommandError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a termination attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The child honored the configured shutdown signal within the deadline.
    Graceful,
    /// The deadline expired and the child was SIGKILLed.
    HardKilled,
}

/// Signal delivery for one child, addressed by pid because child ownership
/// lives with the waiter thread that reaps it.
pub struct ProcessTerminator {
    pid: u32,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Sends a single signal without waiting. The supervisor runtime drives
    /// its own deadlines through timers and uses only this.
    pub fn signal(&self, sig: Signal) -> Result<(), CommandError> {
        signal::kill(Pid::from_raw(self.pid as i32), sig)
            .map_err(|err| CommandError::NixError(err.to_string()))
    }

    /// The blocking escalation ladder for one-shot children (scheduled task
    /// runs): deliver the shutdown signal, poll `is_exited` until the
    /// deadline, SIGKILL whatever survives. Reports which rung ended it.
    pub fn shutdown_with_deadline<F>(
        self,
        sig: Signal,
        deadline: Duration,
        mut is_exited: F,
    ) -> Result<Escalation, CommandError>
    where
        F: FnMut() -> bool,
    {
        self.signal(sig)?;

        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if is_exited() {
                return Ok(Escalation::Graceful);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        self.signal(Signal::SIGKILL)?;
        Ok(Escalation::HardKilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    fn spawn_shell(script: &str) -> std::process::Child {
        Command::new("sh").arg("-c").arg(script).spawn().unwrap()
    }

    #[test]
    fn cooperative_child_ends_gracefully() {
        let mut child = spawn_shell("sleep 60");
        // give the shell a beat to be signalable
        std::thread::sleep(Duration::from_millis(200));

        let escalation = ProcessTerminator::new(child.id())
            .shutdown_with_deadline(Signal::SIGTERM, Duration::from_secs(5), || {
                child.try_wait().is_ok_and(|status| status.is_some())
            })
            .unwrap();

        assert_eq!(escalation, Escalation::Graceful);
    }

    #[test]
    fn deaf_child_is_escalated_to_sigkill() {
        let mut child = spawn_shell("trap '' TERM; while true; do sleep 1; done");
        std::thread::sleep(Duration::from_millis(500));

        let escalation = ProcessTerminator::new(child.id())
            .shutdown_with_deadline(Signal::SIGTERM, Duration::from_millis(300), || {
                child.try_wait().is_ok_and(|status| status.is_some())
            })
            .unwrap();
        assert_eq!(escalation, Escalation::HardKilled);

        // the SIGKILL is what finally reaps it
        let status = child.wait().unwrap();
        assert_eq!(status.to_string(), "signal: 9 (SIGKILL)");
    }

    #[test]
    fn signalling_a_reaped_pid_fails_cleanly() {
        let mut child = spawn_shell("exit 0");
        child.wait().unwrap();

        // the pid is gone; delivery errors instead of killing a stranger
        let result = ProcessTerminator::new(child.id()).signal(Signal::SIGTERM);
        assert!(result.is_err());
    }
}
