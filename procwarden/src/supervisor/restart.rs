use crate::config::process::{BackoffConfig, RestartPolicyKind};
use crate::supervisor::state::ExitReason;
use std::time::Duration;

/// A child alive for less than this is considered failed regardless of its
/// exit code, so broken argv never turns into a zero-backoff spawn loop.
pub const MIN_UPTIME: Duration = Duration::from_millis(500);

/// How many initial-backoff periods of continuous uptime reset the attempt
/// counter.
const STABILITY_WINDOW_FACTOR: u32 = 10;

/// Restart decision and backoff bookkeeping for one instance. The attempt
/// counter survives respawns and resets once the child has stayed up for the
/// stability window.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    kind: RestartPolicyKind,
    backoff: BackoffConfig,
    attempt: usize,
}

impl RestartPolicy {
    pub fn new(kind: RestartPolicyKind, backoff: BackoffConfig) -> Self {
        Self {
            kind,
            backoff,
            attempt: 0,
        }
    }

    /// Whether a child that exited with `exit` after `uptime` should be
    /// respawned. A fast exit counts as a failure even with exit code zero.
    pub fn should_restart(&self, exit: &ExitReason, uptime: Duration) -> bool {
        match self.kind {
            RestartPolicyKind::Never => false,
            RestartPolicyKind::Always => true,
            RestartPolicyKind::OnFailure => !exit.success() || uptime < MIN_UPTIME,
        }
    }

    /// Returns the attempt number (starting at 1) and the delay to wait
    /// before the respawn. Resets the sequence first when the child was up
    /// longer than the stability window.
    pub fn next_delay(&mut self, uptime: Duration) -> (usize, Duration) {
        if uptime >= self.stability_window() {
            self.attempt = 0;
        }

        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        (self.attempt, delay)
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn stability_window(&self) -> Duration {
        self.backoff.initial * STABILITY_WINDOW_FACTOR
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let factor = self.backoff.multiplier.max(1.0).powi(attempt as i32);
        let delay = self.backoff.initial.mul_f64(factor);
        delay.min(self.backoff.max)
    }
}
