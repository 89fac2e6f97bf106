use std::fmt::Display;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Lifecycle state of a supervised process. Transitions are serialized by the
/// supervisor runtime; see [`valid_transition`] for the allowed edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Pending,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl ProcessState {
    /// Terminal states: the supervisor runtime has exited and will never
    /// spawn again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    /// States during which children may be alive.
    pub fn has_children(&self) -> bool {
        matches!(
            self,
            ProcessState::Running
                | ProcessState::Healthy
                | ProcessState::Unhealthy
                | ProcessState::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Pending => "pending",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Healthy => "healthy",
            ProcessState::Unhealthy => "unhealthy",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Crashed => "crashed",
            ProcessState::Failed => "failed",
        }
    }
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is an edge of the supervisor state machine.
pub fn valid_transition(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState::*;

    // stop() is accepted from any non-terminal state
    if to == Stopping {
        return !from.is_terminal() && from != Stopping;
    }

    matches!(
        (from, to),
        (Pending, Starting)
            | (Starting, Running)
            | (Starting, Failed)
            | (Running, Healthy)
            | (Running, Crashed)
            | (Healthy, Unhealthy)
            | (Healthy, Crashed)
            | (Unhealthy, Healthy)
            | (Unhealthy, Crashed)
            | (Crashed, Starting)
            | (Crashed, Stopped)
            | (Stopping, Stopped)
    )
}

/// Why a child is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The child exited on its own with a code.
    Exited { code: i32 },
    /// The child was terminated by a signal.
    Signaled { signal: i32 },
}

impl ExitReason {
    pub fn from_exit_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitReason::Exited { code },
            None => ExitReason::Signaled {
                signal: status.signal().unwrap_or_default(),
            },
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitReason::Exited { code: 0 })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitReason::Exited { code } => Some(*code),
            ExitReason::Signaled { .. } => None,
        }
    }
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited { code } => write!(f, "exit status: {code}"),
            ExitReason::Signaled { signal } => write!(f, "signal: {signal}"),
        }
    }
}
