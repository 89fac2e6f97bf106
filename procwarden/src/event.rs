//! Event types used for communication between components.
//!
//! Components never call into each other directly: signal handlers, the
//! watcher, supervisors and the scheduler all publish events that the fleet
//! manager consumes from its main loop.

pub mod channel;

use crate::config::process_name::ProcessName;
use crate::supervisor::state::{ExitReason, ProcessState};
use std::time::{Duration, SystemTime};

/// Events sent directly to the application. E.g.: OS signals.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplicationEvent {
    StopRequested,
}

/// Lifecycle events published by supervisors and consumed by the fleet
/// manager.
#[derive(Clone, Debug, PartialEq)]
pub enum SupervisorEvent {
    StateChanged {
        name: ProcessName,
        state: ProcessState,
    },
    InstanceStarted {
        name: ProcessName,
        instance: usize,
        pid: u32,
    },
    InstanceExited {
        name: ProcessName,
        instance: usize,
        exit: ExitReason,
    },
    RestartScheduled {
        name: ProcessName,
        instance: usize,
        attempt: usize,
        delay: Duration,
    },
}

impl SupervisorEvent {
    pub fn name(&self) -> &ProcessName {
        match self {
            SupervisorEvent::StateChanged { name, .. }
            | SupervisorEvent::InstanceStarted { name, .. }
            | SupervisorEvent::InstanceExited { name, .. }
            | SupervisorEvent::RestartScheduled { name, .. } => name,
        }
    }
}

/// Records of scheduled-task runs.
#[derive(Clone, Debug, PartialEq)]
pub enum SchedulerEvent {
    RunStarted {
        task: ProcessName,
        started_at: SystemTime,
    },
    RunFinished {
        task: ProcessName,
        exit_code: Option<i32>,
        duration: Duration,
        timed_out: bool,
    },
    /// The firing overlapped a still-running previous run and was dropped.
    RunSkipped { task: ProcessName },
}
