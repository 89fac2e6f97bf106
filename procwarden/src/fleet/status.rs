use crate::autotune::WorkerPoolPlan;
use crate::config::process_name::ProcessName;
use crate::supervisor::state::ProcessState;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Read snapshot of the whole fleet. The fleet manager is the single writer;
/// everyone else (management API, metrics, sampler) reads clones.
#[derive(Debug, Clone, Serialize, Default)]
pub struct FleetStatus {
    pub phase: FleetPhase,
    pub processes: IndexMap<ProcessName, ProcessStatus>,
    pub tasks: IndexMap<ProcessName, TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autotune: Option<WorkerPoolPlan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FleetPhase {
    #[default]
    Starting,
    Running,
    /// A reload could not be applied nor fully rolled back.
    Degraded,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub desired_scale: usize,
    pub instances: BTreeMap<usize, InstanceStatus>,
    /// Restarts observed over the supervisor's lifetime.
    pub restarts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
}

impl ProcessStatus {
    pub fn new(desired_scale: usize) -> Self {
        Self {
            state: ProcessState::Pending,
            desired_scale,
            instances: BTreeMap::new(),
            restarts: 0,
            last_exit_code: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub pid: u32,
    pub started_at: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_fds: Option<usize>,
}

impl InstanceStatus {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            started_at: SystemTime::now(),
            cpu_percent: None,
            rss_bytes: None,
            open_fds: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TaskStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration: Option<Duration>,
    pub runs: u64,
    pub skips: u64,
    pub timeouts: u64,
}

impl FleetStatus {
    /// The all-dead condition: every supervisor reached a terminal state.
    pub fn all_dead(&self) -> bool {
        !self.processes.is_empty() && self.processes.values().all(ProcessStatus::is_terminal)
    }

    /// Targets the sampler should measure: every live instance pid.
    pub fn sample_targets(&self) -> Vec<(ProcessName, usize, u32)> {
        self.processes
            .iter()
            .flat_map(|(name, process)| {
                process
                    .instances
                    .iter()
                    .map(move |(instance, status)| (name.clone(), *instance, status.pid))
            })
            .collect()
    }
}
