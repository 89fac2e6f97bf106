use super::all_dead::AllDeadSignal;
use super::error::{FleetError, ReloadError};
use super::reload::{dependents_to_restart, ReloadDiff};
use super::status::{FleetPhase, FleetStatus, InstanceStatus, ProcessStatus, TaskStatus};
use crate::autotune::WorkerPoolPlan;
use crate::config::process::ProcessConfig;
use crate::config::process_name::ProcessName;
use crate::config::{ConfigLoader, FleetConfig};
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::event::{ApplicationEvent, SchedulerEvent, SupervisorEvent};
use crate::plan::Plan;
use crate::sampler::SampleBatch;
use crate::supervisor::command::logging::OutputRing;
use crate::supervisor::error::StartError;
use crate::supervisor::{NotStartedSupervisor, StartedSupervisor};
use crate::utils::retry::retry_with_backoff;
use crate::utils::threads::{process_thread_name, spawn_named_thread};
use crate::watcher::ReloadEvent;
use crossbeam::channel::{never, Receiver};
use crossbeam::select;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// How long one wave may take to report readiness before the start aborts.
const WAVE_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry curve for reading the configuration document during reload; a
/// watcher firing can catch the file mid-save.
const RELOAD_READ_ATTEMPTS: usize = 3;
const RELOAD_READ_BACKOFF: Duration = Duration::from_millis(200);

/// Default tail size for log requests that do not name one.
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Control-plane requests; each carries a bounded reply channel.
pub enum FleetRequest {
    Status {
        reply: EventPublisher<FleetStatus>,
    },
    Restart {
        name: ProcessName,
        reply: EventPublisher<Result<(), String>>,
    },
    Stop {
        name: ProcessName,
        reply: EventPublisher<Result<(), String>>,
    },
    Start {
        name: ProcessName,
        reply: EventPublisher<Result<(), String>>,
    },
    Scale {
        name: ProcessName,
        desired: usize,
        reply: EventPublisher<Result<(), String>>,
    },
    /// The most recent output lines of a process, oldest first.
    Logs {
        name: ProcessName,
        tail: usize,
        reply: EventPublisher<Result<Vec<String>, String>>,
    },
}

/// Why the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetOutcome {
    /// A termination signal arrived and the fleet shut down in order.
    CleanShutdown,
    /// Every supervisor reached a terminal state on its own.
    AllDead,
}

/// The event sources the main loop listens on.
pub struct FleetInputs {
    pub application: EventConsumer<ApplicationEvent>,
    pub reload: EventConsumer<ReloadEvent>,
    pub scheduler: EventConsumer<SchedulerEvent>,
    pub samples: EventConsumer<SampleBatch>,
    pub requests: EventConsumer<FleetRequest>,
}

/// Owns every supervisor and coordinates start waves, shutdown, reload and
/// scaling. Single writer for all cross-supervisor state.
pub struct FleetManager {
    config: FleetConfig,
    config_path: Option<PathBuf>,
    strict: bool,
    extra_env: IndexMap<String, String>,
    plan: Plan,
    supervisors: IndexMap<ProcessName, StartedSupervisor>,
    status: Arc<RwLock<FleetStatus>>,
    supervisor_publisher: EventPublisher<SupervisorEvent>,
    supervisor_consumer: EventConsumer<SupervisorEvent>,
    /// Recent output per process; rings survive supervisor recreation so
    /// `Logs` still answers while a process restarts.
    output_rings: IndexMap<ProcessName, OutputRing>,
    all_dead: AllDeadSignal,
    #[cfg(test)]
    event_log: Vec<SupervisorEvent>,
}

impl FleetManager {
    /// Validates the dependency graph and prepares the snapshot. Nothing is
    /// spawned yet; a cycle is rejected here, before any process starts.
    pub fn new(
        config: FleetConfig,
        config_path: Option<PathBuf>,
        strict: bool,
    ) -> Result<Self, FleetError> {
        let plan = Plan::try_new(&config)?;
        let (supervisor_publisher, supervisor_consumer) = pub_sub();

        let mut status = FleetStatus::default();
        let mut output_rings = IndexMap::new();
        for (name, process) in config.enabled_processes() {
            status
                .processes
                .insert(name.clone(), ProcessStatus::new(process.scale));
            output_rings.insert(name.clone(), OutputRing::default());
        }
        for (name, _) in &config.tasks {
            status.tasks.insert(name.clone(), TaskStatus::default());
        }

        Ok(Self {
            config,
            config_path,
            strict,
            extra_env: IndexMap::new(),
            plan,
            supervisors: IndexMap::new(),
            status: Arc::new(RwLock::new(status)),
            supervisor_publisher,
            supervisor_consumer,
            output_rings,
            all_dead: AllDeadSignal::default(),
            #[cfg(test)]
            event_log: Vec::new(),
        })
    }

    /// Environment merged into every child, e.g. the autotune pool plan.
    pub fn with_extra_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.extra_env.extend(env);
        self
    }

    pub fn with_autotune_plan(self, plan: Option<WorkerPoolPlan>) -> Self {
        if let Ok(mut status) = self.status.write() {
            status.autotune = plan;
        }
        self
    }

    /// The shared read snapshot. Only the fleet manager writes it.
    pub fn status_handle(&self) -> Arc<RwLock<FleetStatus>> {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> FleetStatus {
        self.status
            .read()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    /// Fires once when every supervisor has reached a terminal state; late
    /// subscribers are notified immediately.
    pub fn subscribe_all_dead(&self) -> Receiver<()> {
        self.all_dead.subscribe()
    }

    /// Starts the whole fleet wave by wave. Every wave member starts
    /// concurrently; the next wave begins only when all members of this one
    /// report healthy. On any failure everything already started is stopped
    /// in reverse order and the call fails.
    pub fn start(&mut self) -> Result<(), FleetError> {
        let span = info_span!("fleet_start");
        let _guard = span.enter();

        let waves: Vec<Vec<ProcessName>> = self.plan.waves().to_vec();
        for (wave_index, wave) in waves.iter().enumerate() {
            info!(wave = wave_index, members = ?wave.iter().map(|n| n.get()).collect::<Vec<_>>(), "starting wave");

            if let Err((process, error)) = self.start_wave(wave) {
                error!(process = %process, %error, "wave member failed to start; aborting");
                self.shutdown();
                return Err(FleetError::Start { process, error });
            }
        }

        self.drain_supervisor_events();
        if let Ok(mut status) = self.status.write() {
            status.phase = FleetPhase::Running;
        }
        info!("fleet is up");
        Ok(())
    }

    fn start_wave(&mut self, wave: &[ProcessName]) -> Result<(), (ProcessName, StartError)> {
        // spawn all wave members concurrently
        let handles: Vec<_> = wave
            .iter()
            .map(|name| {
                let not_started = self.build_supervisor(name);
                let name = name.clone();
                spawn_named_thread(process_thread_name("start", &name, None), move || {
                    (name, not_started.map(NotStartedSupervisor::start))
                })
            })
            .collect();

        let mut failure = None;
        for handle in handles {
            match handle.join() {
                Ok((name, Some(Ok(supervisor)))) => {
                    self.supervisors.insert(name, supervisor);
                }
                Ok((name, Some(Err(error)))) => failure = Some((name, error)),
                Ok((name, None)) => {
                    failure = Some((
                        name,
                        StartError::Spawn("declaration disappeared".to_string()),
                    ))
                }
                Err(_) => {
                    failure = Some((
                        ProcessName::new("internal").expect("a valid placeholder name"),
                        StartError::Spawn("start thread panicked".to_string()),
                    ))
                }
            }
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        // block on readiness of the whole wave
        let deadline = Instant::now() + WAVE_READY_TIMEOUT;
        for name in wave {
            let Some(supervisor) = self.supervisors.get(name) else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            supervisor
                .wait_ready(remaining)
                .map_err(|error| (name.clone(), error))?;
            debug!(process = %name, "ready");
        }

        Ok(())
    }

    fn build_supervisor(&self, name: &ProcessName) -> Option<NotStartedSupervisor> {
        let process = self.config.processes.get(name)?;
        let output_ring = self
            .output_rings
            .get(name)
            .cloned()
            .unwrap_or_default();
        Some(
            NotStartedSupervisor::new(
                name.clone(),
                process.clone(),
                Duration::from(self.config.global.shutdown_timeout),
                self.supervisor_publisher.clone(),
            )
            .with_extra_env(
                self.extra_env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            )
            .with_output_ring(output_ring),
        )
    }

    fn start_one(&mut self, name: &ProcessName, process: ProcessConfig) -> Result<(), FleetError> {
        let output_ring = self
            .output_rings
            .entry(name.clone())
            .or_default()
            .clone();
        let supervisor = NotStartedSupervisor::new(
            name.clone(),
            process.clone(),
            Duration::from(self.config.global.shutdown_timeout),
            self.supervisor_publisher.clone(),
        )
        .with_extra_env(
            self.extra_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        )
        .with_output_ring(output_ring)
        .start()
        .map_err(|error| FleetError::Start {
            process: name.clone(),
            error,
        })?;

        self.supervisors.insert(name.clone(), supervisor);
        if let Ok(mut status) = self.status.write() {
            let restarts = status
                .processes
                .get(name)
                .map(|p| p.restarts)
                .unwrap_or_default();
            let mut fresh = ProcessStatus::new(process.scale);
            fresh.restarts = restarts;
            status.processes.insert(name.clone(), fresh);
        }
        Ok(())
    }

    /// The main loop: runs until a termination signal or the all-dead
    /// condition.
    pub fn run(mut self, inputs: FleetInputs) -> FleetOutcome {
        // select over local receiver handles so arm bodies can mutate self
        let application_rx = inputs.application.as_ref().clone();
        let mut reload_rx = inputs.reload.as_ref().clone();
        let supervisor_rx = self.supervisor_consumer.as_ref().clone();
        let mut scheduler_rx = inputs.scheduler.as_ref().clone();
        let mut samples_rx = inputs.samples.as_ref().clone();
        let mut requests_rx = inputs.requests.as_ref().clone();
        let mut close_reload = false;
        let mut close_scheduler = false;
        let mut close_samples = false;
        let mut close_requests = false;

        loop {
            // the fleet may already be all-dead before the first event, e.g.
            // when a one-shot process exited during start
            let already_dead = self
                .status
                .read()
                .map(|status| {
                    matches!(status.phase, FleetPhase::Running | FleetPhase::Degraded)
                        && status.all_dead()
                })
                .unwrap_or(false);
            if already_dead {
                info!("all processes are dead; leaving the main loop");
                self.all_dead.fire();
                if let Ok(mut status) = self.status.write() {
                    status.phase = FleetPhase::Stopped;
                }
                return FleetOutcome::AllDead;
            }

            select! {
                recv(application_rx) -> event => match event {
                    Ok(ApplicationEvent::StopRequested) | Err(_) => {
                        info!("stop requested");
                        self.shutdown();
                        return FleetOutcome::CleanShutdown;
                    }
                },
                recv(reload_rx) -> event => match event {
                    Ok(()) => self.handle_reload(),
                    Err(_) => close_reload = true,
                },
                recv(supervisor_rx) -> event => {
                    if let Ok(event) = event {
                        if self.apply_supervisor_event(event) {
                            info!("all processes are dead; leaving the main loop");
                            self.all_dead.fire();
                            if let Ok(mut status) = self.status.write() {
                                status.phase = FleetPhase::Stopped;
                            }
                            return FleetOutcome::AllDead;
                        }
                    }
                },
                recv(scheduler_rx) -> event => match event {
                    Ok(event) => self.apply_scheduler_event(event),
                    Err(_) => close_scheduler = true,
                },
                recv(samples_rx) -> batch => match batch {
                    Ok(batch) => self.apply_samples(batch),
                    Err(_) => close_samples = true,
                },
                recv(requests_rx) -> request => match request {
                    Ok(request) => self.handle_request(request),
                    Err(_) => close_requests = true,
                },
            }

            if close_reload {
                close_reload = false;
                reload_rx = never();
            }
            if close_scheduler {
                close_scheduler = false;
                scheduler_rx = never();
            }
            if close_samples {
                close_samples = false;
                samples_rx = never();
            }
            if close_requests {
                close_requests = false;
                requests_rx = never();
            }
        }
    }

    /// Merges a supervisor event into the snapshot; returns whether the
    /// all-dead condition fired.
    fn apply_supervisor_event(&mut self, event: SupervisorEvent) -> bool {
        #[cfg(test)]
        self.event_log.push(event.clone());

        let Ok(mut status) = self.status.write() else {
            return false;
        };

        match event {
            SupervisorEvent::StateChanged { name, state } => {
                if let Some(process) = status.processes.get_mut(&name) {
                    process.state = state;
                }
            }
            SupervisorEvent::InstanceStarted {
                name,
                instance,
                pid,
            } => {
                if let Some(process) = status.processes.get_mut(&name) {
                    process.instances.insert(instance, InstanceStatus::new(pid));
                }
            }
            SupervisorEvent::InstanceExited {
                name,
                instance,
                exit,
            } => {
                if let Some(process) = status.processes.get_mut(&name) {
                    process.instances.remove(&instance);
                    process.last_exit_code = exit.code();
                }
            }
            SupervisorEvent::RestartScheduled { name, .. } => {
                if let Some(process) = status.processes.get_mut(&name) {
                    process.restarts += 1;
                }
            }
        }

        matches!(status.phase, FleetPhase::Running | FleetPhase::Degraded) && status.all_dead()
    }

    fn apply_scheduler_event(&mut self, event: SchedulerEvent) {
        let Ok(mut status) = self.status.write() else {
            return;
        };
        match event {
            SchedulerEvent::RunStarted { task, started_at } => {
                let entry = status.tasks.entry(task).or_default();
                entry.last_started_at = Some(started_at);
                entry.runs += 1;
            }
            SchedulerEvent::RunFinished {
                task,
                exit_code,
                duration,
                timed_out,
            } => {
                let entry = status.tasks.entry(task).or_default();
                entry.last_exit_code = exit_code;
                entry.last_duration = Some(duration);
                if timed_out {
                    entry.timeouts += 1;
                }
            }
            SchedulerEvent::RunSkipped { task } => {
                status.tasks.entry(task).or_default().skips += 1;
            }
        }
    }

    fn apply_samples(&mut self, batch: SampleBatch) {
        let Ok(mut status) = self.status.write() else {
            return;
        };
        for sample in batch {
            if let Some(instance) = status
                .processes
                .get_mut(&sample.name)
                .and_then(|process| process.instances.get_mut(&sample.instance))
            {
                if instance.pid == sample.pid {
                    instance.cpu_percent = sample.cpu_percent;
                    instance.rss_bytes = sample.rss_bytes;
                    instance.open_fds = sample.open_fds;
                }
            }
        }
    }

    fn handle_request(&mut self, request: FleetRequest) {
        match request {
            FleetRequest::Status { reply } => {
                let _ = reply.publish(self.status());
            }
            FleetRequest::Scale {
                name,
                desired,
                reply,
            } => {
                let result = self.scale(&name, desired);
                let _ = reply.publish(result.map_err(|err| err.to_string()));
            }
            FleetRequest::Stop { name, reply } => {
                let result = self.stop_process(&name);
                let _ = reply.publish(result.map_err(|err| err.to_string()));
            }
            FleetRequest::Start { name, reply } => {
                let result = self.start_process(&name);
                let _ = reply.publish(result.map_err(|err| err.to_string()));
            }
            FleetRequest::Restart { name, reply } => {
                let result = self.restart_process(&name);
                let _ = reply.publish(result.map_err(|err| err.to_string()));
            }
            FleetRequest::Logs { name, tail, reply } => {
                let result = self.logs(&name, tail);
                let _ = reply.publish(result.map_err(|err| err.to_string()));
            }
        }
    }

    /// The most recent output lines of a process, oldest first. Served from
    /// the fleet-owned ring, so it answers for stopped and restarting
    /// processes too.
    pub fn logs(&self, name: &ProcessName, tail: usize) -> Result<Vec<String>, FleetError> {
        match self.output_rings.get(name) {
            Some(ring) => Ok(ring.tail(tail)),
            None => Err(FleetError::NotFound(name.clone())),
        }
    }

    /// Delegates to the supervisor's own scale request.
    pub fn scale(&mut self, name: &ProcessName, desired: usize) -> Result<(), FleetError> {
        let supervisor = self
            .supervisors
            .get(name)
            .ok_or_else(|| FleetError::NotFound(name.clone()))?;
        supervisor.scale(desired)?;
        if let Ok(mut status) = self.status.write() {
            if let Some(process) = status.processes.get_mut(name) {
                process.desired_scale = desired;
            }
        }
        Ok(())
    }

    fn stop_process(&mut self, name: &ProcessName) -> Result<(), FleetError> {
        match self.supervisors.shift_remove(name) {
            Some(supervisor) => {
                let deadline = Duration::from(self.config.global.shutdown_timeout);
                if let Err(err) = supervisor.stop(deadline) {
                    warn!(process = %name, %err, "stop finished with an error");
                }
                Ok(())
            }
            None if self.config.processes.contains_key(name) => Ok(()),
            None => Err(FleetError::NotFound(name.clone())),
        }
    }

    fn start_process(&mut self, name: &ProcessName) -> Result<(), FleetError> {
        if let Some(supervisor) = self.supervisors.get(name) {
            if !supervisor.is_finished() {
                return Err(FleetError::AlreadyRunning(name.clone()));
            }
            self.supervisors.shift_remove(name);
        }
        let process = self
            .config
            .processes
            .get(name)
            .filter(|process| process.enabled)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(name.clone()))?;
        self.start_one(name, process)
    }

    fn restart_process(&mut self, name: &ProcessName) -> Result<(), FleetError> {
        match self.supervisors.get(name) {
            Some(supervisor) if !supervisor.is_finished() => {
                supervisor.restart()?;
                Ok(())
            }
            _ => self.start_process(name),
        }
    }

    /// Walks the graph in reverse topological order, stopping each wave
    /// concurrently with a fair share of the global deadline. Idempotent.
    pub fn shutdown(&mut self) {
        {
            let Ok(mut status) = self.status.write() else {
                return;
            };
            if matches!(
                status.phase,
                FleetPhase::ShuttingDown | FleetPhase::Stopped
            ) {
                return;
            }
            status.phase = FleetPhase::ShuttingDown;
        }

        let span = info_span!("fleet_shutdown");
        let _guard = span.enter();
        info!("shutting the fleet down");

        let total = Duration::from(self.config.global.shutdown_timeout);
        let started_at = Instant::now();
        let reverse = self.plan.reverse_waves();

        let mut pending: Vec<Vec<(ProcessName, StartedSupervisor)>> = Vec::new();
        for wave in &reverse {
            let members: Vec<(ProcessName, StartedSupervisor)> = wave
                .iter()
                .filter_map(|name| {
                    self.supervisors
                        .shift_remove(name)
                        .map(|supervisor| (name.clone(), supervisor))
                })
                .collect();
            pending.push(members);
        }
        // supervisors outside the plan (e.g. added by a degraded reload)
        let stragglers: Vec<(ProcessName, StartedSupervisor)> = self
            .supervisors
            .drain(..)
            .collect();
        pending.push(stragglers);

        let wave_count = pending.iter().filter(|wave| !wave.is_empty()).count();
        let mut waves_left = wave_count;
        for members in pending {
            if members.is_empty() {
                continue;
            }
            let remaining = total.saturating_sub(started_at.elapsed());
            let share = remaining
                .checked_div(waves_left as u32)
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(100));
            waves_left = waves_left.saturating_sub(1);

            let handles: Vec<_> = members
                .into_iter()
                .map(|(name, supervisor)| {
                    spawn_named_thread(process_thread_name("stop", &name, None), move || {
                        (name, supervisor.stop(share))
                    })
                })
                .collect();
            for handle in handles {
                if let Ok((name, result)) = handle.join() {
                    match result {
                        Ok(()) => info!(process = %name, "stopped"),
                        Err(err) => warn!(process = %name, %err, "stopped with an error"),
                    }
                }
            }
        }

        self.drain_supervisor_events();
        if let Ok(mut status) = self.status.write() {
            status.phase = FleetPhase::Stopped;
        }
        info!("fleet shutdown complete");
    }

    /// Reloads the configuration document and applies the difference:
    /// removed supervisors stop, changed ones are recreated, added ones
    /// start as a mini-DAG respecting edges into the running fleet. A reload
    /// that cannot be applied is rejected; one that cannot be rolled back
    /// leaves the fleet degraded but running.
    pub fn handle_reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            warn!("no configuration path known; reload is unavailable");
            return;
        };
        let span = info_span!("fleet_reload");
        let _guard = span.enter();
        info!("reloading configuration");

        // a watcher firing can catch the file mid-save; transient IO gets
        // the supervisor's usual backoff before the reload is rejected
        let loaded = retry_with_backoff(RELOAD_READ_ATTEMPTS, RELOAD_READ_BACKOFF, || {
            ConfigLoader::new(self.strict).load(&path)
        });
        let new_config = match loaded {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "rejecting reload: the new configuration does not load");
                return;
            }
        };
        let new_plan = match Plan::try_new(&new_config) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, "rejecting reload: the new configuration does not plan");
                return;
            }
        };

        let diff = ReloadDiff::compute(&self.config, &new_config);
        if diff.is_empty() {
            info!("no material changes; keeping every process untouched");
            self.config = new_config;
            self.plan = new_plan;
            return;
        }

        let dependents = dependents_to_restart(&self.config, &new_config, &new_plan, &diff);
        info!(
            added = ?diff.added.iter().map(|n| n.get()).collect::<Vec<_>>(),
            removed = ?diff.removed.iter().map(|n| n.get()).collect::<Vec<_>>(),
            changed = ?diff.changed.iter().map(|n| n.get()).collect::<Vec<_>>(),
            dependents = ?dependents.iter().map(|n| n.get()).collect::<Vec<_>>(),
            "applying reload"
        );

        let old_config = self.config.clone();
        let deadline = Duration::from(self.config.global.shutdown_timeout);

        // stop the removed set and drop it from the snapshot
        self.stop_set(&diff.removed, deadline);
        for name in &diff.removed {
            self.output_rings.shift_remove(name);
        }
        if let Ok(mut status) = self.status.write() {
            for name in &diff.removed {
                status.processes.shift_remove(name);
            }
            status.tasks.retain(|name, _| new_config.tasks.contains_key(name));
            for name in new_config.tasks.keys() {
                status.tasks.entry(name.clone()).or_default();
            }
        }

        // stop the changed set plus the dependents whose contract moved
        let mut to_recreate: Vec<ProcessName> = diff.changed.clone();
        for dependent in dependents {
            if !to_recreate.contains(&dependent) {
                to_recreate.push(dependent);
            }
        }
        self.stop_set(&to_recreate, deadline);

        // start changed + added in the new plan's wave order
        let start_set: HashSet<ProcessName> = to_recreate
            .iter()
            .chain(diff.added.iter())
            .cloned()
            .collect();
        let mut failed: Vec<ProcessName> = Vec::new();
        for wave in new_plan.waves() {
            for name in wave.iter().filter(|name| start_set.contains(*name)) {
                let Some(process) = new_config.processes.get(name).cloned() else {
                    continue;
                };
                let result = self
                    .start_one(name, process)
                    .and_then(|()| match self.supervisors.get(name) {
                        Some(supervisor) => supervisor.wait_ready(WAVE_READY_TIMEOUT).map_err(
                            |error| FleetError::Start {
                                process: name.clone(),
                                error,
                            },
                        ),
                        None => Ok(()),
                    });
                if let Err(err) = result {
                    error!(process = %name, %err, "reload start failed");
                    failed.push(name.clone());
                }
            }
        }

        self.config = new_config;
        self.plan = new_plan;

        if failed.is_empty() {
            self.drain_supervisor_events();
            info!("reload applied");
            return;
        }

        // rollback attempts: bring the failed ones back under their old
        // declarations
        warn!(failed = ?failed.iter().map(|n| n.get()).collect::<Vec<_>>(), "attempting rollback");
        let mut unrecoverable = Vec::new();
        for name in &failed {
            if let Some(supervisor) = self.supervisors.shift_remove(name) {
                let _ = supervisor.stop(deadline);
            }
            let Some(old_process) = old_config
                .processes
                .get(name)
                .filter(|process| process.enabled)
                .cloned()
            else {
                // the process is new in this document; nothing to roll back to
                continue;
            };
            match self.start_one(name, old_process.clone()) {
                Ok(()) => {
                    // next reload must see this one as changed again
                    self.config.processes.insert(name.clone(), old_process);
                    info!(process = %name, "rolled back to the previous declaration");
                }
                Err(err) => {
                    error!(process = %name, %err, "rollback failed");
                    unrecoverable.push(name.clone());
                }
            }
        }

        if !unrecoverable.is_empty() {
            let reload_error = ReloadError::PartialApply(
                unrecoverable
                    .iter()
                    .map(|name| name.get())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            error!(%reload_error, "the fleet is degraded");
            if let Ok(mut status) = self.status.write() {
                status.phase = FleetPhase::Degraded;
            }
        }
        self.drain_supervisor_events();
    }

    fn stop_set(&mut self, names: &[ProcessName], deadline: Duration) {
        let members: Vec<(ProcessName, StartedSupervisor)> = names
            .iter()
            .filter_map(|name| {
                self.supervisors
                    .shift_remove(name)
                    .map(|supervisor| (name.clone(), supervisor))
            })
            .collect();

        let handles: Vec<_> = members
            .into_iter()
            .map(|(name, supervisor)| {
                spawn_named_thread(process_thread_name("stop", &name, None), move || {
                    (name, supervisor.stop(deadline))
                })
            })
            .collect();
        for handle in handles {
            if let Ok((name, Err(err))) = handle.join() {
                warn!(process = %name, %err, "stop during reload finished with an error");
            }
        }
    }

    /// Applies every queued supervisor event to the snapshot. The main loop
    /// does this continuously; operations running outside it (start,
    /// shutdown, reload) call it so the snapshot is current when they
    /// return.
    fn drain_supervisor_events(&mut self) {
        while let Ok(event) = self.supervisor_consumer.as_ref().try_recv() {
            let _ = self.apply_supervisor_event(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn running_processes(&self) -> Vec<String> {
        self.supervisors.keys().map(|name| name.get()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel::pub_sub_latest;
    use crate::supervisor::state::ProcessState;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn load(yaml: &str) -> FleetConfig {
        ConfigLoader::new(true).load_from_str(yaml).unwrap()
    }

    fn manager(yaml: &str) -> FleetManager {
        FleetManager::new(load(yaml), None, true).unwrap()
    }

    fn inputs() -> (
        FleetInputs,
        EventPublisher<ApplicationEvent>,
        EventPublisher<FleetRequest>,
    ) {
        let (application_publisher, application) = pub_sub();
        let (_reload_publisher, reload) = pub_sub_latest(1);
        let (_scheduler_publisher, scheduler) = pub_sub::<SchedulerEvent>();
        let (_sample_publisher, samples) = pub_sub();
        let (request_publisher, requests) = pub_sub();
        (
            FleetInputs {
                application,
                reload,
                scheduler,
                samples,
                requests,
            },
            application_publisher,
            request_publisher,
        )
    }

    #[test]
    fn cycle_is_rejected_before_anything_spawns() {
        let config = load(
            r#"
version: "1"
processes:
  x: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [y] }
  y: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [x] }
"#,
        );
        let err = FleetManager::new(config, None, true)
            .map(|_| ())
            .unwrap_err();
        assert_matches!(err, FleetError::Plan(_));
    }

    #[test]
    fn start_honors_the_dependency_order() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
  b: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [a] }
"#,
        );

        manager.start().unwrap();

        // replay the event stream: a must be healthy before b's child starts
        let mut a_healthy_at = None;
        let mut b_started_at = None;
        for (position, event) in manager.event_log.iter().enumerate() {
            match event {
                SupervisorEvent::StateChanged { name, state }
                    if name.get() == "a" && *state == ProcessState::Healthy =>
                {
                    a_healthy_at.get_or_insert(position);
                }
                SupervisorEvent::InstanceStarted { name, .. } if name.get() == "b" => {
                    b_started_at.get_or_insert(position);
                }
                _ => {}
            }
        }
        assert!(a_healthy_at.unwrap() < b_started_at.unwrap());

        manager.shutdown();
    }

    #[test]
    fn wave_failure_aborts_and_stops_everything() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  ok: { command: ["/bin/sh", "-c", "sleep 60"] }
  broken: { command: ["/does/not/exist"], depends_on: [ok] }
"#,
        );

        let err = manager.start().unwrap_err();
        assert_matches!(err, FleetError::Start { process, .. } => {
            assert_eq!(process.get(), "broken");
        });
        assert!(manager.running_processes().is_empty());
    }

    #[test]
    fn shutdown_walks_the_graph_in_reverse() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
  b: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [a] }
"#,
        );
        manager.start().unwrap();
        manager.shutdown();

        let mut stopping_order = Vec::new();
        for event in &manager.event_log {
            if let SupervisorEvent::StateChanged { name, state } = event {
                if *state == ProcessState::Stopping {
                    stopping_order.push(name.get());
                }
            }
        }
        assert_eq!(stopping_order, vec!["b", "a"]);

        // shutdown is idempotent
        manager.shutdown();
    }

    #[test]
    fn all_dead_ends_the_main_loop() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  brief: { command: ["/bin/sh", "-c", "sleep 0.6; exit 0"], restart: never }
"#,
        );
        manager.start().unwrap();
        let all_dead = manager.subscribe_all_dead();

        let (inputs, _application, _requests) = inputs();
        let outcome = spawn_named_thread("fleet-test", move || manager.run(inputs))
            .join()
            .unwrap();

        assert_eq!(outcome, FleetOutcome::AllDead);
        assert!(all_dead.try_recv().is_ok());
    }

    #[test]
    fn stop_request_shuts_down_cleanly() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  svc: { command: ["/bin/sh", "-c", "sleep 60"] }
"#,
        );
        manager.start().unwrap();
        let status = manager.status_handle();

        let (inputs, application, _requests) = inputs();
        let runner = spawn_named_thread("fleet-test", move || manager.run(inputs));

        application.publish(ApplicationEvent::StopRequested).unwrap();
        assert_eq!(runner.join().unwrap(), FleetOutcome::CleanShutdown);
        assert_eq!(status.read().unwrap().phase, FleetPhase::Stopped);
    }

    #[test]
    fn status_request_gets_a_snapshot_reply() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  svc: { command: ["/bin/sh", "-c", "sleep 60"] }
"#,
        );
        manager.start().unwrap();

        let (inputs, application, requests) = inputs();
        let runner = spawn_named_thread("fleet-test", move || manager.run(inputs));

        let (reply_publisher, reply_consumer) = pub_sub();
        requests
            .publish(FleetRequest::Status {
                reply: reply_publisher,
            })
            .unwrap();
        let status = reply_consumer
            .as_ref()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(status.processes.contains_key(&ProcessName::must("svc")));

        application.publish(ApplicationEvent::StopRequested).unwrap();
        runner.join().unwrap();
    }

    #[test]
    fn logs_are_served_from_the_ring_even_after_stop() {
        let mut manager = manager(
            r#"
version: "1"
processes:
  chatty:
    command: ["/bin/sh", "-c", "echo hello from chatty; sleep 60"]
"#,
        );
        manager.start().unwrap();
        let chatty = ProcessName::must("chatty");

        // the logger thread drains the pipe shortly after spawn
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut lines = Vec::new();
        while lines.is_empty() && Instant::now() < deadline {
            lines = manager.logs(&chatty, 10).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(lines.iter().any(|line| line.contains("hello from chatty")));

        assert_matches!(
            manager.logs(&ProcessName::must("ghost"), 10),
            Err(FleetError::NotFound(_))
        );

        manager.shutdown();
        assert!(!manager.logs(&chatty, 10).unwrap().is_empty());
    }

    fn write_config(file: &mut tempfile::NamedTempFile, body: &str) {
        use std::io::Seek;
        file.as_file_mut().set_len(0).unwrap();
        file.as_file_mut().rewind().unwrap();
        file.as_file_mut().write_all(body.as_bytes()).unwrap();
        file.as_file_mut().flush().unwrap();
    }

    #[test]
    fn reload_with_unchanged_document_restarts_nothing() {
        let body = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, body);

        let mut manager =
            FleetManager::new(load(body), Some(file.path().to_path_buf()), true).unwrap();
        manager.start().unwrap();

        let pid_before = manager.status().processes[&ProcessName::must("a")]
            .instances[&0]
            .pid;

        manager.handle_reload();

        let after = manager.status();
        assert_eq!(after.processes[&ProcessName::must("a")].instances[&0].pid, pid_before);
        assert_eq!(after.processes[&ProcessName::must("a")].restarts, 0);

        manager.shutdown();
    }

    #[test]
    fn reload_recreates_only_the_changed_process() {
        let before = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
  b: { command: ["/bin/sh", "-c", "sleep 60"] }
"#;
        let after = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
  b: { command: ["/bin/sh", "-c", "sleep 61"] }
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, before);

        let mut manager =
            FleetManager::new(load(before), Some(file.path().to_path_buf()), true).unwrap();
        manager.start().unwrap();

        let a = ProcessName::must("a");
        let b = ProcessName::must("b");
        let a_pid = manager.status().processes[&a].instances[&0].pid;
        let b_pid = manager.status().processes[&b].instances[&0].pid;

        write_config(&mut file, after);
        manager.handle_reload();

        let status = manager.status();
        assert_eq!(status.processes[&a].instances[&0].pid, a_pid);
        assert_ne!(status.processes[&b].instances[&0].pid, b_pid);

        manager.shutdown();
    }

    #[test]
    fn reload_with_only_added_processes_keeps_existing_pids() {
        let before = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
"#;
        let after = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
  c: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [a] }
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, before);

        let mut manager =
            FleetManager::new(load(before), Some(file.path().to_path_buf()), true).unwrap();
        manager.start().unwrap();

        let a = ProcessName::must("a");
        let a_pid = manager.status().processes[&a].instances[&0].pid;

        write_config(&mut file, after);
        manager.handle_reload();

        let status = manager.status();
        assert_eq!(status.processes[&a].instances[&0].pid, a_pid);
        assert_eq!(status.processes[&a].restarts, 0);
        assert!(manager.running_processes().contains(&"c".to_string()));

        manager.shutdown();
    }

    #[test]
    fn reload_rejects_a_cyclic_document_and_keeps_running() {
        let before = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"] }
"#;
        let after = r#"
version: "1"
processes:
  a: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [b] }
  b: { command: ["/bin/sh", "-c", "sleep 60"], depends_on: [a] }
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_config(&mut file, before);

        let mut manager =
            FleetManager::new(load(before), Some(file.path().to_path_buf()), true).unwrap();
        manager.start().unwrap();

        write_config(&mut file, after);
        manager.handle_reload();

        // the old fleet is untouched
        assert_eq!(manager.running_processes(), vec!["a".to_string()]);
        manager.shutdown();
    }
}
