use super::command::child::NotStartedChild;
use super::command::executable_data::ExecutableData;
use super::command::logging::OutputRing;
use super::command::shutdown::ProcessTerminator;
use super::error::{RequestError, StartError, StopError};
use super::hooks::run_hook;
use super::restart::RestartPolicy;
use super::state::{valid_transition, ExitReason, ProcessState};
use crate::config::process::ProcessConfig;
use crate::config::process_name::ProcessName;
use crate::event::channel::{pub_sub, pub_sub_latest, EventConsumer, EventPublisher};
use crate::event::SupervisorEvent;
use crate::health::{spawn_instance_probe, ProbeChecker, ProbeOutcome};
use crate::utils::thread_context::StartedThreadContext;
use crate::utils::threads::{process_thread_name, spawn_named_thread};
use crossbeam::channel::{after, never};
use crossbeam::select;
use indexmap::IndexMap;
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// Probe outcomes waiting for the runtime loop; the freshest displaces the
/// oldest when full.
const PROBE_CHANNEL_CAPACITY: usize = 16;

/// Extra wait on top of the stop deadline before giving up on the runtime's
/// stop reply.
const STOP_REPLY_GRACE: Duration = Duration::from_secs(10);

const REQUEST_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment exported to every child.
pub const ENV_PROCESS_NAME: &str = "PROCWARDEN_PROCESS";
pub const ENV_INSTANCE: &str = "PROCWARDEN_INSTANCE";

/// Requests accepted by a running supervisor. External callers never mutate
/// supervisor state directly; they enqueue one of these.
#[derive(Debug)]
pub enum SupervisorRequest {
    Stop {
        deadline: Duration,
        reply: EventPublisher<Result<(), StopError>>,
    },
    Scale {
        desired: usize,
        reply: EventPublisher<Result<(), RequestError>>,
    },
    RestartInstance {
        instance: usize,
        reason: RestartReason,
    },
    RestartAll,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartReason {
    HealthCheckFailed,
    Requested,
}

struct ChildExit {
    instance: usize,
    reason: ExitReason,
}

/// A supervisor that has not started its process yet. `start` runs the
/// synchronous part of the state machine (hooks and spawns) and hands the
/// rest to a dedicated runtime thread.
pub struct NotStartedSupervisor {
    name: ProcessName,
    config: ProcessConfig,
    default_shutdown_timeout: Duration,
    extra_env: IndexMap<String, String>,
    output_ring: OutputRing,
    event_publisher: EventPublisher<SupervisorEvent>,
}

/// Handle to a running supervisor. Dropping it without calling `stop` closes
/// the request channel, which the runtime treats as a stop request with the
/// default deadline.
#[derive(Debug)]
pub struct StartedSupervisor {
    name: ProcessName,
    request_publisher: EventPublisher<SupervisorRequest>,
    ready_consumer: EventConsumer<Result<(), StartError>>,
    join_handle: JoinHandle<()>,
}

impl NotStartedSupervisor {
    pub fn new(
        name: ProcessName,
        config: ProcessConfig,
        default_shutdown_timeout: Duration,
        event_publisher: EventPublisher<SupervisorEvent>,
    ) -> Self {
        Self {
            name,
            config,
            default_shutdown_timeout,
            extra_env: IndexMap::new(),
            output_ring: OutputRing::default(),
            event_publisher,
        }
    }

    /// Additional environment merged into every child, e.g. the worker-pool
    /// sizing derived by autotune.
    pub fn with_extra_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.extra_env.extend(env);
        self
    }

    /// Shares the fleet-owned output ring so recent child output stays
    /// servable across supervisor recreations.
    pub fn with_output_ring(mut self, output_ring: OutputRing) -> Self {
        self.output_ring = output_ring;
        self
    }

    pub fn start(self) -> Result<StartedSupervisor, StartError> {
        let span = info_span!("start_process", process = %self.name);
        let _guard = span.enter();

        let (request_publisher, request_consumer) = pub_sub();
        let (exit_publisher, exit_consumer) = pub_sub();
        let (probe_publisher, probe_consumer) = pub_sub_latest(PROBE_CHANNEL_CAPACITY);
        let (ready_publisher, ready_consumer) = pub_sub_latest(1);

        let mut runtime = SupervisorRuntime {
            name: self.name.clone(),
            default_shutdown_timeout: self.default_shutdown_timeout,
            extra_env: self.extra_env,
            output_ring: self.output_ring,
            state: ProcessState::Pending,
            desired: self.config.scale,
            instances: HashMap::new(),
            restart_policies: HashMap::new(),
            draining: HashSet::new(),
            restarting: HashSet::new(),
            timers: Vec::new(),
            stop_reply: None,
            hard_killed: false,
            event_publisher: self.event_publisher,
            request_consumer,
            exit_publisher,
            exit_consumer,
            probe_publisher,
            probe_consumer,
            ready_publisher,
            config: self.config,
        };

        runtime.publish_state();
        runtime.transition(ProcessState::Starting);

        if let Some(pre_start) = runtime.config.hooks.pre_start.clone() {
            run_hook(&runtime.name, &pre_start).map_err(|err| {
                runtime.transition(ProcessState::Failed);
                StartError::HookPreStart(err.to_string())
            })?;
        }

        // reject an unbuildable probe before spawning anything
        if let Some(health_check) = runtime.config.health_check.clone() {
            if let Err(err) = ProbeChecker::try_new(&health_check) {
                runtime.transition(ProcessState::Failed);
                return Err(StartError::Spawn(format!("building health checker: {err}")));
            }
        }

        for instance in 0..runtime.config.scale {
            if let Err(err) = runtime.spawn_instance(instance) {
                runtime.kill_all_children();
                runtime.transition(ProcessState::Failed);
                return Err(err);
            }
        }

        if let Some(post_start) = runtime.config.hooks.post_start.clone() {
            if let Err(err) = run_hook(&runtime.name, &post_start) {
                warn!(process = %runtime.name, %err, "post_start hook failed");
            }
        }

        runtime.transition(ProcessState::Running);
        if runtime.config.health_check.is_none() {
            runtime.become_healthy();
        }

        let name = self.name.clone();
        let thread_name = process_thread_name("sup", &name, None);
        let join_handle = spawn_named_thread(thread_name, move || runtime.run());

        Ok(StartedSupervisor {
            name,
            request_publisher,
            ready_consumer,
            join_handle,
        })
    }
}

impl StartedSupervisor {
    pub fn name(&self) -> &ProcessName {
        &self.name
    }

    /// Blocks until the process reaches `Healthy` or fails; readiness is the
    /// first healthy probe, or a successful start when no probe is
    /// configured.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), StartError> {
        match self.ready_consumer.as_ref().recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(StartError::ReadinessTimeout),
        }
    }

    /// Stops the process: pre_stop hook, shutdown signal, deadline, SIGKILL
    /// for stragglers, post_stop hook. Idempotent from the runtime's point of
    /// view.
    pub fn stop(self, deadline: Duration) -> Result<(), StopError> {
        let (reply_publisher, reply_consumer) = pub_sub();
        let published = self.request_publisher.publish(SupervisorRequest::Stop {
            deadline,
            reply: reply_publisher,
        });
        if published.is_err() {
            // the runtime already reached a terminal state on its own
            let _ = self.join_handle.join();
            return Ok(());
        }

        let reply = match reply_consumer.as_ref().recv_timeout(deadline + STOP_REPLY_GRACE) {
            Ok(reply) => reply,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Ok(()),
            Err(err) => Err(StopError::Channel(err.to_string())),
        };
        let _ = self.join_handle.join();
        reply
    }

    /// Sets the desired scale; the runtime spawns or drains instances to
    /// converge.
    pub fn scale(&self, desired: usize) -> Result<(), RequestError> {
        let (reply_publisher, reply_consumer) = pub_sub();
        self.request_publisher
            .publish(SupervisorRequest::Scale {
                desired,
                reply: reply_publisher,
            })
            .map_err(|err| RequestError::ChannelClosed(err.to_string()))?;
        reply_consumer
            .as_ref()
            .recv_timeout(REQUEST_REPLY_TIMEOUT)
            .map_err(|err| RequestError::ChannelClosed(err.to_string()))?
    }

    /// Requests a rolling restart of every instance.
    pub fn restart(&self) -> Result<(), RequestError> {
        self.request_publisher
            .publish(SupervisorRequest::RestartAll)
            .map_err(|err| RequestError::ChannelClosed(err.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

struct Instance {
    pid: u32,
    started_at: Instant,
    probe: Option<StartedThreadContext>,
    consecutive_failures: usize,
    consecutive_successes: usize,
    restart_issued: bool,
}

enum TimerAction {
    Respawn(usize),
    KillInstance(usize),
    StopDeadline,
}

/// The single-writer event loop owning all supervisor state. Every mutation
/// happens here, so state transitions are totally ordered.
struct SupervisorRuntime {
    name: ProcessName,
    config: ProcessConfig,
    default_shutdown_timeout: Duration,
    extra_env: IndexMap<String, String>,
    output_ring: OutputRing,
    state: ProcessState,
    desired: usize,
    instances: HashMap<usize, Instance>,
    restart_policies: HashMap<usize, RestartPolicy>,
    /// Instances being stopped on purpose (scale down); their exits are not
    /// crashes.
    draining: HashSet<usize>,
    /// Instances being bounced; their exits schedule a respawn regardless of
    /// the restart policy.
    restarting: HashSet<usize>,
    timers: Vec<(Instant, TimerAction)>,
    stop_reply: Option<EventPublisher<Result<(), StopError>>>,
    hard_killed: bool,
    event_publisher: EventPublisher<SupervisorEvent>,
    request_consumer: EventConsumer<SupervisorRequest>,
    exit_publisher: EventPublisher<ChildExit>,
    exit_consumer: EventConsumer<ChildExit>,
    probe_publisher: EventPublisher<ProbeOutcome>,
    probe_consumer: EventConsumer<ProbeOutcome>,
    ready_publisher: EventPublisher<Result<(), StartError>>,
}

impl SupervisorRuntime {
    fn run(mut self) {
        let span = info_span!("supervise", process = %self.name);
        let _guard = span.enter();
        debug!("supervisor runtime started");

        // select over local receiver handles so arm bodies can mutate self
        let mut request_rx = self.request_consumer.as_ref().clone();
        let exit_rx = self.exit_consumer.as_ref().clone();
        let probe_rx = self.probe_consumer.as_ref().clone();
        let mut requests_closed = false;

        loop {
            let timer = match self.next_deadline() {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };

            select! {
                recv(request_rx) -> request => match request {
                    Ok(request) => self.handle_request(request),
                    Err(_) => requests_closed = true,
                },
                recv(exit_rx) -> exit => {
                    if let Ok(exit) = exit {
                        self.handle_child_exit(exit);
                    }
                },
                recv(probe_rx) -> outcome => {
                    if let Ok(outcome) = outcome {
                        self.handle_probe_outcome(outcome);
                    }
                },
                recv(timer) -> _ => self.handle_due_timers(),
            }

            if requests_closed {
                // every handle is gone; shut the process down
                requests_closed = false;
                request_rx = never();
                if self.state != ProcessState::Stopping && !self.state.is_terminal() {
                    self.initiate_stop(None, self.default_shutdown_timeout);
                }
            }

            if self.state.is_terminal() {
                break;
            }
        }

        self.cancel_all_probes();
        debug!("supervisor runtime finished");
    }

    fn handle_request(&mut self, request: SupervisorRequest) {
        match request {
            SupervisorRequest::Stop { deadline, reply } => {
                if self.state.is_terminal() {
                    let _ = reply.publish(Ok(()));
                } else if self.state == ProcessState::Stopping {
                    // already stopping; the new caller also gets the reply
                    self.stop_reply = Some(reply);
                } else {
                    self.initiate_stop(Some(reply), deadline);
                }
            }
            SupervisorRequest::Scale { desired, reply } => {
                let result = self.apply_scale(desired);
                let _ = reply.publish(result);
            }
            SupervisorRequest::RestartInstance { instance, reason } => {
                self.restart_instance(instance, reason);
            }
            SupervisorRequest::RestartAll => {
                let live: Vec<usize> = self.instances.keys().copied().collect();
                for instance in live {
                    self.restart_instance(instance, RestartReason::Requested);
                }
            }
        }
    }

    /// A restart request received while stopping is discarded.
    fn restart_instance(&mut self, instance: usize, reason: RestartReason) {
        if self.state == ProcessState::Stopping || self.state.is_terminal() {
            debug!(instance, "discarding restart request while stopping");
            return;
        }
        if self.restarting.contains(&instance) || self.draining.contains(&instance) {
            return;
        }
        let Some(record) = self.instances.get_mut(&instance) else {
            return;
        };

        info!(instance, ?reason, "restarting instance");
        if let Some(probe) = record.probe.take() {
            let _ = probe.stop();
        }
        let terminator = ProcessTerminator::new(record.pid);
        if let Err(err) = terminator.signal(self.config.shutdown_signal.signal()) {
            warn!(instance, %err, "could not signal instance for restart");
        }
        self.restarting.insert(instance);
        let deadline = self.stop_deadline(None);
        self.timers
            .push((Instant::now() + deadline, TimerAction::KillInstance(instance)));
    }

    fn apply_scale(&mut self, desired: usize) -> Result<(), RequestError> {
        if self.state == ProcessState::Stopping || self.state.is_terminal() {
            return Err(RequestError::ShuttingDown);
        }
        let max_scale = self.config.max_scale();
        if desired == 0 || desired > max_scale {
            return Err(RequestError::InvalidScale {
                requested: desired,
                max_scale,
            });
        }

        info!(desired, current = self.instances.len(), "scaling");
        self.desired = desired;

        // spawn the missing lower indices
        for instance in 0..desired {
            let pending_respawn = self
                .timers
                .iter()
                .any(|(_, action)| matches!(action, TimerAction::Respawn(i) if *i == instance));
            let is_live =
                self.instances.contains_key(&instance) || self.restarting.contains(&instance);
            if !is_live && !pending_respawn {
                if let Err(err) = self.spawn_instance(instance) {
                    error!(instance, %err, "spawning instance while scaling up");
                    self.fail(err);
                    return Err(RequestError::ShuttingDown);
                }
            }
        }

        // drain the extra upper indices
        let extra: Vec<usize> = self
            .instances
            .keys()
            .copied()
            .filter(|instance| *instance >= desired)
            .collect();
        for instance in extra {
            self.drain_instance(instance);
        }

        Ok(())
    }

    fn drain_instance(&mut self, instance: usize) {
        if self.draining.contains(&instance) {
            return;
        }
        let Some(record) = self.instances.get_mut(&instance) else {
            return;
        };
        debug!(instance, "draining instance");
        if let Some(probe) = record.probe.take() {
            let _ = probe.stop();
        }
        let terminator = ProcessTerminator::new(record.pid);
        if let Err(err) = terminator.signal(self.config.shutdown_signal.signal()) {
            warn!(instance, %err, "could not signal instance for draining");
        }
        self.draining.insert(instance);
        let deadline = self.stop_deadline(None);
        self.timers
            .push((Instant::now() + deadline, TimerAction::KillInstance(instance)));
    }

    fn initiate_stop(
        &mut self,
        reply: Option<EventPublisher<Result<(), StopError>>>,
        deadline: Duration,
    ) {
        self.transition(ProcessState::Stopping);
        self.stop_reply = reply;

        // no new spawns once stopping: drop pending respawns and cancel
        // in-flight probes so their outcomes are discarded
        self.timers
            .retain(|(_, action)| !matches!(action, TimerAction::Respawn(_)));
        self.restarting.clear();
        self.cancel_all_probes();

        if let Some(pre_stop) = self.config.hooks.pre_stop.clone() {
            if let Err(err) = run_hook(&self.name, &pre_stop) {
                warn!(process = %self.name, %err, "pre_stop hook failed");
            }
        }

        if self.instances.is_empty() {
            self.finish_stop();
            return;
        }

        let signal = self.config.shutdown_signal.signal();
        for (instance, record) in &self.instances {
            debug!(instance, pid = record.pid, "signalling child for shutdown");
            if let Err(err) = ProcessTerminator::new(record.pid).signal(signal) {
                warn!(instance, %err, "could not signal child");
            }
        }

        let deadline = self.stop_deadline(Some(deadline));
        self.timers
            .push((Instant::now() + deadline, TimerAction::StopDeadline));
    }

    fn finish_stop(&mut self) {
        if let Some(post_stop) = self.config.hooks.post_stop.clone() {
            if let Err(err) = run_hook(&self.name, &post_stop) {
                warn!(process = %self.name, %err, "post_stop hook failed");
            }
        }
        self.transition(ProcessState::Stopped);

        let result = if self.hard_killed {
            Err(StopError::HardKilled)
        } else {
            Ok(())
        };
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.publish(result);
        }
    }

    fn handle_child_exit(&mut self, exit: ChildExit) {
        let Some(record) = self.instances.remove(&exit.instance) else {
            return;
        };
        let uptime = record.started_at.elapsed();
        if let Some(probe) = record.probe {
            let _ = probe.stop();
        }
        // the instance is gone, so its pending kill is moot
        self.timers.retain(
            |(_, action)| !matches!(action, TimerAction::KillInstance(i) if *i == exit.instance),
        );

        info!(
            instance = exit.instance,
            exit = %exit.reason,
            uptime_ms = uptime.as_millis() as u64,
            "child exited"
        );
        self.publish(SupervisorEvent::InstanceExited {
            name: self.name.clone(),
            instance: exit.instance,
            exit: exit.reason,
        });

        if self.state == ProcessState::Stopping {
            if self.instances.is_empty() {
                self.finish_stop();
            }
            return;
        }

        if self.draining.remove(&exit.instance) {
            self.restart_policies.remove(&exit.instance);
            return;
        }

        let requested = self.restarting.remove(&exit.instance);
        let kind = self.config.restart;
        let backoff = self.config.restart_backoff;
        let restart_schedule = {
            let policy = self
                .restart_policies
                .entry(exit.instance)
                .or_insert_with(|| RestartPolicy::new(kind, backoff));
            (requested || policy.should_restart(&exit.reason, uptime))
                .then(|| policy.next_delay(uptime))
        };

        self.transition(ProcessState::Crashed);

        if let Some((attempt, delay)) = restart_schedule {
            info!(
                instance = exit.instance,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling restart"
            );
            self.publish(SupervisorEvent::RestartScheduled {
                name: self.name.clone(),
                instance: exit.instance,
                attempt,
                delay,
            });
            self.timers
                .push((Instant::now() + delay, TimerAction::Respawn(exit.instance)));
        } else if self.instances.is_empty() {
            self.transition(ProcessState::Stopped);
        } else {
            // other instances keep running; converge the desired count
            self.desired = self.instances.len();
            self.transition(ProcessState::Starting);
            self.transition(ProcessState::Running);
            if self.config.health_check.is_none() {
                self.become_healthy();
            }
        }
    }

    fn handle_probe_outcome(&mut self, outcome: ProbeOutcome) {
        // outcomes are only meaningful while the instance may be alive;
        // anything else is a stale in-flight probe
        if !matches!(
            self.state,
            ProcessState::Running | ProcessState::Healthy | ProcessState::Unhealthy
        ) {
            return;
        }
        let failure_threshold: usize = self
            .config
            .health_check
            .as_ref()
            .map(|h| h.failure_threshold.into())
            .unwrap_or(1);
        let success_threshold: usize = self
            .config
            .health_check
            .as_ref()
            .map(|h| h.success_threshold.into())
            .unwrap_or(1);

        let Some(record) = self.instances.get_mut(&outcome.instance) else {
            return;
        };

        if outcome.success {
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
            record.restart_issued = false;
            let successes = record.consecutive_successes;

            match self.state {
                ProcessState::Running => self.become_healthy(),
                ProcessState::Unhealthy if successes >= success_threshold => {
                    self.transition(ProcessState::Healthy);
                }
                _ => {}
            }
        } else {
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
            let failures = record.consecutive_failures;
            let issue_restart = failures >= failure_threshold && !record.restart_issued;
            if issue_restart {
                record.restart_issued = true;
            }

            trace!(
                instance = outcome.instance,
                failures,
                detail = outcome.detail.as_deref().unwrap_or_default(),
                "probe failed"
            );

            if failures >= failure_threshold {
                if self.state == ProcessState::Healthy {
                    self.transition(ProcessState::Unhealthy);
                }
                if issue_restart {
                    self.restart_instance(outcome.instance, RestartReason::HealthCheckFailed);
                }
            }
        }
    }

    fn handle_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.timers.retain(|(at, action)| {
            if *at <= now {
                due.push(match action {
                    TimerAction::Respawn(i) => TimerAction::Respawn(*i),
                    TimerAction::KillInstance(i) => TimerAction::KillInstance(*i),
                    TimerAction::StopDeadline => TimerAction::StopDeadline,
                });
                false
            } else {
                true
            }
        });

        for action in due {
            match action {
                TimerAction::Respawn(instance) => self.respawn(instance),
                TimerAction::KillInstance(instance) => {
                    if let Some(record) = self.instances.get(&instance) {
                        warn!(instance, "instance outlived its stop deadline; killing");
                        let _ = ProcessTerminator::new(record.pid).signal(Signal::SIGKILL);
                    }
                }
                TimerAction::StopDeadline => {
                    if self.state == ProcessState::Stopping && !self.instances.is_empty() {
                        warn!(
                            remaining = self.instances.len(),
                            "stop deadline expired; killing remaining children"
                        );
                        self.hard_killed = true;
                        self.kill_all_children();
                    }
                }
            }
        }
    }

    fn respawn(&mut self, instance: usize) {
        if self.state == ProcessState::Stopping || self.state.is_terminal() {
            return;
        }
        if instance >= self.desired {
            debug!(instance, "skipping respawn beyond the desired scale");
            return;
        }

        self.transition(ProcessState::Starting);
        match self.spawn_instance(instance) {
            Ok(()) => {
                self.transition(ProcessState::Running);
                if self.config.health_check.is_none() {
                    self.become_healthy();
                }
            }
            Err(err) => {
                error!(instance, %err, "respawn failed");
                self.fail(err);
            }
        }
    }

    fn spawn_instance(&mut self, instance: usize) -> Result<(), StartError> {
        let data = ExecutableData::from_argv(&self.config.command)
            .with_env(
                self.config
                    .environment
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            )
            .with_env(
                self.extra_env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            )
            .with_env([
                (ENV_PROCESS_NAME.to_string(), self.name.get()),
                (ENV_INSTANCE.to_string(), instance.to_string()),
            ])
            .with_working_dir(self.config.working_dir.clone());

        let child = NotStartedChild::new(self.name.clone(), instance, &data)
            .start()
            .map_err(|err| StartError::Spawn(err.to_string()))?
            .stream(&self.output_ring)
            .map_err(|err| StartError::Spawn(err.to_string()))?;

        let pid = child.pid();
        info!(instance, pid, "child started");
        self.publish(SupervisorEvent::InstanceStarted {
            name: self.name.clone(),
            instance,
            pid,
        });

        let exit_publisher = self.exit_publisher.clone();
        let waiter_name = process_thread_name("wait", &self.name, Some(instance));
        spawn_named_thread(waiter_name, move || {
            let reason = child
                .wait()
                .map(ExitReason::from_exit_status)
                .unwrap_or(ExitReason::Exited { code: -1 });
            let _ = exit_publisher.publish(ChildExit { instance, reason });
        });

        let probe = self.config.health_check.as_ref().and_then(|health_check| {
            match ProbeChecker::try_new(health_check) {
                Ok(checker) => Some(spawn_instance_probe(
                    self.name.clone(),
                    instance,
                    checker,
                    Duration::from(health_check.interval),
                    Duration::from(health_check.start_period),
                    self.probe_publisher.clone(),
                    self.probe_consumer.clone(),
                )),
                Err(err) => {
                    warn!(instance, %err, "could not build the health checker");
                    None
                }
            }
        });

        self.instances.insert(
            instance,
            Instance {
                pid,
                started_at: Instant::now(),
                probe,
                consecutive_failures: 0,
                consecutive_successes: 0,
                restart_issued: false,
            },
        );
        self.restart_policies
            .entry(instance)
            .or_insert_with(|| RestartPolicy::new(self.config.restart, self.config.restart_backoff));

        Ok(())
    }

    /// A spawn failure after boot is fatal to this supervisor.
    fn fail(&mut self, err: StartError) {
        self.kill_all_children();
        self.transition(ProcessState::Failed);
        let _ = self.ready_publisher.try_publish(Err(err));
    }

    fn kill_all_children(&mut self) {
        for record in self.instances.values_mut() {
            if let Some(probe) = record.probe.take() {
                let _ = probe.stop();
            }
            let _ = ProcessTerminator::new(record.pid).signal(Signal::SIGKILL);
        }
    }

    fn cancel_all_probes(&mut self) {
        for record in self.instances.values_mut() {
            if let Some(probe) = record.probe.take() {
                let _ = probe.stop();
            }
        }
    }

    fn become_healthy(&mut self) {
        self.transition(ProcessState::Healthy);
        let _ = self.ready_publisher.try_publish(Ok(()));
    }

    fn stop_deadline(&self, requested: Option<Duration>) -> Duration {
        self.config
            .shutdown_timeout
            .or(requested)
            .unwrap_or(self.default_shutdown_timeout)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(at, _)| *at).min()
    }

    /// Applies a state transition if it is an edge of the state machine;
    /// anything else is a stale event and ignored.
    fn transition(&mut self, to: ProcessState) {
        if self.state == to {
            return;
        }
        if !valid_transition(self.state, to) {
            trace!(from = %self.state, to = %to, "ignoring out-of-order transition");
            return;
        }
        debug!(from = %self.state, to = %to, "state transition");
        self.state = to;
        self.publish_state();
    }

    fn publish_state(&self) {
        self.publish(SupervisorEvent::StateChanged {
            name: self.name.clone(),
            state: self.state,
        });
    }

    fn publish(&self, event: SupervisorEvent) {
        let _ = self.event_publisher.publish(event);
    }
}
