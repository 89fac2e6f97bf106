//! Health probing for supervised instances.
//!
//! Probe variants share a single checking contract; the per-instance probe
//! loop delivers tagged outcomes to the owning supervisor over a bounded
//! channel where the freshest outcome wins.

pub mod exec;
pub mod http;
pub mod tcp;

use crate::config::health::{HealthCheckConfig, ProbeConfig};
use crate::config::process_name::ProcessName;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::utils::thread_context::{CancellationMessage, NotStartedThreadContext, StartedThreadContext};
use crate::utils::threads::process_thread_name;
use exec::ExecHealthChecker;
use http::HttpHealthChecker;
use std::time::{Duration, Instant};
use tcp::TcpHealthChecker;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum HealthCheckerError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe rejected: {0}")]
    Rejected(String),

    #[error("probe command failed: {0}")]
    Exec(String),
}

/// A type that implements a health checking mechanism. A probe run succeeds
/// exactly when `check_health` returns Ok.
pub trait HealthChecker {
    fn check_health(&self) -> Result<(), HealthCheckerError>;
}

/// The tagged probe variant behind the shared contract.
pub enum ProbeChecker {
    Tcp(TcpHealthChecker),
    Http(HttpHealthChecker),
    Exec(ExecHealthChecker),
}

impl ProbeChecker {
    pub fn try_new(config: &HealthCheckConfig) -> Result<Self, HealthCheckerError> {
        let timeout = Duration::from(config.timeout);
        match &config.probe {
            ProbeConfig::Tcp(tcp) => Ok(ProbeChecker::Tcp(TcpHealthChecker::new(tcp, timeout))),
            ProbeConfig::Http(http) => {
                Ok(ProbeChecker::Http(HttpHealthChecker::try_new(http, timeout)?))
            }
            ProbeConfig::Exec(exec) => Ok(ProbeChecker::Exec(ExecHealthChecker::new(exec, timeout))),
        }
    }
}

impl HealthChecker for ProbeChecker {
    fn check_health(&self) -> Result<(), HealthCheckerError> {
        match self {
            ProbeChecker::Tcp(checker) => checker.check_health(),
            ProbeChecker::Http(checker) => checker.check_health(),
            ProbeChecker::Exec(checker) => checker.check_health(),
        }
    }
}

/// One probe run, as observed by the owning supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub instance: usize,
    pub success: bool,
    pub duration: Duration,
    pub detail: Option<String>,
}

/// Spawns the probe loop for one instance.
///
/// The loop probes at `interval` until cancelled. Failures within
/// `start_period` of the instance start are not delivered; successes always
/// are. Delivery displaces the oldest undelivered outcome when the channel is
/// full, so the supervisor always observes the freshest result.
#[allow(clippy::too_many_arguments)]
pub fn spawn_instance_probe<H>(
    name: ProcessName,
    instance: usize,
    checker: H,
    interval: Duration,
    start_period: Duration,
    outcome_publisher: EventPublisher<ProbeOutcome>,
    outcome_consumer: EventConsumer<ProbeOutcome>,
) -> StartedThreadContext
where
    H: HealthChecker + Send + 'static,
{
    let thread_name = process_thread_name("probe", &name, Some(instance));
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| {
        let instance_started = Instant::now();

        loop {
            let probe_started = Instant::now();
            let result = checker.check_health();
            let duration = probe_started.elapsed();

            match result {
                Ok(()) => {
                    trace!(process = %name, instance, "probe succeeded");
                    let _ = outcome_publisher.publish_latest(
                        &outcome_consumer,
                        ProbeOutcome {
                            instance,
                            success: true,
                            duration,
                            detail: None,
                        },
                    );
                }
                Err(err) => {
                    if instance_started.elapsed() < start_period {
                        debug!(process = %name, instance, %err, "probe failed within the start period");
                    } else {
                        let _ = outcome_publisher.publish_latest(
                            &outcome_consumer,
                            ProbeOutcome {
                                instance,
                                success: false,
                                duration,
                                detail: Some(err.to_string()),
                            },
                        );
                    }
                }
            }

            if stop_consumer.is_cancelled(interval) {
                break;
            }
        }
    };
    NotStartedThreadContext::new(thread_name, callback).start()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::channel::pub_sub_latest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) struct ScriptedChecker {
        outcomes: Vec<bool>,
        position: AtomicUsize,
    }

    impl ScriptedChecker {
        pub(crate) fn new(outcomes: Vec<bool>) -> Self {
            Self {
                outcomes,
                position: AtomicUsize::new(0),
            }
        }
    }

    impl HealthChecker for ScriptedChecker {
        fn check_health(&self) -> Result<(), HealthCheckerError> {
            let position = self.position.fetch_add(1, Ordering::SeqCst);
            let success = *self
                .outcomes
                .get(position)
                .or(self.outcomes.last())
                .unwrap_or(&true);
            if success {
                Ok(())
            } else {
                Err(HealthCheckerError::Rejected("scripted failure".to_string()))
            }
        }
    }

    impl HealthChecker for Arc<ScriptedChecker> {
        fn check_health(&self) -> Result<(), HealthCheckerError> {
            self.as_ref().check_health()
        }
    }

    #[test]
    fn probe_loop_delivers_tagged_outcomes() {
        let (publisher, consumer) = pub_sub_latest(16);

        let probe = spawn_instance_probe(
            ProcessName::must("probed"),
            3,
            ScriptedChecker::new(vec![true, false]),
            Duration::from_millis(10),
            Duration::ZERO,
            publisher,
            consumer.clone(),
        );

        let first = consumer.as_ref().recv().unwrap();
        assert_eq!(first.instance, 3);
        assert!(first.success);
        assert!(first.detail.is_none());

        let second = consumer.as_ref().recv().unwrap();
        assert!(!second.success);
        assert!(second.detail.is_some());

        probe.stop_blocking().unwrap();
    }

    #[test]
    fn failures_within_start_period_are_suppressed() {
        let (publisher, consumer) = pub_sub_latest(16);

        let probe = spawn_instance_probe(
            ProcessName::must("probed"),
            0,
            ScriptedChecker::new(vec![false, false, true]),
            Duration::from_millis(10),
            Duration::from_secs(60),
            publisher,
            consumer.clone(),
        );

        // the first delivered outcome is the success; earlier failures fell
        // inside the start period
        let delivered = consumer.as_ref().recv().unwrap();
        assert!(delivered.success);

        probe.stop_blocking().unwrap();
    }

    #[test]
    fn freshest_outcome_displaces_backlog() {
        let (publisher, consumer) = pub_sub_latest(1);

        let probe = spawn_instance_probe(
            ProcessName::must("probed"),
            0,
            ScriptedChecker::new(vec![true]),
            Duration::from_millis(1),
            Duration::ZERO,
            publisher,
            consumer.clone(),
        );

        // let several outcomes pile into a capacity-1 channel
        std::thread::sleep(Duration::from_millis(100));
        probe.stop_blocking().unwrap();

        let mut delivered = 0;
        while consumer.as_ref().try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 1);
    }
}
