use super::{HealthChecker, HealthCheckerError};
use crate::config::health::ExecProbeConfig;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Succeeds when the configured command exits with code 0 within the
/// timeout. On timeout the probe child is killed.
pub struct ExecHealthChecker {
    command: Vec<String>,
    timeout: Duration,
}

impl ExecHealthChecker {
    pub fn new(config: &ExecProbeConfig, timeout: Duration) -> Self {
        Self {
            command: config.command.clone(),
            timeout,
        }
    }
}

impl HealthChecker for ExecHealthChecker {
    fn check_health(&self) -> Result<(), HealthCheckerError> {
        let (bin, args) = self
            .command
            .split_first()
            .ok_or_else(|| HealthCheckerError::Exec("empty probe command".to_string()))?;

        let mut child = Command::new(bin)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| HealthCheckerError::Exec(err.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return match status.code() {
                        Some(0) => Ok(()),
                        Some(code) => Err(HealthCheckerError::Exec(format!(
                            "probe exited with status {code}"
                        ))),
                        None => Err(HealthCheckerError::Exec(
                            "probe was killed by a signal".to_string(),
                        )),
                    };
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(HealthCheckerError::Timeout(self.timeout));
                    }
                    std::thread::sleep(EXEC_POLL_INTERVAL);
                }
                Err(err) => return Err(HealthCheckerError::Exec(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn checker(script: &str, timeout: Duration) -> ExecHealthChecker {
        ExecHealthChecker::new(
            &ExecProbeConfig {
                command: vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                ],
            },
            timeout,
        )
    }

    #[test]
    fn zero_exit_is_healthy() {
        assert!(checker("exit 0", Duration::from_secs(2)).check_health().is_ok());
    }

    #[test]
    fn nonzero_exit_is_unhealthy() {
        assert_matches!(
            checker("exit 1", Duration::from_secs(2)).check_health(),
            Err(HealthCheckerError::Exec(_))
        );
    }

    #[test]
    fn slow_probe_times_out() {
        let started = Instant::now();
        assert_matches!(
            checker("sleep 10", Duration::from_millis(200)).check_health(),
            Err(HealthCheckerError::Timeout(_))
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
