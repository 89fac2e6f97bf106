use crate::config::process::HookConfig;
use crate::config::process_name::ProcessName;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const HOOK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, PartialEq)]
pub enum HookError {
    #[error("could not spawn hook command: {0}")]
    Spawn(String),

    #[error("hook exited with status {0}")]
    NonZero(i32),

    #[error("hook was killed by a signal")]
    Signaled,

    #[error("hook did not finish within {0:?} and was killed")]
    Timeout(Duration),
}

/// Runs a lifecycle hook to completion, bounded by the hook's timeout. On
/// timeout the hook child is killed and an error returned; the caller decides
/// whether that is fatal.
pub fn run_hook(name: &ProcessName, hook: &HookConfig) -> Result<(), HookError> {
    let timeout = Duration::from(hook.timeout);
    let (bin, args) = hook
        .command
        .split_first()
        .ok_or_else(|| HookError::Spawn("empty hook command".to_string()))?;

    debug!(process = %name, command = %bin, "running lifecycle hook");

    let mut child = Command::new(bin)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| HookError::Spawn(err.to_string()))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return match status.code() {
                    Some(0) => Ok(()),
                    Some(code) => Err(HookError::NonZero(code)),
                    None => Err(HookError::Signaled),
                };
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(HookError::Timeout(timeout));
                }
                std::thread::sleep(HOOK_POLL_INTERVAL);
            }
            Err(err) => return Err(HookError::Spawn(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn hook(script: &str, timeout: &str) -> HookConfig {
        serde_yaml::from_str(&format!(
            "command: [\"/bin/sh\", \"-c\", \"{script}\"]\ntimeout: {timeout}"
        ))
        .unwrap()
    }

    #[test]
    fn successful_hook() {
        let name = ProcessName::must("hooked");
        assert!(run_hook(&name, &hook("exit 0", "5s")).is_ok());
    }

    #[test]
    fn failing_hook_reports_its_code() {
        let name = ProcessName::must("hooked");
        assert_eq!(
            run_hook(&name, &hook("exit 3", "5s")),
            Err(HookError::NonZero(3))
        );
    }

    #[test]
    fn hook_exceeding_its_timeout_is_killed() {
        let name = ProcessName::must("hooked");
        let started = Instant::now();
        assert_matches!(
            run_hook(&name, &hook("sleep 10", "200ms")),
            Err(HookError::Timeout(_))
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let name = ProcessName::must("hooked");
        let config = HookConfig {
            command: vec!["/does/not/exist".to_string()],
            timeout: Duration::from_secs(1).into(),
        };
        assert_matches!(run_hook(&name, &config), Err(HookError::Spawn(_)));
    }
}
