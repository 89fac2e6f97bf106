use super::health::HealthCheckConfig;
use super::process_name::ProcessName;
use duration_str::deserialize_duration;
use indexmap::IndexMap;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use wrapper_with_default::WrapperWithDefault;

const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// A single process declaration as found under the `processes` mapping.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Declarations with `enabled: false` are kept in the document but never
    /// supervised.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Argv form; the first element is the executable.
    pub command: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Ordered so rendered child environments are deterministic.
    #[serde(default)]
    pub environment: IndexMap<String, String>,

    #[serde(default)]
    pub restart: RestartPolicyKind,

    #[serde(default)]
    pub restart_backoff: BackoffConfig,

    #[serde(default)]
    pub depends_on: Vec<ProcessName>,

    #[serde(default = "default_scale")]
    pub scale: usize,

    /// Upper bound for dynamic scaling. Defaults to `scale` when absent.
    #[serde(default)]
    pub max_scale: Option<usize>,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub hooks: HooksConfig,

    #[serde(default)]
    pub shutdown_signal: ShutdownSignal,

    /// Overrides the global shutdown deadline for this process.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub shutdown_timeout: Option<Duration>,
}

fn default_enabled() -> bool {
    true
}

fn default_scale() -> usize {
    1
}

impl ProcessConfig {
    pub fn max_scale(&self) -> usize {
        self.max_scale.unwrap_or(self.scale).max(self.scale)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// Exponential backoff parameters for restart attempts.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

/// Lifecycle hooks. Each runs to completion with its own timeout; `pre_start`
/// must succeed for the process to start.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct HooksConfig {
    #[serde(default)]
    pub pre_start: Option<HookConfig>,
    #[serde(default)]
    pub post_start: Option<HookConfig>,
    #[serde(default)]
    pub pre_stop: Option<HookConfig>,
    #[serde(default)]
    pub post_stop: Option<HookConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HookConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout: HookTimeout,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_HOOK_TIMEOUT)]
pub struct HookTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Error, Debug, PartialEq)]
#[error("unknown signal name `{0}`")]
pub struct ShutdownSignalError(String);

/// The signal sent to children on graceful stop. Defaults to SIGTERM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShutdownSignal(Signal);

impl ShutdownSignal {
    pub fn signal(&self) -> Signal {
        self.0
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self(Signal::SIGTERM)
    }
}

impl TryFrom<String> for ShutdownSignal {
    type Error = ShutdownSignalError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Signal::from_str(&s)
            .map(Self)
            .map_err(|_| ShutdownSignalError(s))
    }
}

impl From<ShutdownSignal> for String {
    fn from(value: ShutdownSignal) -> Self {
        value.0.as_str().to_string()
    }
}

pub(crate) fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_duration")] Duration);

    Option::<Wrapper>::deserialize(deserializer).map(|opt| opt.map(|w| w.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_defaults() {
        let config: ProcessConfig = serde_yaml::from_str(
            r#"
command: ["/usr/sbin/nginx", "-g", "daemon off;"]
"#,
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.restart, RestartPolicyKind::Always);
        assert_eq!(config.scale, 1);
        assert_eq!(config.max_scale(), 1);
        assert_eq!(config.shutdown_signal.signal(), Signal::SIGTERM);
        assert!(config.shutdown_timeout.is_none());
        assert!(config.health_check.is_none());
        assert_eq!(config.restart_backoff.initial, Duration::from_secs(1));
        assert_eq!(config.restart_backoff.max, Duration::from_secs(30));
    }

    #[test]
    fn full_declaration() {
        let config: ProcessConfig = serde_yaml::from_str(
            r#"
command: ["/usr/bin/php-fpm", "--nodaemonize"]
working_dir: /srv/app
environment:
  APP_ENV: production
restart: on-failure
restart_backoff:
  initial: 100ms
  max: 1s
  multiplier: 2.0
depends_on: [redis]
scale: 2
max_scale: 8
shutdown_signal: SIGQUIT
shutdown_timeout: 20s
hooks:
  pre_start:
    command: ["/usr/local/bin/migrate"]
    timeout: 2m
"#,
        )
        .unwrap();

        assert_eq!(config.restart, RestartPolicyKind::OnFailure);
        assert_eq!(config.restart_backoff.initial, Duration::from_millis(100));
        assert_eq!(config.restart_backoff.max, Duration::from_secs(1));
        assert_eq!(config.depends_on, vec![ProcessName::must("redis")]);
        assert_eq!(config.scale, 2);
        assert_eq!(config.max_scale(), 8);
        assert_eq!(config.shutdown_signal.signal(), Signal::SIGQUIT);
        assert_eq!(config.shutdown_timeout, Some(Duration::from_secs(20)));

        let pre_start = config.hooks.pre_start.unwrap();
        assert_eq!(pre_start.command, vec!["/usr/local/bin/migrate"]);
        assert_eq!(Duration::from(pre_start.timeout), Duration::from_secs(120));
    }

    #[test]
    fn max_scale_never_shrinks_below_scale() {
        let config: ProcessConfig = serde_yaml::from_str(
            r#"
command: ["/bin/worker"]
scale: 4
max_scale: 2
"#,
        )
        .unwrap();
        assert_eq!(config.max_scale(), 4);
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let result: Result<ProcessConfig, _> = serde_yaml::from_str(
            r#"
command: ["/bin/worker"]
shutdown_signal: SIGBOGUS
"#,
        );
        assert!(result.is_err());
    }
}
