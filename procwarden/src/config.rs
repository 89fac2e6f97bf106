pub mod env_expand;
pub mod fingerprint;
pub mod health;
pub mod process;
pub mod process_name;

use crate::config::env_expand::{expand_env_vars, EnvExpandError};
use crate::config::process::ProcessConfig;
use crate::config::process_name::ProcessName;
use duration_str::deserialize_duration;
use fs::file::reader::FileReader;
use fs::LocalFile;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use wrapper_with_default::WrapperWithDefault;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading configuration: {0}")]
    Io(#[from] io::Error),

    #[error("expanding environment references: {0}")]
    EnvExpand(#[from] EnvExpandError),

    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown configuration keys: {0}")]
    UnknownKeys(String),

    #[error("process `{0}`: command must not be empty")]
    EmptyCommand(ProcessName),

    #[error("process `{name}`: max_scale {max_scale} is lower than scale {scale}")]
    InvalidScale {
        name: ProcessName,
        scale: usize,
        max_scale: usize,
    },

    #[error("process `{name}`: depends on unknown or disabled process `{dependency}`")]
    UnknownDependency {
        name: ProcessName,
        dependency: ProcessName,
    },

    #[error("process `{0}` depends on itself")]
    SelfDependency(ProcessName),

    #[error("task `{name}`: invalid cron expression: {reason}")]
    InvalidSchedule { name: ProcessName, reason: String },

    #[error("task `{0}`: command must not be empty")]
    EmptyTaskCommand(ProcessName),
}

/// The whole declarative document: a version tag, the global section, the
/// supervised process declarations and the scheduled tasks. Immutable per
/// load; reload produces a fresh instance.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FleetConfig {
    pub version: String,

    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub processes: IndexMap<ProcessName, ProcessConfig>,

    #[serde(default)]
    pub tasks: IndexMap<ProcessName, TaskConfig>,
}

impl FleetConfig {
    /// Declarations that are actually supervised, in declaration order.
    pub fn enabled_processes(&self) -> impl Iterator<Item = (&ProcessName, &ProcessConfig)> {
        self.processes.iter().filter(|(_, config)| config.enabled)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, process) in self.enabled_processes() {
            if process.command.is_empty() || process.command[0].is_empty() {
                return Err(ConfigError::EmptyCommand(name.clone()));
            }
            if let Some(max_scale) = process.max_scale {
                if max_scale < process.scale {
                    return Err(ConfigError::InvalidScale {
                        name: name.clone(),
                        scale: process.scale,
                        max_scale,
                    });
                }
            }
            for dependency in &process.depends_on {
                if dependency == name {
                    return Err(ConfigError::SelfDependency(name.clone()));
                }
                let known = self
                    .processes
                    .get(dependency)
                    .map(|d| d.enabled)
                    .unwrap_or(false);
                if !known {
                    return Err(ConfigError::UnknownDependency {
                        name: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        for (name, task) in &self.tasks {
            if task.command.is_empty() {
                return Err(ConfigError::EmptyTaskCommand(name.clone()));
            }
            task.parsed_schedule()
                .map_err(|err| ConfigError::InvalidSchedule {
                    name: name.clone(),
                    reason: err.to_string(),
                })?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct GlobalConfig {
    /// Fleet-wide graceful shutdown deadline, shared across the reverse
    /// topological stop waves.
    #[serde(default)]
    pub shutdown_timeout: ShutdownTimeout,

    #[serde(default)]
    pub log: LoggingConfig,

    #[serde(default)]
    pub reap_interval: ReapInterval,

    /// Fraction of total memory the worker pool may use; overrides the
    /// autotune profile default when set.
    #[serde(default)]
    pub memory_threshold: Option<f64>,

    #[serde(default)]
    pub autotune: Option<AutotuneSection>,

    /// Bind address of the management API; the API stays off when unset.
    #[serde(default)]
    pub api_addr: Option<String>,

    /// Bind address handed to the external metrics collaborator; the core
    /// only carries it.
    #[serde(default)]
    pub metrics_addr: Option<String>,

    /// Toggle handed to the external audit-log collaborator.
    #[serde(default)]
    pub audit: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_SHUTDOWN_TIMEOUT)]
pub struct ShutdownTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_REAP_INTERVAL)]
pub struct ReapInterval(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AutotuneSection {
    pub profile: ProfileName,
}

/// Named sizing profile consumed by the autotune calculator.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Dev,
    #[default]
    Light,
    Medium,
    Heavy,
    Bursty,
}

impl FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(ProfileName::Dev),
            "light" => Ok(ProfileName::Light),
            "medium" => Ok(ProfileName::Medium),
            "heavy" => Ok(ProfileName::Heavy),
            "bursty" => Ok(ProfileName::Bursty),
            other => Err(format!("unknown profile `{other}`")),
        }
    }
}

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// A cron-style periodic task. Each firing runs a one-shot child.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TaskConfig {
    /// Cron expression with minute resolution.
    pub schedule: String,

    pub command: Vec<String>,

    #[serde(default)]
    pub timeout: TaskTimeout,

    #[serde(default)]
    pub environment: IndexMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl TaskConfig {
    /// Parses the cron expression. Classic five-field expressions are
    /// accepted by pinning the seconds field to zero, which also gives every
    /// task minute resolution.
    pub fn parsed_schedule(&self) -> Result<cron::Schedule, cron::error::Error> {
        let expression = self.schedule.trim();
        if expression.split_whitespace().count() == 5 {
            cron::Schedule::from_str(&format!("0 {expression}"))
        } else {
            cron::Schedule::from_str(expression)
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_TASK_TIMEOUT)]
pub struct TaskTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

/// Loads and validates the declarative document.
///
/// In strict mode unknown keys reject the document; otherwise they are
/// surfaced as warnings and dropped.
pub struct ConfigLoader<F = LocalFile> {
    file_reader: F,
    strict: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            file_reader: LocalFile,
            strict: false,
        }
    }
}

impl ConfigLoader {
    pub fn new(strict: bool) -> Self {
        Self {
            file_reader: LocalFile,
            strict,
        }
    }
}

impl<F: FileReader> ConfigLoader<F> {
    pub fn with_file_reader(file_reader: F, strict: bool) -> Self {
        Self {
            file_reader,
            strict,
        }
    }

    pub fn load(&self, path: &Path) -> Result<FleetConfig, ConfigError> {
        let raw = self.file_reader.read(path)?;
        self.load_from_str(&raw)
    }

    pub fn load_from_str(&self, raw: &str) -> Result<FleetConfig, ConfigError> {
        let expanded = expand_env_vars(raw)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&expanded)?;

        let unknown = unknown_keys(&value);
        if !unknown.is_empty() {
            if self.strict {
                return Err(ConfigError::UnknownKeys(unknown.join(", ")));
            }
            for key in &unknown {
                warn!(key, "ignoring unknown configuration key");
            }
        }

        let config: FleetConfig = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

fn known(keys: &[&str], mapping: &serde_yaml::Value, prefix: &str, unknown: &mut Vec<String>) {
    if let serde_yaml::Value::Mapping(mapping) = mapping {
        for key in mapping.keys() {
            if let serde_yaml::Value::String(key) = key {
                if !keys.contains(&key.as_str()) {
                    unknown.push(format!("{prefix}{key}"));
                }
            }
        }
    }
}

/// Collects dotted paths of keys the document model does not recognize.
fn unknown_keys(value: &serde_yaml::Value) -> Vec<String> {
    let mut unknown = Vec::new();

    known(&["version", "global", "processes", "tasks"], value, "", &mut unknown);

    if let Some(global) = value.get("global") {
        known(
            &[
                "shutdown_timeout",
                "log",
                "reap_interval",
                "memory_threshold",
                "autotune",
                "api_addr",
                "metrics_addr",
                "audit",
            ],
            global,
            "global.",
            &mut unknown,
        );
        if let Some(log) = global.get("log") {
            known(&["level", "format"], log, "global.log.", &mut unknown);
        }
        if let Some(autotune) = global.get("autotune") {
            known(&["profile"], autotune, "global.autotune.", &mut unknown);
        }
    }

    if let Some(serde_yaml::Value::Mapping(processes)) = value.get("processes") {
        for (name, process) in processes {
            let name = name.as_str().unwrap_or_default();
            let prefix = format!("processes.{name}.");
            known(
                &[
                    "enabled",
                    "command",
                    "working_dir",
                    "environment",
                    "restart",
                    "restart_backoff",
                    "depends_on",
                    "scale",
                    "max_scale",
                    "health_check",
                    "hooks",
                    "shutdown_signal",
                    "shutdown_timeout",
                ],
                process,
                &prefix,
                &mut unknown,
            );
            if let Some(backoff) = process.get("restart_backoff") {
                known(
                    &["initial", "max", "multiplier"],
                    backoff,
                    &format!("{prefix}restart_backoff."),
                    &mut unknown,
                );
            }
            if let Some(health) = process.get("health_check") {
                known(
                    &[
                        "interval",
                        "timeout",
                        "failure_threshold",
                        "success_threshold",
                        "start_period",
                        "tcp",
                        "http",
                        "exec",
                    ],
                    health,
                    &format!("{prefix}health_check."),
                    &mut unknown,
                );
            }
            if let Some(hooks) = process.get("hooks") {
                known(
                    &["pre_start", "post_start", "pre_stop", "post_stop"],
                    hooks,
                    &format!("{prefix}hooks."),
                    &mut unknown,
                );
            }
        }
    }

    if let Some(serde_yaml::Value::Mapping(tasks)) = value.get("tasks") {
        for (name, task) in tasks {
            let name = name.as_str().unwrap_or_default();
            known(
                &["schedule", "command", "timeout", "environment", "working_dir"],
                task,
                &format!("tasks.{name}."),
                &mut unknown,
            );
        }
    }

    unknown
}
