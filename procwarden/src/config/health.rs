use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use wrapper_with_default::WrapperWithDefault;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_START_PERIOD: Duration = Duration::ZERO;
const DEFAULT_FAILURE_THRESHOLD: usize = 3;
const DEFAULT_SUCCESS_THRESHOLD: usize = 1;

/// Health-check declaration for a process: the shared probe schedule plus the
/// probe variant.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// The duration to wait between probe runs.
    #[serde(default)]
    pub interval: ProbeInterval,

    /// The maximum duration a probe may run before it counts as failed.
    #[serde(default)]
    pub timeout: ProbeTimeout,

    /// Consecutive failures required to consider an instance unhealthy.
    #[serde(default)]
    pub failure_threshold: FailureThreshold,

    /// Consecutive successes required to consider an instance healthy again.
    #[serde(default)]
    pub success_threshold: SuccessThreshold,

    /// Grace window after instance start during which failures do not count.
    #[serde(default)]
    pub start_period: StartPeriod,

    #[serde(flatten)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_PROBE_INTERVAL)]
pub struct ProbeInterval(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_PROBE_TIMEOUT)]
pub struct ProbeTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_START_PERIOD)]
pub struct StartPeriod(#[serde(deserialize_with = "deserialize_duration")] Duration);

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_FAILURE_THRESHOLD)]
pub struct FailureThreshold(usize);

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, WrapperWithDefault)]
#[wrapper_default_value(DEFAULT_SUCCESS_THRESHOLD)]
pub struct SuccessThreshold(usize);

/// The probe variants. All variants share the schedule of
/// [`HealthCheckConfig`].
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeConfig {
    Tcp(TcpProbeConfig),
    Http(HttpProbeConfig),
    Exec(ExecProbeConfig),
}

/// Succeeds when a TCP connection to `host:port` can be established within
/// the probe timeout.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TcpProbeConfig {
    #[serde(default = "default_probe_host")]
    pub host: String,
    pub port: u16,
}

/// Succeeds when a GET request returns a status in the acceptance set
/// (2xx/3xx when `healthy_status_codes` is empty).
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HttpProbeConfig {
    #[serde(default = "default_probe_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub healthy_status_codes: Vec<u16>,
}

/// Succeeds when the command exits with code 0 within the probe timeout.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExecProbeConfig {
    pub command: Vec<String>,
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_path() -> String {
    "/".to_string()
}
