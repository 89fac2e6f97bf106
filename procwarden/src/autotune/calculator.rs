use super::limits::ResourceLimits;
use super::profile::Profile;
use crate::config::ProfileName;
use std::fmt::Display;
use tracing::{info, warn};

/// How the worker pool is managed: a fixed set of workers, or a pool growing
/// and shrinking between the spare bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Static,
    Dynamic,
}

impl Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMode::Static => f.write_str("static"),
            PoolMode::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// The calculator output. Exported into child environments under the
/// `PROCWARDEN_POOL_*` names; warnings never abort the boot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WorkerPoolPlan {
    pub profile: ProfileName,
    pub mode: PoolMode,
    pub max_children: usize,
    pub start_servers: usize,
    pub min_spare: usize,
    pub max_spare: usize,
    pub max_requests: u32,
    pub warnings: Vec<String>,
}

impl WorkerPoolPlan {
    /// The agreed variable names consumed by worker runtimes.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            (super::ENV_POOL_MODE.to_string(), self.mode.to_string()),
            (
                super::ENV_POOL_MAX_CHILDREN.to_string(),
                self.max_children.to_string(),
            ),
            (
                super::ENV_POOL_START_SERVERS.to_string(),
                self.start_servers.to_string(),
            ),
            (
                super::ENV_POOL_MIN_SPARE.to_string(),
                self.min_spare.to_string(),
            ),
            (
                super::ENV_POOL_MAX_SPARE.to_string(),
                self.max_spare.to_string(),
            ),
            (
                super::ENV_POOL_MAX_REQUESTS.to_string(),
                self.max_requests.to_string(),
            ),
        ]
    }
}

/// Derives the pool sizing for `profile` from the detected limits.
///
/// The memory threshold precedence is resolved by the caller (CLI override,
/// then environment, then configuration); `threshold_override` is that
/// resolved value, falling back to the profile default here.
pub fn calculate(
    profile_name: ProfileName,
    limits: &ResourceLimits,
    threshold_override: Option<f64>,
) -> WorkerPoolPlan {
    let profile = Profile::for_name(profile_name);
    let threshold = threshold_override.unwrap_or(profile.memory_threshold);
    let total = limits.memory_bytes as f64;

    let mut warnings = Vec::new();
    if threshold > 1.0 {
        warnings.push(format!(
            "memory threshold {threshold} exceeds 1.0; the pool may overcommit"
        ));
    }

    let usable = (total * threshold) - profile.reserved() as f64;
    let fit = if usable > 0.0 {
        (usable / profile.per_worker_rss as f64).floor() as usize
    } else {
        0
    };
    let max_children = fit.clamp(1, profile.max_children_cap);

    if max_children < 2 {
        warnings.push(format!(
            "memory budget only fits {max_children} worker; consider a smaller profile"
        ));
    }
    let projected = profile.per_worker_rss.saturating_mul(max_children as u64) as f64;
    if projected > total * 0.9 {
        warnings.push(format!(
            "projected worker memory ({:.0} MiB) exceeds 90% of the limit ({:.0} MiB)",
            projected / (1024.0 * 1024.0),
            total / (1024.0 * 1024.0),
        ));
    }

    let mode = match profile_name {
        ProfileName::Dev => PoolMode::Static,
        _ => PoolMode::Dynamic,
    };

    let start_servers = (max_children / 4).max(1);
    let min_spare = (max_children / 4).max(1);
    let max_spare = (max_children * 3 / 4).max(min_spare);

    let plan = WorkerPoolPlan {
        profile: profile_name,
        mode,
        max_children,
        start_servers,
        min_spare,
        max_spare,
        max_requests: profile.max_requests,
        warnings,
    };

    info!(
        profile = ?profile_name,
        mode = %plan.mode,
        max_children = plan.max_children,
        cpu_quota = limits.cpu_quota,
        "derived worker pool sizing"
    );
    for warning in &plan.warnings {
        warn!("{warning}");
    }

    plan
}
