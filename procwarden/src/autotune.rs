//! Worker-pool sizing derived from container resource limits.
//!
//! A named profile fixes the reserved overheads and the per-worker memory
//! estimate; the calculator combines them with the detected memory limit and
//! an optional threshold override into concrete pool parameters. The result
//! is exported into child environments; the calculator never mutates the
//! configuration document.

pub mod calculator;
pub mod limits;
pub mod profile;

pub use calculator::{calculate, PoolMode, WorkerPoolPlan};
pub use limits::{LimitsDetector, ResourceLimits};
pub use profile::Profile;

/// Environment variable names the pool plan is exported under.
pub const ENV_POOL_MODE: &str = "PROCWARDEN_POOL_MODE";
pub const ENV_POOL_MAX_CHILDREN: &str = "PROCWARDEN_POOL_MAX_CHILDREN";
pub const ENV_POOL_START_SERVERS: &str = "PROCWARDEN_POOL_START_SERVERS";
pub const ENV_POOL_MIN_SPARE: &str = "PROCWARDEN_POOL_MIN_SPARE";
pub const ENV_POOL_MAX_SPARE: &str = "PROCWARDEN_POOL_MAX_SPARE";
pub const ENV_POOL_MAX_REQUESTS: &str = "PROCWARDEN_POOL_MAX_REQUESTS";
