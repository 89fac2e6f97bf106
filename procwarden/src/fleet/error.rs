use crate::config::process_name::ProcessName;
use crate::config::ConfigError;
use crate::plan::PlanError;
use crate::supervisor::error::{RequestError, StartError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("planning the fleet: {0}")]
    Plan(#[from] PlanError),

    #[error("starting `{process}`: {error}")]
    Start {
        process: ProcessName,
        #[source]
        error: StartError,
    },

    #[error("no process named `{0}`")]
    NotFound(ProcessName),

    #[error("process `{0}` is already running")]
    AlreadyRunning(ProcessName),

    #[error("the fleet is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("loading the new configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("planning the new configuration: {0}")]
    Plan(#[from] PlanError),

    #[error("reload could not be fully applied nor rolled back; affected: {0}")]
    PartialApply(String),
}
