use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Container-oriented process supervisor.
#[derive(Parser, Debug)]
#[command(name = "procwarden", version, about)]
pub struct Cli {
    /// Path to the configuration document.
    #[arg(short, long, env = "PROCWARDEN_CONFIG", default_value = "procwarden.yaml")]
    pub config: PathBuf,

    /// Change into this directory before doing anything else.
    #[arg(long, env = "PROCWARDEN_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// Reject unknown configuration keys instead of warning.
    #[arg(long)]
    pub strict: bool,

    /// Log level override (trace|debug|info|warn|error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Force the read-only-root detection outcome.
    #[arg(long, env = "PROCWARDEN_READONLY_ROOT")]
    pub readonly_root: Option<bool>,

    /// Autotune profile override (dev|light|medium|heavy|bursty).
    #[arg(long, env = "PROCWARDEN_AUTOTUNE_PROFILE")]
    pub autotune_profile: Option<String>,

    /// Fraction of total memory the worker pool may use.
    #[arg(long, env = "PROCWARDEN_MEMORY_THRESHOLD")]
    pub memory_threshold: Option<f64>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Load and validate the configuration, then exit.
    Check,
    /// Print the derived worker-pool sizing, then exit.
    Autotune,
}
