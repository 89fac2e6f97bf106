//! Entry point: parse the command line, install the signal handler, run the
//! fleet, and translate the outcome into the documented exit codes.

use clap::Parser;
use procwarden::autotune;
use procwarden::cli::{Cli, CliCommand};
use procwarden::config::ConfigLoader;
use procwarden::event::channel::{pub_sub, EventPublisher};
use procwarden::event::ApplicationEvent;
use procwarden::fleet::FleetOutcome;
use std::process::ExitCode;
use tracing::{error, info};

/// Exit code when every process died without a shutdown being requested.
const EXIT_ALL_DEAD: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match &cli.command {
        Some(CliCommand::Check) => return run_check(&cli),
        Some(CliCommand::Autotune) => return run_autotune(&cli),
        None => {}
    }

    let (application_publisher, application_consumer) = pub_sub();
    if let Err(err) = install_shutdown_signal_handler(application_publisher) {
        eprintln!("could not install the signal handler: {err}");
        return ExitCode::FAILURE;
    }

    match procwarden::run::run(cli, application_consumer) {
        Ok(FleetOutcome::CleanShutdown) => {
            info!("exiting after a clean shutdown");
            ExitCode::SUCCESS
        }
        Ok(FleetOutcome::AllDead) => {
            error!("every supervised process died; exiting");
            ExitCode::from(EXIT_ALL_DEAD)
        }
        Err(err) => {
            // the subscriber may not be installed yet when bootstrap fails
            eprintln!("fatal: {err}");
            error!(%err, "fatal bootstrap failure");
            ExitCode::FAILURE
        }
    }
}

/// Loads and validates the configuration document, reporting the outcome.
fn run_check(cli: &Cli) -> ExitCode {
    match ConfigLoader::new(cli.strict).load(&cli.config) {
        Ok(config) => {
            println!(
                "{}: ok ({} processes, {} tasks)",
                cli.config.display(),
                config.processes.len(),
                config.tasks.len()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{}: {err}", cli.config.display());
            ExitCode::FAILURE
        }
    }
}

/// Prints the derived worker-pool sizing as JSON.
fn run_autotune(cli: &Cli) -> ExitCode {
    let config = match ConfigLoader::new(cli.strict).load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    match procwarden::run::autotune_plan(cli, &config) {
        Ok(Some(plan)) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&plan).unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Ok(None) => {
            // no profile selected anywhere; derive with the default profile
            let limits = autotune::LimitsDetector::default().detect();
            let plan = autotune::calculate(Default::default(), &limits, cli.memory_threshold);
            println!(
                "{}",
                serde_json::to_string_pretty(&plan).unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Translates termination signals into an orderly fleet-wide shutdown by
/// publishing a stop request for the fleet's main loop. The handler is the
/// process-wide single subscriber for these signals.
fn install_shutdown_signal_handler(
    publisher: EventPublisher<ApplicationEvent>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("termination signal received; stopping the fleet");
        let _ = publisher.publish(ApplicationEvent::StopRequested);
    })
}
