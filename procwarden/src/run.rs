//! Bootstrap: assemble every component and hand control to the fleet
//! manager's main loop.

use crate::autotune::{calculate, LimitsDetector, WorkerPoolPlan};
use crate::cli::Cli;
use crate::config::{ConfigLoader, FleetConfig, ProfileName};
use crate::event::channel::{pub_sub, EventConsumer};
use crate::event::ApplicationEvent;
use crate::fleet::{FleetInputs, FleetManager, FleetOutcome};
use crate::reaper::spawn_reaper;
use crate::runtime_dir::{write_pid_file, RuntimeDirSetup};
use crate::sampler::spawn_sampler;
use crate::scheduler::spawn_scheduler;
use crate::server::spawn_api_server;
use crate::utils::thread_context::StartedThreadContext;
use crate::watcher::{reload_channel, spawn_config_watcher, DEFAULT_DEBOUNCE};
use std::error::Error;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Resolves the autotune profile and threshold with the agreed precedence
/// (CLI/environment override first, then the configuration) and derives the
/// pool plan when a profile is in play.
pub fn autotune_plan(cli: &Cli, config: &FleetConfig) -> Result<Option<WorkerPoolPlan>, Box<dyn Error + Send + Sync>> {
    let profile = match &cli.autotune_profile {
        Some(raw) => Some(ProfileName::from_str(raw)?),
        None => config.global.autotune.as_ref().map(|section| section.profile),
    };
    let Some(profile) = profile else {
        return Ok(None);
    };

    let threshold = cli.memory_threshold.or(config.global.memory_threshold);
    let limits = LimitsDetector::default().detect();
    Ok(Some(calculate(profile, &limits, threshold)))
}

/// Runs the supervisor until a termination signal or the all-dead condition.
///
/// Bootstrap order: configuration, autotune, runtime directory, background
/// collaborators (reaper, watcher, scheduler, sampler, API server), then the
/// fleet itself. Any error here is fatal; after `FleetManager::run` takes
/// over, failures degrade instead.
pub fn run(
    cli: Cli,
    application_consumer: EventConsumer<ApplicationEvent>,
) -> Result<FleetOutcome, Box<dyn Error + Send + Sync>> {
    if let Some(workdir) = &cli.workdir {
        std::env::set_current_dir(workdir)?;
    }

    let config = ConfigLoader::new(cli.strict).load(&cli.config)?;
    crate::logging::init(&config.global.log, cli.log_level.as_deref());
    info!(config = %cli.config.display(), version = %config.version, "configuration loaded");

    let pool_plan = autotune_plan(&cli, &config)?;
    let extra_env: Vec<(String, String)> = pool_plan
        .as_ref()
        .map(WorkerPoolPlan::env_vars)
        .unwrap_or_default();

    let runtime_dir = RuntimeDirSetup::default().prepare(&config, cli.readonly_root);
    info!(path = %runtime_dir.path.display(), read_only_root = runtime_dir.read_only_root, "runtime directory ready");
    write_pid_file(&runtime_dir.path);

    let reaper = spawn_reaper(Duration::from(config.global.reap_interval));

    let (reload_publisher, reload_consumer) = reload_channel();
    let watcher = spawn_config_watcher(&cli.config, DEFAULT_DEBOUNCE, reload_publisher);

    let (scheduler_publisher, scheduler_consumer) = pub_sub();
    let scheduler = (!config.tasks.is_empty())
        .then(|| spawn_scheduler(&config.tasks, scheduler_publisher));

    let (request_publisher, request_consumer) = pub_sub();
    let api_server = match &config.global.api_addr {
        Some(addr) => Some(spawn_api_server(addr.clone(), request_publisher.clone())?),
        None => None,
    };

    let mut fleet = FleetManager::new(config, Some(cli.config.clone()), cli.strict)?
        .with_extra_env(extra_env)
        .with_autotune_plan(pool_plan);

    let (sample_publisher, sample_consumer) = pub_sub();
    let sampler = spawn_sampler(SAMPLE_INTERVAL, fleet.status_handle(), sample_publisher);

    fleet.start()?;

    let outcome = fleet.run(FleetInputs {
        application: application_consumer,
        reload: reload_consumer,
        scheduler: scheduler_consumer,
        samples: sample_consumer,
        requests: request_consumer,
    });

    stop_collaborator(Some(sampler));
    stop_collaborator(scheduler);
    stop_collaborator(Some(watcher));
    stop_collaborator(Some(reaper));
    stop_collaborator(api_server);

    Ok(outcome)
}

fn stop_collaborator(thread_context: Option<StartedThreadContext>) {
    if let Some(thread_context) = thread_context {
        let name = thread_context.thread_name().to_string();
        if let Err(err) = thread_context.stop() {
            warn!(thread = %name, %err, "collaborator did not stop cleanly");
        }
    }
}
