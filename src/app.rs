use crate::{
    cli::args::Cli,
    config::{ConfigLoader, EngineConfig},
    core::{
        coordinator::PhaseCoordinator,
        health::{HealthProbe, HttpProbe},
        scope::{parse_target, resolve_target},
        state::RunStatus,
    },
    executors::command::ProcessRunner,
    organizers::layout,
    plugins::PluginRegistry,
    reporters::{validate, writer},
    ui::{printer, progress},
    utils::logging,
};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXIT_ABORTED: i32 = 130;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Scan every configured target in turn. Returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    let level = logging::level_from_cli(&cli);
    logging::init(level)?;

    let global = ConfigLoader::load_with_custom_path(cli.config.as_deref())?;
    let config = Arc::new(EngineConfig::resolve(global, &cli)?);
    tracing::info!(
        "Scanning {} target(s), phases {:?}",
        config.targets.len(),
        config.phases
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping running tools");
            interrupt.cancel();
        }
    });

    let health_probe: Option<Arc<dyn HealthProbe>> = if config.adaptive.health_check {
        Some(Arc::new(HttpProbe::new(&config)?))
    } else {
        None
    };

    let mut exit_code = 0;
    for raw in &config.targets {
        if cancel.is_cancelled() {
            break;
        }
        let target = match parse_target(raw) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!("Skipping {}: {}", raw, e);
                exit_code = 1;
                continue;
            }
        };
        let target = resolve_target(target, RESOLVE_TIMEOUT).await;
        let dirs = layout::prepare_run_dirs(&config.output_dir, &target.host, Utc::now())?;
        let registry = PluginRegistry::from_config(&config);
        registry.log_plugin_summary();

        let (events, progress_task) = progress::start_progress_task(config.quiet);
        let mut coordinator = PhaseCoordinator::new(
            Arc::clone(&config),
            target,
            dirs.clone(),
            registry,
            Arc::new(ProcessRunner),
        )?
        .with_cancel(cancel.clone())
        .with_events(events);
        if let Some(probe) = &health_probe {
            coordinator = coordinator.with_health_probe(Arc::clone(probe));
        }

        let report = coordinator.run(&config.phases).await;
        if let Err(e) = progress_task.await {
            tracing::debug!("progress task ended abnormally: {}", e);
        }

        writer::write_all(&report, &dirs)?;
        validate::validate_reports(&dirs)?;
        layout::cleanup_tmp(&dirs);

        if config.quiet {
            println!("{}", dirs.report.display());
        } else {
            printer::print_summary(&report, &dirs);
        }

        if report.status == RunStatus::Aborted {
            exit_code = EXIT_ABORTED;
            break;
        }
    }

    Ok(exit_code)
}
