//! camrec - continuous multi-camera recorder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use camrec::capture::FfmpegLauncher;
use camrec::config::Config;
use camrec::database;
use camrec::logging::{LoggingConfig, init_logging};
use camrec::orchestrator::{OrchestratorSettings, RecordingOrchestrator, prepare_volumes};
use camrec::storage::{SegmentQuery, SegmentStore};
use camrec::volume::{DiskCapacityProbe, SystemHealthCheck, VolumeMonitor};

#[derive(Parser)]
#[command(name = "camrec")]
#[command(about = "Continuous multi-camera recorder with capacity-driven retention")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        env = "CAMREC_CONFIG",
        default_value = "camrec.toml"
    )]
    config: PathBuf,

    /// Log filter directive, e.g. `camrec=debug,sqlx=warn`
    #[arg(long, global = true, env = "CAMREC_LOG")]
    log_filter: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record every configured camera (default)
    Run,

    /// Reconcile segment metadata with the recording directories, then exit
    Reconcile,

    /// Print segment metadata as JSON
    Segments {
        #[arg(long)]
        camera: Option<String>,

        #[arg(long)]
        volume: Option<String>,

        /// Start of the time range (RFC 3339), inclusive
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// End of the time range (RFC 3339), exclusive
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Validate the configuration file, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(config, &cli.config, cli.log_filter).await,
        Commands::Reconcile => cmd_reconcile(config, cli.log_filter).await,
        Commands::Segments {
            camera,
            volume,
            from,
            to,
        } => {
            let query = SegmentQuery {
                camera_id: camera,
                volume_id: volume,
                from,
                to,
            };
            cmd_segments(config, query).await
        }
        Commands::CheckConfig => {
            println!(
                "{}: {} volume(s), {} camera(s)",
                cli.config.display(),
                config.volumes.len(),
                config.cameras.len()
            );
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> Result<SegmentStore> {
    let pool = database::init_pool(&config.general.database_url)
        .await
        .with_context(|| format!("opening database {}", config.general.database_url))?;
    database::run_migrations(&pool)
        .await
        .context("running database migrations")?;
    Ok(SegmentStore::new(pool).with_checksums(config.general.checksum_segments))
}

async fn cmd_run(config: Config, config_path: &Path, log_filter: Option<String>) -> Result<()> {
    let filter = log_filter.or_else(|| config.general.log_filter.clone());
    let (logging, _guard) = init_logging(&config.general.log_dir, filter.as_deref())?;
    let cancel = CancellationToken::new();
    logging.start_retention_cleanup(config.general.log_retention_days, cancel.clone());
    spawn_filter_reload(logging.clone(), config_path.to_path_buf(), cancel.clone());

    info!(
        volumes = config.volumes.len(),
        cameras = config.cameras.len(),
        "camrec starting"
    );

    let store = open_store(&config).await?;
    let prepared = prepare_volumes(config.volume_list()).await?;

    let monitor = Arc::new(VolumeMonitor::new(
        prepared.volumes.clone(),
        Arc::new(DiskCapacityProbe),
        Arc::new(SystemHealthCheck::new(
            config.monitor.smartctl_path.clone(),
            config.monitor.mdstat_path.clone(),
        )),
        config.monitor_settings(),
    ));
    let launcher = Arc::new(FfmpegLauncher::new(config.ffmpeg_settings()));
    let settings = OrchestratorSettings {
        tick_interval: config.tick_interval(),
        failback: config.general.failback,
        session: config.session_settings(),
        reconcile: config.reconcile_options(),
    };
    let orchestrator = RecordingOrchestrator::new(
        config.camera_list(),
        prepared,
        monitor.clone(),
        store,
        launcher,
        settings,
    );

    let monitor_task = tokio::spawn(monitor.run(cancel.clone()));
    let mut orchestrator_task = tokio::spawn(orchestrator.run(cancel.clone()));

    let result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            cancel.cancel();
            (&mut orchestrator_task).await
        }
        result = &mut orchestrator_task => result,
    };
    cancel.cancel();
    let _ = monitor_task.await;

    result.context("orchestrator task failed")??;
    info!("camrec stopped");
    Ok(())
}

async fn cmd_reconcile(config: Config, log_filter: Option<String>) -> Result<()> {
    let filter = log_filter.or_else(|| config.general.log_filter.clone());
    let (_logging, _guard) = init_logging(&config.general.log_dir, filter.as_deref())?;
    let store = open_store(&config).await?;
    let prepared = prepare_volumes(config.volume_list()).await?;

    let volumes: Vec<_> = prepared
        .volumes
        .into_iter()
        .filter(|v| !prepared.unwritable.contains(&v.id))
        .collect();
    let report = store.reconcile(&volumes, &config.reconcile_options()).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_segments(config: Config, query: SegmentQuery) -> Result<()> {
    let store = open_store(&config).await?;
    let segments = store.query(&query).await?;
    println!("{}", serde_json::to_string_pretty(&segments)?);
    Ok(())
}

/// Re-read `general.log_filter` from the configuration file on SIGHUP.
#[cfg(unix)]
fn spawn_filter_reload(logging: Arc<LoggingConfig>, config_path: PathBuf, cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, log filter reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = hangup.recv() => {}
            }
            match Config::load(&config_path) {
                Ok(config) => match config.general.log_filter {
                    Some(directive) => {
                        if let Err(e) = logging.set_filter(&directive) {
                            warn!(error = %e, "Log filter not changed");
                        }
                    }
                    None => info!(
                        current = %logging.get_filter(),
                        "No log_filter configured, keeping the current filter"
                    ),
                },
                Err(e) => warn!(path = %config_path.display(), error = %e, "Cannot reload configuration"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_filter_reload(_logging: Arc<LoggingConfig>, _config_path: PathBuf, _cancel: CancellationToken) {}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
