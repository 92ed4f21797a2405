use anyhow::{bail, Context, Result};
use cachemax::config::{default_config_path, ConfigStore};
use cachemax::manager::{CacheManager, ManagerSettings};
use cachemax::recovery::RecoveryStrategy;
use cachemax::scheduler::{Scheduler, TickKind};
use cachemax::sync::QueueStatus;
use cachemax::Progress;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cachemax")]
#[command(about = "Accelerate slow folders through a fast cache", long_about = None)]
struct Cli {
    /// Config file (default: per-user data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Move a folder onto the cache and redirect it
    Accelerate {
        source: PathBuf,
        /// Cache root (default: configured default root)
        #[arg(long)]
        cache_root: Option<PathBuf>,
    },
    /// Stop accelerating a folder and restore the original
    Stop {
        mount: PathBuf,
        #[arg(long, default_value_t = false)]
        delete_cache: bool,
    },
    /// Check accelerated folders (all when no mount is given)
    Validate { mount: Option<PathBuf> },
    /// List accelerated folders
    List,
    /// Evict least recently used, already-synced cache files
    Cleanup {
        mount: PathBuf,
        /// Megabytes to free
        #[arg(long)]
        free_mb: u64,
    },
    /// Mirror a cache into its original now
    Sync { mount: PathBuf },
    /// Cache size and sync backlog
    Stats { mount: PathBuf },
    /// Run the health check over every accelerated folder
    Health,
    /// Run recovery for one folder
    Recover {
        mount: PathBuf,
        /// Force a strategy instead of choosing from the error history
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },
    /// Keep every accelerated folder in sync until Ctrl-C
    Run {
        /// Minutes between health checks
        #[arg(long, default_value_t = 5)]
        health_minutes: u64,
    },
    /// Set the default cache root
    SetRoot { path: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Retry,
    Reset,
    Recreate,
    Fallback,
}

impl From<StrategyArg> for RecoveryStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Retry => RecoveryStrategy::Retry,
            StrategyArg::Reset => RecoveryStrategy::Reset,
            StrategyArg::Recreate => RecoveryStrategy::Recreate,
            StrategyArg::Fallback => RecoveryStrategy::Fallback,
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn spinner() -> (ProgressBar, Progress) {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    let sink = pb.clone();
    let progress = Progress::new(move |message| sink.set_message(message.to_string()));
    (pb, progress)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut store = ConfigStore::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Commands::SetRoot { path } = &cli.command {
        if !path.is_dir() {
            bail!("{} is not a directory", path.display());
        }
        store.set_default_root(path)?;
        println!("Default cache root: {}", path.display());
        return Ok(());
    }

    let settings = ManagerSettings::from_config(store.config());
    let default_root = store.config().default_cache_root.clone();
    let records = store.mounts().to_vec();
    let manager = CacheManager::new(settings, Some(store));
    let monitor = matches!(cli.command, Commands::Run { .. });
    manager
        .restore_states(&records, monitor, &Progress::silent())
        .await;

    match cli.command {
        Commands::Accelerate { source, cache_root } => {
            let Some(cache_root) = cache_root.or(default_root) else {
                bail!("no cache root given and no default configured (see set-root)");
            };
            let (pb, progress) = spinner();
            let result = manager.accelerate(&source, &cache_root, &progress).await;
            pb.finish_and_clear();
            let mount = result?;
            println!(
                "{} -> {} ({})",
                mount.mount_point.display(),
                mount.cache_path.display(),
                format_size(mount.size_bytes, BINARY)
            );
            // the watcher only lives as long as this process
            manager.shutdown(false).await;
        }
        Commands::Stop { mount, delete_cache } => {
            let (pb, progress) = spinner();
            let result = manager.stop_mount(&mount, delete_cache, &progress).await;
            pb.finish_and_clear();
            result?;
            println!("Restored {}", mount.display());
        }
        Commands::Validate { mount } => {
            let targets = match mount {
                Some(mount) => vec![record(&manager, &mount)?],
                None => manager.mounts(),
            };
            let mut failed = 0;
            for m in targets {
                let report = manager.validate(&m.mount_point, &m.original_path, &m.cache_path);
                if report.is_valid() {
                    println!("OK    {}", m.mount_point.display());
                } else {
                    failed += 1;
                    println!("FAIL  {}: {}", m.mount_point.display(), report.issues().join("; "));
                }
            }
            if failed > 0 {
                bail!("{failed} accelerations failed validation");
            }
        }
        Commands::List => {
            let mut mounts = manager.mounts();
            mounts.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
            if mounts.is_empty() {
                println!("No accelerated folders");
            }
            for m in mounts {
                println!(
                    "{:<12} {} -> {} ({}, since {})",
                    manager.lifecycle(&m.mount_point).to_string(),
                    m.mount_point.display(),
                    m.cache_path.display(),
                    format_size(m.size_bytes, BINARY),
                    m.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Cleanup { mount, free_mb } => {
            let m = record(&manager, &mount)?;
            let (pb, progress) = spinner();
            let result = manager
                .cleanup(&m.cache_path, free_mb * 1024 * 1024, &progress)
                .await;
            pb.finish_and_clear();
            let report = result?;
            println!(
                "Evicted {} files, freed {} ({} not yet synced, kept)",
                report.files_deleted,
                format_size(report.bytes_freed, BINARY),
                report.files_unreplicated
            );
        }
        Commands::Sync { mount } => {
            let (pb, progress) = spinner();
            let result = manager.sync_now(&mount, &progress).await;
            pb.finish_and_clear();
            let report = result?;
            println!(
                "{} copied ({}), {} unchanged, {} failed",
                report.files_copied,
                format_size(report.bytes_copied, BINARY),
                report.files_skipped,
                report.failures.len()
            );
            for (path, error) in &report.failures {
                println!("  {}: {}", path.display(), error);
            }
        }
        Commands::Stats { mount } => {
            let m = record(&manager, &mount)?;
            let stats = manager.cache_stats(&m.cache_path).await?;
            println!(
                "{}: {} files, {}, {} queued",
                stats.cache_path.display(),
                stats.file_count,
                format_size(stats.total_bytes, BINARY),
                stats.queued
            );
        }
        Commands::Health => {
            let (pb, progress) = spinner();
            let reports = manager.health_check(&progress).await;
            pb.finish_and_clear();
            for report in &reports {
                if report.is_healthy() {
                    println!("OK    {}", report.mount_point.display());
                } else {
                    println!("FAIL  {}: {}", report.mount_point.display(), report.issues.join("; "));
                }
            }
            let stats = manager.supervisor().error_statistics();
            println!(
                "{} active of {}, {} errors, {} recovery attempts",
                stats.active_accelerations,
                stats.total_accelerations,
                stats.total_errors,
                stats.total_recovery_attempts
            );
        }
        Commands::Recover { mount, strategy } => {
            let m = record(&manager, &mount)?;
            let (pb, progress) = spinner();
            let outcome = match strategy {
                Some(strategy) => {
                    manager
                        .supervisor()
                        .execute_strategy(&m.mount_point, strategy.into(), &manager, &progress, Utc::now())
                        .await
                }
                None => manager.recover(&m.mount_point, &progress).await,
            };
            pb.finish_and_clear();
            let outcome = outcome?;
            println!(
                "{} with {} (attempt {}): {}",
                outcome.mount_point.display(),
                outcome.strategy,
                outcome.attempt,
                if outcome.success { "ok" } else { "failed" }
            );
        }
        Commands::Run { health_minutes } => run(&manager, health_minutes).await?,
        Commands::SetRoot { .. } => {}
    }
    Ok(())
}

fn record(manager: &CacheManager, mount: &Path) -> Result<cachemax::config::AcceleratedMount> {
    manager
        .mount(mount)
        .with_context(|| format!("{} is not an accelerated folder", mount.display()))
}

async fn run(manager: &CacheManager, health_minutes: u64) -> Result<()> {
    manager.start_background();
    let cancel = CancellationToken::new();
    let (mut scheduler, mut ticks) = Scheduler::new(cancel.clone());
    scheduler.every(TickKind::HealthCheck, Duration::from_secs(health_minutes.max(1) * 60));

    info!("Watching {} accelerated folders", manager.mounts().len());
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Ctrl-C handler failed: {}", e);
                }
                break;
            }
            tick = ticks.recv() => {
                let Some(tick) = tick else { break };
                if tick.kind == TickKind::HealthCheck {
                    let reports = manager.health_check(&Progress::silent()).await;
                    let failing = reports.iter().filter(|r| !r.is_healthy()).count();
                    info!("Health check: {} of {} need attention", failing, reports.len());
                }
                let failed = manager
                    .sync_engine()
                    .queue_items()
                    .iter()
                    .filter(|i| i.status == QueueStatus::Failed)
                    .count();
                if failed > 0 {
                    warn!("{} sync operations failed and wait for retry", failed);
                }
            }
        }
    }

    info!("Shutting down, running a final sync");
    scheduler.shutdown();
    manager.shutdown(true).await;
    Ok(())
}
