use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wxetl_load::{MemoryStore, PgWeatherStore, WeatherStore};
use wxetl_sync::{report_recent_runs, LoadTarget, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "wxetl")]
#[command(about = "Weather ETL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, transform and load once.
    Run {
        /// Load into an in-process store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Extract all locations and write the raw batch handoff document.
    Extract,
    /// Transform a raw batch handoff document.
    Transform {
        #[arg(long)]
        input: PathBuf,
    },
    /// Load a transformed batch handoff document.
    Load {
        #[arg(long)]
        input: PathBuf,
    },
    /// Create the weather tables if they do not exist.
    InitDb,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let mut pipeline = SyncPipeline::new(config)?;
            if dry_run {
                let store = Arc::new(MemoryStore::new());
                pipeline = pipeline.with_load_target(LoadTarget::InMemory(store));
            }
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} locations={}/{} current_weather={} \
                 hourly_weather={} reports={}",
                summary.run_id,
                summary.locations_extracted,
                summary.locations_configured,
                summary.loaded.current_weather,
                summary.loaded.hourly_weather,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Extract => {
            let stored = SyncPipeline::new(config)?.extract_to_handoff().await?;
            println!("{}", stored.path.display());
        }
        Commands::Transform { input } => {
            let stored = SyncPipeline::new(config)?.transform_handoff(&input).await?;
            println!("{}", stored.path.display());
        }
        Commands::Load { input } => {
            let summary = SyncPipeline::new(config)?.load_handoff(&input).await?;
            println!(
                "load complete: current_weather={} hourly_weather={}",
                summary.current_weather, summary.hourly_weather
            );
        }
        Commands::InitDb => {
            let store = PgWeatherStore::connect(&config.store)
                .await
                .with_context(|| format!("connecting to {}", config.store.display_target()))?;
            store.ensure_schema().await?;
            println!("schema ready on {}", config.store.display_target());
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let markdown = report_recent_runs(runs, &config.reports_root())?;
            println!("{markdown}");
        }
    }

    Ok(())
}
