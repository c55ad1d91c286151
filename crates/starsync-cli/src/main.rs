use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use starsync_storage::WarehouseStore;
use starsync_sync::{
    connect_warehouse, maybe_build_scheduler, report_daily_markdown, RunMode, SyncConfig,
    SyncPipeline,
};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "starsync")]
#[command(about = "Sales order star-schema synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch against the warehouse.
    Load {
        /// `initial` or `daily`; defaults to STARSYNC_MODE.
        #[arg(long)]
        mode: Option<RunMode>,
        /// Order file; defaults to STARSYNC_INPUT.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Create the warehouse tables.
    Bootstrap {
        /// Drop existing tables first.
        #[arg(long)]
        reset: bool,
    },
    /// Run daily batches on STARSYNC_SYNC_CRON until Ctrl-C.
    Schedule,
    /// Print a digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("STARSYNC_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Load {
        mode: None,
        input: None,
    }) {
        Commands::Load { mode, input } => {
            let store = connect_warehouse(&config).await?;
            let mode = mode.unwrap_or(config.mode);
            let input = input.unwrap_or_else(|| config.input_path.clone());
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_path(&store, &input, mode).await?;
            println!(
                "load complete: run_id={} mode={} customers=+{} products=+{} dates=+{} facts=+{} skipped_facts={}",
                summary.run_id,
                summary.mode,
                summary.inserted.customers,
                summary.inserted.products,
                summary.inserted.dates,
                summary.inserted.facts,
                summary.skipped_facts
            );
            for (kind, count) in summary.issue_counts() {
                println!("  {}: {count}", kind.as_str());
            }
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Bootstrap { reset } => {
            let store = connect_warehouse(&config).await?;
            store.bootstrap(reset).await.context("bootstrapping schema")?;
            let counts = store.table_counts().await?;
            println!(
                "schema ready: customers={} products={} dates={} facts={}",
                counts.customers, counts.products, counts.dates, counts.facts
            );
        }
        Commands::Schedule => {
            let store: Arc<dyn WarehouseStore> = Arc::new(connect_warehouse(&config).await?);
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, store).await? else {
                anyhow::bail!("scheduler disabled; set STARSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let markdown = report_daily_markdown(runs, Some(config.workspace_root))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
