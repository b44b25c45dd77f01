use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use polirank_core::{RunStatus, SyncRun};
use polirank_rank::{AggregationConfig, AggregationEngine};
use polirank_store::PgStore;
use polirank_sync::{
    build_watch_scheduler, watch_until_shutdown, FeedSettings, SyncConfig, SyncOrchestrator,
    SyncPlan,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "polirank")]
#[command(about = "Parliament open-data ingestion and party activity ranking")]
struct Cli {
    /// Print an informational message and exit without contacting the feed
    /// or the database.
    #[arg(long, global = true)]
    demo: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Nightly ingestion of current-state entities.
    Sync {
        /// Keep running and repeat the sync on the configured cron schedule.
        #[arg(long)]
        watch: bool,
    },
    /// Recompute per-party aggregate activity scores.
    Aggregate,
    /// Full ingestion including historical vote records.
    Backfill,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    if cli.demo {
        println!(
            "polirank demo mode: nothing fetched, nothing written; \
             configure DATABASE_URL and POLIRANK_METADATA_URL and run `polirank sync`"
        );
        return Ok(());
    }

    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { watch: false }) {
        Commands::Sync { watch } => {
            let orchestrator = Arc::new(build_orchestrator(&config).await?);
            let run = orchestrator.run(SyncPlan::Nightly).await?;
            report_run(&run)?;
            if watch {
                let scheduler = build_watch_scheduler(orchestrator, &config.sync_cron).await?;
                info!(cron = %config.sync_cron, "watching for scheduled syncs");
                watch_until_shutdown(scheduler).await?;
            }
        }
        Commands::Backfill => {
            let orchestrator = Arc::new(build_orchestrator(&config).await?);
            let run = orchestrator.run(SyncPlan::Backfill).await?;
            report_run(&run)?;
        }
        Commands::Aggregate => {
            let store = connect_store(&config).await?;
            let summary = AggregationEngine::new(AggregationConfig::default())
                .run(store.as_ref())
                .await?;
            println!(
                "aggregation complete: facts={} rows={} written={} failed_batches={}",
                summary.facts, summary.rows_computed, summary.rows_written, summary.batches_failed
            );
            if summary.batches_failed > 0 {
                bail!("{} aggregate batches failed", summary.batches_failed);
            }
        }
    }

    Ok(())
}

async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    Ok(Arc::new(store))
}

async fn build_orchestrator(config: &SyncConfig) -> Result<SyncOrchestrator> {
    let settings = FeedSettings::load(&config.feed_file).await?;
    let store = connect_store(config).await?;
    SyncOrchestrator::from_config(config, settings, store)
}

fn report_run(run: &SyncRun) -> Result<()> {
    for (kind, counters) in &run.counters {
        println!(
            "{kind}: fetched={} created={} updated={} failed={}",
            counters.fetched, counters.created, counters.updated, counters.failed
        );
    }
    println!(
        "run {} {}: {} errors",
        run.id,
        run.status.as_str(),
        run.errors.len()
    );
    if run.status == RunStatus::Failed {
        bail!("sync run {} failed", run.id);
    }
    Ok(())
}
