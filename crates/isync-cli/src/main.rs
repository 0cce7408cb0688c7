use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use isync_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "isync-cli")]
#[command(about = "Incremental ingestion of tracker, report and dashboard sources into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once, or only `--source`.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Create the target table of every enabled source.
    InitDb,
    /// Print the latest stored update for a source.
    SyncPoint {
        source: String,
        #[arg(long)]
        partition: Option<String>,
    },
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Run the full sync on `ISYNC_SYNC_CRON` until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn print_summary(summary: &SyncRunSummary) {
    for outcome in &summary.sources {
        let report = &outcome.report;
        println!(
            "{}: fetched={} unique={} rows_affected={} skipped={} aborted_queries={}{}",
            outcome.source_id,
            report.fetched,
            report.unique,
            report.rows_affected,
            report.skipped,
            report.aborted_queries.len(),
            outcome
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
    println!(
        "sync complete: run_id={} sources={} rows_affected={}",
        summary.run_id,
        summary.sources.len(),
        summary.rows_affected()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = match source.as_deref() {
                Some(id) => pipeline.run_source(id).await?,
                None => pipeline.run_once().await,
            };
            print_summary(&summary);
            let failed = summary.failed_sources().count();
            if failed > 0 {
                bail!("{failed} source(s) failed");
            }
        }
        Commands::InitDb => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let tables = pipeline.ensure_tables().await?;
            println!("ensured {tables} table(s)");
        }
        Commands::SyncPoint { source, partition } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let point = pipeline.sync_point(&source, partition.as_deref()).await?;
            match point.since() {
                Some(ts) => println!("{source}: {}", ts.to_rfc3339()),
                None => println!("{source}: {}", point.label()),
            }
        }
        Commands::Serve { port } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            isync_web::serve(Arc::new(pipeline), port).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set ISYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
