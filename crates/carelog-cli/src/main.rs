use std::sync::Arc;

use anyhow::{Context, Result};
use carelog_sync::{SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "carelog")]
#[command(about = "Care-platform record synchronization and dataset materialization")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull new upstream records into the raw bucket.
    Ingest,
    /// Rebuild the derived datasets from the accumulated raw records.
    Materialize,
    /// Ingest, then materialize; stays alive when the cron scheduler is enabled.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Ingest => {
            let outcome = pipeline.ingest_once().await?;
            println!(
                "ingest complete: events={} patients={} providers={} checkpoint={}",
                outcome.events, outcome.patients_listed, outcome.providers_listed,
                outcome.checkpoint
            );
        }
        Commands::Materialize => {
            let summary = pipeline.materialize_once().await?;
            for dataset in &summary.datasets {
                println!(
                    "{}: +{} rows ({} dropped, {} before)",
                    dataset.entity,
                    dataset.rows_appended,
                    dataset.records_dropped,
                    dataset.rows_before
                );
            }
            println!(
                "medical records artifact: {} rows",
                summary.medical_records_rows
            );
        }
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            let appended: usize = summary.datasets.iter().map(|d| d.rows_appended).sum();
            println!(
                "sync complete: run_id={} events={} rows_appended={} checkpoint={}",
                summary.run_id, summary.events, appended, summary.checkpoint
            );

            if let Some(scheduler) = pipeline.maybe_build_scheduler().await? {
                scheduler.start().await.context("starting scheduler")?;
                info!("scheduler running; ctrl-c to exit");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for shutdown signal")?;
            }
        }
    }

    Ok(())
}
