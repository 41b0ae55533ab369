use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobflow_ingest::{HttpScrapeActor, IngestPipeline, IngestRequest, ScrapeActor};
use jobflow_match::MatchEngine;
use jobflow_store::{JobStore, PayloadArchive};
use jobflow_web::AppConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobflow-cli")]
#[command(about = "Jobflow ingestion and matching command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the scheduler, when enabled).
    Serve,
    /// Run one ingestion pass for a query.
    Ingest {
        query: String,
        #[arg(long, default_value = "")]
        location: String,
        #[arg(long, default_value_t = 50)]
        max_jobs: usize,
        #[arg(long)]
        force_refresh: bool,
    },
    /// Run one recommendation generation pass.
    Recommend,
    /// Expire stale postings and archive low-quality ones.
    Maintain {
        #[arg(long, default_value_t = 30)]
        expire_after_days: i32,
        #[arg(long, default_value_t = 4)]
        archive_below: i32,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => jobflow_web::serve(config).await?,
        Commands::Ingest {
            query,
            location,
            max_jobs,
            force_refresh,
        } => {
            let store = JobStore::connect(&config.database_url).await?;
            let actor: Arc<dyn ScrapeActor> =
                Arc::new(HttpScrapeActor::new(&config.actor_config())?);
            let mut pipeline = IngestPipeline::new(Arc::new(store), actor, config.site_origin.clone());
            if let Some(dir) = &config.archive_dir {
                pipeline = pipeline.with_archive(PayloadArchive::new(dir));
            }
            let outcome = pipeline
                .run(&IngestRequest {
                    query,
                    location,
                    max_jobs,
                    force_refresh,
                })
                .await?;
            println!(
                "ingest complete: from_cache={} total={} inserted={} updated={} skipped={}",
                outcome.from_cache,
                outcome.total_results,
                outcome.summary.inserted,
                outcome.summary.updated,
                outcome.summary.skipped
            );
        }
        Commands::Recommend => {
            let store = JobStore::connect(&config.database_url).await?;
            let report = MatchEngine::new(store).run().await?;
            println!(
                "recommendation run {} complete: users={} recommendations={} jobs_considered={}",
                report.run_id,
                report.users_processed,
                report.recommendations_generated,
                report.jobs_considered
            );
        }
        Commands::Maintain {
            expire_after_days,
            archive_below,
        } => {
            let store = JobStore::connect(&config.database_url).await?;
            let expired = store.mark_stale_expired(expire_after_days).await?;
            let archived = store.archive_low_quality(archive_below).await?;
            println!("maintenance complete: expired={expired} archived={archived}");
        }
        Commands::Migrate => {
            let store = JobStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintain_subcommand_parses_with_defaults() {
        let cli = Cli::parse_from(["jobflow-cli", "maintain"]);
        match cli.command {
            Some(Commands::Maintain {
                expire_after_days,
                archive_below,
            }) => {
                assert_eq!(expire_after_days, 30);
                assert_eq!(archive_below, 4);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn maintain_subcommand_accepts_overrides() {
        let cli = Cli::parse_from([
            "jobflow-cli",
            "maintain",
            "--expire-after-days",
            "14",
            "--archive-below",
            "6",
        ]);
        match cli.command {
            Some(Commands::Maintain {
                expire_after_days,
                archive_below,
            }) => {
                assert_eq!(expire_after_days, 14);
                assert_eq!(archive_below, 6);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
