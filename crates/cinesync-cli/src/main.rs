use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cinesync_core::StorageEvent;
use cinesync_sync::{EnrichConfig, IngestConfig, IngestPipeline, ServiceConfig};
use cinesync_web::AppState;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cinesync")]
#[command(about = "Movie catalogue ingest and enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one inbound CSV object into the warehouse.
    Ingest {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        name: String,
    },
    /// Run one enrichment pass over the unenriched backlog.
    Enrich,
    /// Serve the storage event receiver (and the scheduler when enabled).
    Serve,
    /// Run enrichment on the configured cron schedule until interrupted.
    Schedule,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CINESYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { bucket, name } => {
            let summary = cinesync_sync::run_ingest_from_env(&StorageEvent { bucket, name }).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Enrich => match cinesync_sync::run_enrich_from_env().await {
            Ok(summary) => {
                println!(
                    "enrichment complete: run_id={} backlog={} attempted={} enriched={}",
                    summary.run_id, summary.backlog, summary.attempted, summary.enriched
                );
            }
            Err(err) => {
                let line = json!({
                    "message": format!("Task failed: {err:#}"),
                    "severity": "ERROR",
                });
                println!("{line}");
                std::process::exit(1);
            }
        },
        Commands::Serve => {
            let service = ServiceConfig::from_env()?;
            let scheduler = if service.scheduler_enabled {
                cinesync_sync::maybe_build_scheduler(&service, EnrichConfig::from_env()?).await?
            } else {
                None
            };
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %service.enrich_cron, "enrichment scheduler started");
            }
            let ingest = IngestPipeline::connect(IngestConfig::from_env()?).await?;
            cinesync_web::serve(AppState::new(ingest), service.web_port).await?;
        }
        Commands::Schedule => {
            let service = ServiceConfig {
                scheduler_enabled: true,
                ..ServiceConfig::from_env()?
            };
            let mut sched = cinesync_sync::maybe_build_scheduler(&service, EnrichConfig::from_env()?)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %service.enrich_cron, "enrichment scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
