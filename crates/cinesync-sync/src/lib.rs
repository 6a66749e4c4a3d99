//! Pipeline orchestration: storage-event ingest, backlog enrichment and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use cinesync_adapters::OmdbSource;
use cinesync_core::StorageEvent;
use cinesync_storage::{BlobStore, HttpFetcher, LocalBlobStore, PgWarehouse, Warehouse};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

mod config;
mod enrich;
mod ingest;

pub use config::{EnrichConfig, IngestConfig, ServiceConfig};
pub use enrich::{
    enriched_table_schema, select_work, EnrichmentPipeline, EnrichmentRunSummary,
    ENRICHED_METADATA_COLUMNS,
};
pub use ingest::{add_title_hash_column, temp_blob_name, IngestPipeline, IngestRunSummary};

pub const CRATE_NAME: &str = "cinesync-sync";

async fn connect_warehouse(
    database_url: &str,
    blobs: Arc<dyn BlobStore>,
) -> Result<Arc<dyn Warehouse>> {
    let warehouse = PgWarehouse::connect(database_url, blobs)
        .await
        .context("connecting to warehouse database")?;
    Ok(Arc::new(warehouse))
}

impl IngestPipeline {
    /// Pipeline wired to the local blob store and the Postgres warehouse.
    pub async fn connect(config: IngestConfig) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.blob_root.clone()));
        let warehouse = connect_warehouse(&config.database_url, blobs.clone()).await?;
        Ok(Self::new(blobs, warehouse, config))
    }
}

impl EnrichmentPipeline {
    /// Pipeline wired to OMDb and the Postgres warehouse.
    pub async fn connect(config: &EnrichConfig) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.blob_root.clone()));
        let warehouse = connect_warehouse(&config.database_url, blobs).await?;
        let http = HttpFetcher::new(config.http_client())?;
        let source = Arc::new(OmdbSource::new(http, config.omdb.clone()));
        Ok(Self::new(warehouse, source, config))
    }
}

pub async fn run_ingest_from_env(event: &StorageEvent) -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env()?;
    IngestPipeline::connect(config).await?.run(event).await
}

pub async fn run_enrich_with_config(config: &EnrichConfig) -> Result<EnrichmentRunSummary> {
    EnrichmentPipeline::connect(config).await?.run_once().await
}

pub async fn run_enrich_from_env() -> Result<EnrichmentRunSummary> {
    let config = EnrichConfig::from_env()?;
    run_enrich_with_config(&config).await
}

/// Scheduler running pipeline B on `service.enrich_cron`, or `None` when scheduling is off.
/// A failed scheduled run is logged; the next tick runs again.
pub async fn maybe_build_scheduler(
    service: &ServiceConfig,
    enrich: EnrichConfig,
) -> Result<Option<JobScheduler>> {
    if !service.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &service.enrich_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let config = enrich.clone();
        Box::pin(async move {
            match run_enrich_with_config(&config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    enriched = summary.enriched,
                    attempted = summary.attempted,
                    "scheduled enrichment finished"
                ),
                Err(err) => error!(error = ?err, "scheduled enrichment failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
