use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cinesync_adapters::{flatten_payload, LookupOutcome, MetadataSource};
use cinesync_core::{merge_rows, Row, TableRef, TitleKey, TITLE_COLUMN, TITLE_HASH_COLUMN};
use cinesync_storage::{ColumnSpec, ColumnType, TableSchema, Throttle, Warehouse};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::EnrichConfig;

/// Optional metadata columns of the enriched table, all strings.
pub const ENRICHED_METADATA_COLUMNS: [&str; 10] = [
    "genre",
    "director",
    "actors",
    "writer",
    "country",
    "language",
    "boxoffice",
    "ratings_internetmoviedatabase",
    "ratings_rottentomatoes",
    "ratings_metacritic",
];

pub fn enriched_table_schema() -> TableSchema {
    let mut columns = vec![
        ColumnSpec::required(TITLE_HASH_COLUMN, ColumnType::String),
        ColumnSpec::required(TITLE_COLUMN, ColumnType::String),
    ];
    columns.extend(
        ENRICHED_METADATA_COLUMNS
            .iter()
            .map(|name| ColumnSpec::nullable(*name, ColumnType::String)),
    );
    TableSchema::new(columns)
}

/// Shuffle the backlog and keep at most `cap` items. The cap bounds external calls, not
/// successful writes.
pub fn select_work<R: Rng + ?Sized>(mut backlog: Vec<TitleKey>, cap: usize, rng: &mut R) -> Vec<TitleKey> {
    backlog.shuffle(rng);
    backlog.truncate(cap);
    backlog
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backlog: usize,
    pub attempted: usize,
    pub enriched: usize,
    pub not_found: usize,
    pub failed: usize,
    pub malformed: usize,
    pub rejected: usize,
}

pub struct EnrichmentPipeline {
    warehouse: Arc<dyn Warehouse>,
    source: Arc<dyn MetadataSource>,
    throttle: Throttle,
    base_table: TableRef,
    enriched_table: TableRef,
    max_queries: usize,
}

impl EnrichmentPipeline {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        source: Arc<dyn MetadataSource>,
        config: &EnrichConfig,
    ) -> Self {
        Self {
            warehouse,
            source,
            throttle: Throttle::new(config.call_interval),
            base_table: config.base_table.clone(),
            enriched_table: config.enriched_table.clone(),
            max_queries: config.max_queries,
        }
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Create the enriched table with its fixed schema unless it already exists.
    pub async fn ensure_enriched_table(&self) -> Result<bool> {
        let table = &self.enriched_table;
        if self
            .warehouse
            .table_exists(table)
            .await
            .with_context(|| format!("checking whether {table} exists"))?
        {
            return Ok(false);
        }
        self.warehouse
            .create_table(table, &enriched_table_schema())
            .await
            .with_context(|| format!("creating {table}"))?;
        info!(table = %table, "created enriched table");
        Ok(true)
    }

    pub async fn run_once(&self) -> Result<EnrichmentRunSummary> {
        let mut rng = StdRng::from_os_rng();
        self.run_with_rng(&mut rng).await
    }

    pub async fn run_with_rng(&self, rng: &mut StdRng) -> Result<EnrichmentRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "enrich",
            %run_id,
            base = %self.base_table,
            enriched = %self.enriched_table,
            source = self.source.source_id()
        );
        self.run_inner(run_id, rng).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, rng: &mut StdRng) -> Result<EnrichmentRunSummary> {
        let started_at = Utc::now();
        self.ensure_enriched_table().await?;

        let backlog = self
            .warehouse
            .select_unenriched(&self.base_table, &self.enriched_table)
            .await
            .with_context(|| {
                format!(
                    "selecting titles in {} missing from {}",
                    self.base_table, self.enriched_table
                )
            })?;
        let backlog_len = backlog.len();
        info!(backlog = backlog_len, cap = self.max_queries, "titles to process");

        let work = select_work(backlog, self.max_queries, rng);
        let mut summary = EnrichmentRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            backlog: backlog_len,
            attempted: 0,
            enriched: 0,
            not_found: 0,
            failed: 0,
            malformed: 0,
            rejected: 0,
        };

        for key in &work {
            self.throttle.wait().await;
            summary.attempted += 1;

            let raw = match self.source.lookup(&key.title).await {
                LookupOutcome::Found(raw) => raw,
                LookupOutcome::NotFound { message } => {
                    warn!(title = %key.title, %message, "no metadata for title; skipping");
                    summary.not_found += 1;
                    continue;
                }
                LookupOutcome::Failed(err) => {
                    warn!(title = %key.title, error = %err, "metadata lookup failed; skipping");
                    summary.failed += 1;
                    continue;
                }
            };

            let payload = match flatten_payload(raw) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(title = %key.title, error = %err, "malformed metadata payload; skipping");
                    summary.malformed += 1;
                    continue;
                }
            };

            // Key columns keep the selected identity so the backlog diff matches this row.
            let mut row = merge_rows(key.to_row(), payload);
            row.extend(key.to_row());
            if self.write_row(key, row).await? {
                summary.enriched += 1;
            } else {
                summary.rejected += 1;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            attempted = summary.attempted,
            enriched = summary.enriched,
            not_found = summary.not_found,
            failed = summary.failed,
            malformed = summary.malformed,
            rejected = summary.rejected,
            "enrichment run finished"
        );
        Ok(summary)
    }

    /// Append one enriched row. Row-level rejections are logged and reported as `false`;
    /// warehouse failures propagate.
    async fn write_row(&self, key: &TitleKey, row: Row) -> Result<bool> {
        let errors = self
            .warehouse
            .insert_rows(&self.enriched_table, std::slice::from_ref(&row))
            .await
            .with_context(|| format!("inserting enriched row for {:?}", key.title))?;
        for error in &errors {
            warn!(title = %key.title, error = %error, "enriched row rejected");
        }
        Ok(errors.is_empty())
    }
}
