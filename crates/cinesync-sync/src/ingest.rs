use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cinesync_core::{normalize_csv, title_hash, StorageEvent, TableRef, TITLE_COLUMN, TITLE_HASH_COLUMN};
use cinesync_storage::{BlobRef, BlobStore, LoadOptions, Warehouse};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::IngestConfig;

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: BlobRef,
    pub cleaned: BlobRef,
    pub cleaned_sha256: String,
    pub cleaned_bytes: usize,
    pub destination: TableRef,
    pub merged: bool,
    pub rows_loaded: u64,
    pub rows_inserted: Option<u64>,
    pub total_rows: Option<u64>,
}

/// Storage event to warehouse: normalize, hash titles, stage the cleaned file, then load
/// directly (first file) or through the staging table with an insert-only merge.
pub struct IngestPipeline {
    blobs: Arc<dyn BlobStore>,
    warehouse: Arc<dyn Warehouse>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(blobs: Arc<dyn BlobStore>, warehouse: Arc<dyn Warehouse>, config: IngestConfig) -> Self {
        Self {
            blobs,
            warehouse,
            config,
        }
    }

    pub async fn run(&self, event: &StorageEvent) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest",
            %run_id,
            bucket = %event.bucket,
            name = %event.name,
            destination = %self.config.destination
        );
        self.run_inner(run_id, event).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, event: &StorageEvent) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let source = BlobRef::new(event.bucket.clone(), event.name.clone());

        let bytes = self
            .blobs
            .download(&source)
            .await
            .with_context(|| format!("downloading {source}"))?;
        let text = String::from_utf8(bytes).with_context(|| format!("{source} is not UTF-8 text"))?;
        let cleaned_text = add_title_hash_column(&normalize_csv(&text))
            .with_context(|| format!("preparing {source}"))?;

        let cleaned = BlobRef::new(
            self.config.temp_bucket.clone(),
            temp_blob_name(&event.name, started_at.timestamp_millis()),
        );
        let stored = self
            .blobs
            .upload(&cleaned, cleaned_text.as_bytes(), "text/csv")
            .await
            .with_context(|| format!("uploading {cleaned}"))?;
        info!(
            cleaned = %cleaned,
            sha256 = %stored.content_hash,
            bytes = stored.byte_size,
            "uploaded cleaned file"
        );

        let target = &self.config.destination;
        let merged = self
            .warehouse
            .table_exists(target)
            .await
            .with_context(|| format!("checking whether {target} exists"))?;
        let load_target = if merged { target.staging() } else { target.clone() };

        let load = self
            .warehouse
            .load_csv(&cleaned, &load_target, &LoadOptions::default())
            .await
            .with_context(|| format!("loading {cleaned} into {load_target}"))?;
        info!(table = %load_target, rows = load.rows_loaded, "load finished");

        let (rows_inserted, total_rows) = if merged {
            let report = self
                .warehouse
                .merge_insert_only(target, &load_target, &self.config.identity_column)
                .await
                .with_context(|| format!("merging {load_target} into {target}"))?;
            info!(
                rows_inserted = report.rows_inserted,
                identity = %self.config.identity_column,
                "merged staging rows without duplicate identities"
            );

            let described = self
                .warehouse
                .describe_table(target)
                .await
                .with_context(|| format!("describing {target}"))?;
            info!(table = %target, num_rows = described.num_rows, "target table after merge");
            for column in &described.schema.columns {
                info!(
                    column = %column.name,
                    column_type = ?column.column_type,
                    mode = ?column.mode,
                    "schema"
                );
            }
            (Some(report.rows_inserted), Some(described.num_rows))
        } else {
            info!(table = %target, "first load; nothing to merge");
            (None, None)
        };

        Ok(IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source,
            cleaned,
            cleaned_sha256: stored.content_hash,
            cleaned_bytes: stored.byte_size,
            destination: target.clone(),
            merged,
            rows_loaded: load.rows_loaded,
            rows_inserted,
            total_rows,
        })
    }
}

/// Temp object name for a cleaned file: `temp-<millis>-<name>` with spaces and hyphens
/// dropped from the name and the rest lower-cased.
pub fn temp_blob_name(source_name: &str, millis: i64) -> String {
    format!(
        "temp-{millis}-{}",
        source_name.replace([' ', '-'], "").to_lowercase()
    )
}

/// Append a `title_hash` column computed from each record's trimmed `title`. An existing
/// `title_hash` column is overwritten in place. Output is re-quoted minimally.
pub fn add_title_hash_column(csv_text: &str) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(csv_text.as_bytes());
    let mut records = reader.records();

    let header = records
        .next()
        .context("file has no header row")?
        .context("reading header row")?;
    let title_idx = header
        .iter()
        .position(|name| name == TITLE_COLUMN)
        .with_context(|| format!("file has no {TITLE_COLUMN} column"))?;
    let hash_idx = header.iter().position(|name| name == TITLE_HASH_COLUMN);

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut names: Vec<&str> = header.iter().collect();
    if hash_idx.is_none() {
        names.push(TITLE_HASH_COLUMN);
    }
    writer.write_record(&names).context("writing header row")?;

    for (offset, record) in records.enumerate() {
        let record = record.with_context(|| format!("reading record {}", offset + 1))?;
        let hash = title_hash(record.get(title_idx).unwrap_or_default());
        let mut fields: Vec<&str> = record.iter().collect();
        match hash_idx {
            Some(idx) => fields[idx] = &hash,
            None => fields.push(&hash),
        }
        writer
            .write_record(&fields)
            .with_context(|| format!("writing record {}", offset + 1))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("flushing cleaned csv: {}", e.error()))?;
    String::from_utf8(bytes).context("cleaned csv is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_names_drop_spaces_and_hyphens() {
        assert_eq!(
            temp_blob_name("Box-Office Revenues.CSV", 1_700_000_000_000),
            "temp-1700000000000-boxofficerevenues.csv"
        );
    }

    #[test]
    fn title_hash_is_appended_from_trimmed_titles() {
        let out = add_title_hash_column("id,title\n1, Inception \n2,\"Heat, 1995\"\n").expect("hash");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "id,title,title_hash");
        assert!(lines[1].ends_with(",52420946ea26dad64361e937683462f83381ca75b1aea0d31abfdee391a8d403"));
        assert!(lines[2].starts_with("2,\"Heat, 1995\","));
    }

    #[test]
    fn existing_hash_column_is_replaced() {
        let out = add_title_hash_column("title_hash,title\nstale,Inception\n").expect("hash");
        assert_eq!(
            out,
            "title_hash,title\n52420946ea26dad64361e937683462f83381ca75b1aea0d31abfdee391a8d403,Inception\n"
        );
    }

    #[test]
    fn missing_title_column_is_an_error() {
        let err = add_title_hash_column("id,name\n1,Heat\n").expect_err("no title");
        assert!(err.to_string().contains("title"));
        assert!(add_title_hash_column("").is_err());
    }
}
