//! Blob store, warehouse and HTTP collaborators for cinesync.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cinesync_core::{Row, TableRef, TitleKey};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod csv_load;
mod memory;
mod postgres;

pub use csv_load::{infer_column_type, parse_csv, CsvTable};
pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "cinesync-storage";

/// Location of one object in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub bucket: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("blob://{}/{}", self.bucket, self.key)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub blob: BlobRef,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("invalid blob key {0}")]
    InvalidKey(String),
    #[error("blob io error for {uri}: {source}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError>;

    async fn upload(
        &self,
        blob: &BlobRef,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredBlob, BlobError>;
}

/// Filesystem blob store: buckets are directories under `root`, keys are relative paths.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, blob: &BlobRef) -> Result<PathBuf, BlobError> {
        for part in [blob.bucket.as_str(), blob.key.as_str()] {
            let relative = Path::new(part);
            let clean = !part.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !clean {
                return Err(BlobError::InvalidKey(blob.uri()));
            }
        }
        Ok(self.root.join(&blob.bucket).join(&blob.key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn download(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(blob)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(blob.uri()))
            }
            Err(source) => Err(BlobError::Io {
                uri: blob.uri(),
                source,
            }),
        }
    }

    /// Write bytes via a temp file and rename so readers never observe a partial object.
    async fn upload(
        &self,
        blob: &BlobRef,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredBlob, BlobError> {
        let absolute_path = self.path_for(blob)?;
        let io_err = |source| BlobError::Io {
            uri: blob.uri(),
            source,
        };
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }

        debug!(blob = %blob, content_type, bytes = bytes.len(), "stored blob");
        Ok(StoredBlob {
            blob: blob.clone(),
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::String => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnMode {
    Required,
    Nullable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub mode: ColumnMode,
}

impl ColumnSpec {
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            mode: ColumnMode::Required,
        }
    }

    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            mode: ColumnMode::Nullable,
        }
    }

    pub fn is_required(&self) -> bool {
        self.mode == ColumnMode::Required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Bulk CSV load settings. Defaults match the inbound file contract: one header row,
/// comma delimited, quoted newlines allowed, destination overwritten.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub skip_leading_rows: usize,
    pub delimiter: u8,
    pub allow_quoted_newlines: bool,
    pub overwrite: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            skip_leading_rows: 1,
            delimiter: b',',
            allow_quoted_newlines: true,
            overwrite: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub destination: TableRef,
    pub rows_loaded: u64,
    pub schema: TableSchema,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MergeReport {
    pub rows_inserted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub table: TableRef,
    pub num_rows: u64,
    pub schema: TableSchema,
}

/// One rejected row from an insert batch. `index` points into the submitted slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub index: usize,
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.index, self.message)
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    TableNotFound(TableRef),
    #[error("invalid load source {uri}: {message}")]
    InvalidSource { uri: String, message: String },
    #[error("schema mismatch for {table}: {message}")]
    SchemaMismatch { table: TableRef, message: String },
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Warehouse operations the pipelines depend on. Every call is one atomic server-side
/// operation; callers never see partial loads or merges.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError>;

    async fn load_csv(
        &self,
        source: &BlobRef,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<LoadReport, WarehouseError>;

    /// Insert staging rows whose `key_column` value is absent from `target`. Rows whose
    /// identity already exists are dropped without error.
    async fn merge_insert_only(
        &self,
        target: &TableRef,
        staging: &TableRef,
        key_column: &str,
    ) -> Result<MergeReport, WarehouseError>;

    /// Distinct `(title_hash, title)` pairs in `base` minus those already in `enriched`.
    async fn select_unenriched(
        &self,
        base: &TableRef,
        enriched: &TableRef,
    ) -> Result<Vec<TitleKey>, WarehouseError>;

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError>;

    /// Append rows, dropping fields the schema does not declare. Structurally invalid rows
    /// are returned as errors; the rest are written.
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[Row],
    ) -> Result<Vec<RowError>, WarehouseError>;

    async fn describe_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError>;
}

/// Render a scalar JSON value as text; `None` for null.
pub fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Coerce one text cell into the JSON value stored for `column_type`.
pub fn coerce_text(column_type: ColumnType, text: &str) -> Result<JsonValue, String> {
    match column_type {
        ColumnType::String => Ok(JsonValue::String(text.to_string())),
        ColumnType::Integer => text
            .parse::<i64>()
            .map(JsonValue::from)
            .map_err(|_| format!("{text:?} is not an integer")),
        ColumnType::Float => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(|| format!("{text:?} is not a float")),
        ColumnType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(JsonValue::Bool(true)),
            "false" => Ok(JsonValue::Bool(false)),
            _ => Err(format!("{text:?} is not a boolean")),
        },
    }
}

/// Project a row onto `schema`, in column order. Unknown fields are dropped; missing
/// required fields, non-scalar values and values that do not fit the column type are errors.
pub fn prepare_row(schema: &TableSchema, row: &Row) -> Result<Vec<JsonValue>, String> {
    let mut values = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        let value = match row.get(&column.name) {
            None | Some(JsonValue::Null) => JsonValue::Null,
            Some(JsonValue::Array(_)) | Some(JsonValue::Object(_)) => {
                return Err(format!("field {} has a non-scalar value", column.name));
            }
            Some(scalar) => {
                let text = scalar_text(scalar).unwrap_or_default();
                coerce_text(column.column_type, &text)
                    .map_err(|e| format!("field {}: {e}", column.name))?
            }
        };
        if value.is_null() && column.is_required() {
            return Err(format!("missing required field {}", column.name));
        }
        values.push(value);
    }
    Ok(values)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
        }
    }
}

/// Fixed delay applied before every external call, whatever the previous call returned.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn wait(&self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// One GET with the client's bounded timeout. Non-2xx statuses are errors. Errors never
    /// carry the query string, which may hold credentials.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.send_get(url, query).instrument(span).await
    }

    async fn send_get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Request(e.without_url()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().path().to_string(),
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Request(e.without_url()))?
            .to_vec();
        Ok(FetchedResponse { status, body })
    }
}
