use std::sync::Arc;

use async_trait::async_trait;
use cinesync_core::{Row, TableRef, TitleKey, TITLE_COLUMN, TITLE_HASH_COLUMN};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool, Row as _};
use tracing::{debug, info_span, Instrument};

use crate::{
    parse_csv, prepare_row, scalar_text, BlobRef, BlobStore, ColumnMode, ColumnSpec, ColumnType,
    LoadOptions, LoadReport, MergeReport, RowError, TableInfo, TableSchema, Warehouse,
    WarehouseError,
};

/// Warehouse backed by Postgres. Datasets map to schemas.
#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    blobs: Arc<dyn BlobStore>,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, blobs: Arc<dyn BlobStore>) -> Self {
        Self { pool, blobs }
    }

    pub async fn connect(database_url: &str, blobs: Arc<dyn BlobStore>) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, blobs))
    }

    async fn load_in_transaction(
        &self,
        source: &BlobRef,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<LoadReport, WarehouseError> {
        let bytes = self.blobs.download(source).await?;
        let parsed = parse_csv(&bytes, options, &source.uri())?;

        // Re-serialize so COPY sees exactly the parsed rows, without skipped header rows.
        let mut writer = csv::Writer::from_writer(Vec::new());
        for record in &parsed.records {
            writer
                .write_record(record.iter().map(|cell| cell.as_deref().unwrap_or("")))
                .map_err(|e| WarehouseError::InvalidSource {
                    uri: source.uri(),
                    message: e.to_string(),
                })?;
        }
        let payload = writer.into_inner().map_err(|e| WarehouseError::InvalidSource {
            uri: source.uri(),
            message: e.to_string(),
        })?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&destination.dataset)
        ))
        .execute(&mut *tx)
        .await?;

        // Catalog reads go through the open transaction so a load holds a single connection.
        let exists = table_exists_on(&mut *tx, destination).await?;
        let schema = if options.overwrite || !exists {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", qualified(destination)))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&create_table_sql(destination, &parsed.schema, false))
                .execute(&mut *tx)
                .await?;
            parsed.schema.clone()
        } else {
            columns_on(&mut *tx, destination).await?
        };

        let columns = column_list(&parsed.schema);
        let copy = format!(
            "COPY {} ({columns}) FROM STDIN WITH (FORMAT csv, FORCE_NULL ({columns}))",
            qualified(destination)
        );
        let rows_loaded = if parsed.records.is_empty() {
            0
        } else {
            let mut sink = tx.copy_in_raw(&copy).await?;
            sink.send(payload).await?;
            sink.finish().await?
        };
        tx.commit().await?;

        debug!(rows_loaded, "load committed");
        Ok(LoadReport {
            destination: destination.clone(),
            rows_loaded,
            schema,
        })
    }
}

async fn table_exists_on<'e, E>(executor: E, table: &TableRef) -> Result<bool, WarehouseError>
where
    E: PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
              FROM information_schema.tables
             WHERE table_schema = $1
               AND table_name = $2
        )
        "#,
    )
    .bind(&table.dataset)
    .bind(&table.table)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}

async fn columns_on<'e, E>(executor: E, table: &TableRef) -> Result<TableSchema, WarehouseError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query(
        r#"
        SELECT column_name, data_type, is_nullable
          FROM information_schema.columns
         WHERE table_schema = $1
           AND table_name = $2
         ORDER BY ordinal_position
        "#,
    )
    .bind(&table.dataset)
    .bind(&table.table)
    .fetch_all(executor)
    .await?;

    if rows.is_empty() {
        return Err(WarehouseError::TableNotFound(table.clone()));
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let data_type: String = row.try_get("data_type")?;
        let is_nullable: String = row.try_get("is_nullable")?;
        columns.push(ColumnSpec {
            name: row.try_get("column_name")?,
            column_type: column_type_from_pg(&data_type),
            mode: if is_nullable == "YES" {
                ColumnMode::Nullable
            } else {
                ColumnMode::Required
            },
        });
    }
    Ok(TableSchema::new(columns))
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_type_from_pg(data_type: &str) -> ColumnType {
    match data_type {
        "bigint" | "integer" | "smallint" => ColumnType::Integer,
        "double precision" | "real" | "numeric" => ColumnType::Float,
        "boolean" => ColumnType::Boolean,
        _ => ColumnType::String,
    }
}

pub(crate) fn create_table_sql(table: &TableRef, schema: &TableSchema, if_not_exists: bool) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| {
            let not_null = if c.is_required() { " NOT NULL" } else { "" };
            format!("{} {}{}", quote_ident(&c.name), c.column_type.sql_type(), not_null)
        })
        .collect::<Vec<_>>()
        .join(", ");
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    format!("CREATE TABLE {guard}{} ({columns})", qualified(table))
}

pub(crate) fn merge_sql(target: &TableRef, staging: &TableRef, staged: &TableSchema, key: &str) -> String {
    let columns = column_list(staged);
    let key = quote_ident(key);
    format!(
        "INSERT INTO {target} ({columns}) \
         SELECT {columns} FROM ( \
             SELECT DISTINCT ON (s.{key}) s.* FROM {staging} s \
              WHERE NOT EXISTS (SELECT 1 FROM {target} t WHERE t.{key} = s.{key}) \
         ) new_rows",
        target = qualified(target),
        staging = qualified(staging),
    )
}

pub(crate) fn backlog_sql(base: &TableRef, enriched: &TableRef) -> String {
    let hash = quote_ident(TITLE_HASH_COLUMN);
    let title = quote_ident(TITLE_COLUMN);
    format!(
        "SELECT DISTINCT {hash}::text AS title_hash, {title}::text AS title FROM {base} \
          WHERE {hash} IS NOT NULL AND {title} IS NOT NULL \
         EXCEPT \
         SELECT DISTINCT {hash}::text, {title}::text FROM {enriched} \
         ORDER BY 1, 2",
        base = qualified(base),
        enriched = qualified(enriched),
    )
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        table_exists_on(&self.pool, table).await
    }

    async fn load_csv(
        &self,
        source: &BlobRef,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<LoadReport, WarehouseError> {
        let span = info_span!("pg_load", source = %source, destination = %destination);
        self.load_in_transaction(source, destination, options)
            .instrument(span)
            .await
    }

    async fn merge_insert_only(
        &self,
        target: &TableRef,
        staging: &TableRef,
        key_column: &str,
    ) -> Result<MergeReport, WarehouseError> {
        let staged = columns_on(&self.pool, staging).await?;
        if staged.column(key_column).is_none() {
            return Err(WarehouseError::SchemaMismatch {
                table: staging.clone(),
                message: format!("no identity column {key_column}"),
            });
        }
        let result = sqlx::query(&merge_sql(target, staging, &staged, key_column))
            .execute(&self.pool)
            .await?;
        Ok(MergeReport {
            rows_inserted: result.rows_affected(),
        })
    }

    async fn select_unenriched(
        &self,
        base: &TableRef,
        enriched: &TableRef,
    ) -> Result<Vec<TitleKey>, WarehouseError> {
        let rows = sqlx::query(&backlog_sql(base, enriched))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(TitleKey::new(
                    row.try_get::<String, _>(0)?,
                    row.try_get::<String, _>(1)?,
                ))
            })
            .collect()
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&table.dataset)
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&create_table_sql(table, schema, true))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[Row],
    ) -> Result<Vec<RowError>, WarehouseError> {
        let schema = columns_on(&self.pool, table).await?;
        let placeholders = schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("CAST(${} AS {})", i + 1, c.column_type.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            qualified(table),
            column_list(&schema)
        );

        let mut errors = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            let values = match prepare_row(&schema, row) {
                Ok(values) => values,
                Err(message) => {
                    errors.push(RowError { index, message });
                    continue;
                }
            };
            let mut query = sqlx::query(&statement);
            for value in &values {
                query = query.bind(scalar_text(value));
            }
            match query.execute(&self.pool).await {
                Ok(_) => {}
                Err(sqlx::Error::Database(db_err)) => errors.push(RowError {
                    index,
                    message: db_err.message().to_string(),
                }),
                Err(other) => return Err(other.into()),
            }
        }
        Ok(errors)
    }

    async fn describe_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        let schema = columns_on(&self.pool, table).await?;
        let num_rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", qualified(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(TableInfo {
            table: table.clone(),
            num_rows: num_rows.max(0) as u64,
            schema,
        })
    }
}
