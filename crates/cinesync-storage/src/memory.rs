use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cinesync_core::{Row, TableRef, TitleKey, TITLE_COLUMN, TITLE_HASH_COLUMN};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    parse_csv, prepare_row, scalar_text, BlobRef, BlobStore, LoadOptions, LoadReport,
    MergeReport, RowError, TableInfo, TableSchema, Warehouse, WarehouseError,
};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Row>,
}

/// In-process warehouse with the same load/merge/select semantics as [`crate::PgWarehouse`].
#[derive(Clone)]
pub struct MemoryWarehouse {
    blobs: Arc<dyn BlobStore>,
    tables: Arc<Mutex<HashMap<TableRef, MemoryTable>>>,
}

impl MemoryWarehouse {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            tables: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot of a table's rows, in insertion order.
    pub async fn rows(&self, table: &TableRef) -> Option<Vec<Row>> {
        self.tables.lock().await.get(table).map(|t| t.rows.clone())
    }

    /// Seed a table directly, replacing any existing one.
    pub async fn put_table(&self, table: &TableRef, schema: TableSchema, rows: Vec<Row>) {
        self.tables
            .lock()
            .await
            .insert(table.clone(), MemoryTable { schema, rows });
    }
}

fn row_from_values(schema: &TableSchema, values: Vec<JsonValue>) -> Row {
    schema
        .columns
        .iter()
        .map(|c| c.name.clone())
        .zip(values)
        .collect()
}

fn key_of(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(scalar_text)
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        Ok(self.tables.lock().await.contains_key(table))
    }

    async fn load_csv(
        &self,
        source: &BlobRef,
        destination: &TableRef,
        options: &LoadOptions,
    ) -> Result<LoadReport, WarehouseError> {
        let bytes = self.blobs.download(source).await?;
        let parsed = parse_csv(&bytes, options, &source.uri())?;
        let loaded: Vec<Row> = parsed
            .typed_records()
            .into_iter()
            .map(|values| row_from_values(&parsed.schema, values))
            .collect();
        let rows_loaded = loaded.len() as u64;

        let mut tables = self.tables.lock().await;
        let schema = match tables.get_mut(destination) {
            Some(existing) if !options.overwrite => {
                for column in &parsed.schema.columns {
                    if existing.schema.column(&column.name).is_none() {
                        return Err(WarehouseError::SchemaMismatch {
                            table: destination.clone(),
                            message: format!("no such column {}", column.name),
                        });
                    }
                }
                existing.rows.extend(loaded);
                existing.schema.clone()
            }
            _ => {
                tables.insert(
                    destination.clone(),
                    MemoryTable {
                        schema: parsed.schema.clone(),
                        rows: loaded,
                    },
                );
                parsed.schema
            }
        };

        Ok(LoadReport {
            destination: destination.clone(),
            rows_loaded,
            schema,
        })
    }

    async fn merge_insert_only(
        &self,
        target: &TableRef,
        staging: &TableRef,
        key_column: &str,
    ) -> Result<MergeReport, WarehouseError> {
        let mut tables = self.tables.lock().await;
        let staged = tables
            .get(staging)
            .cloned()
            .ok_or_else(|| WarehouseError::TableNotFound(staging.clone()))?;
        let target_table = tables
            .get_mut(target)
            .ok_or_else(|| WarehouseError::TableNotFound(target.clone()))?;

        for column in &staged.schema.columns {
            if target_table.schema.column(&column.name).is_none() {
                return Err(WarehouseError::SchemaMismatch {
                    table: target.clone(),
                    message: format!("no such column {}", column.name),
                });
            }
        }
        if staged.schema.column(key_column).is_none() {
            return Err(WarehouseError::SchemaMismatch {
                table: staging.clone(),
                message: format!("no identity column {key_column}"),
            });
        }

        let existing: HashSet<String> = target_table
            .rows
            .iter()
            .filter_map(|row| key_of(row, key_column))
            .collect();
        let mut staged_keys: HashSet<Option<String>> = HashSet::new();
        let mut inserted = Vec::new();
        for row in staged.rows {
            let key = key_of(&row, key_column);
            if key.as_ref().is_some_and(|k| existing.contains(k)) {
                continue;
            }
            if !staged_keys.insert(key) {
                continue;
            }
            let projected: Row = target_table
                .schema
                .columns
                .iter()
                .map(|c| {
                    let value = row.get(&c.name).cloned().unwrap_or(JsonValue::Null);
                    (c.name.clone(), value)
                })
                .collect();
            inserted.push(projected);
        }

        let rows_inserted = inserted.len() as u64;
        target_table.rows.extend(inserted);
        Ok(MergeReport { rows_inserted })
    }

    async fn select_unenriched(
        &self,
        base: &TableRef,
        enriched: &TableRef,
    ) -> Result<Vec<TitleKey>, WarehouseError> {
        let tables = self.tables.lock().await;
        let distinct_keys = |table: &TableRef| -> Result<BTreeSet<TitleKey>, WarehouseError> {
            let found = tables
                .get(table)
                .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
            for column in [TITLE_HASH_COLUMN, TITLE_COLUMN] {
                if found.schema.column(column).is_none() {
                    return Err(WarehouseError::SchemaMismatch {
                        table: table.clone(),
                        message: format!("no such column {column}"),
                    });
                }
            }
            Ok(found
                .rows
                .iter()
                .filter_map(|row| {
                    Some(TitleKey::new(
                        key_of(row, TITLE_HASH_COLUMN)?,
                        key_of(row, TITLE_COLUMN)?,
                    ))
                })
                .collect())
        };

        let done = distinct_keys(enriched)?;
        Ok(distinct_keys(base)?.difference(&done).cloned().collect())
    }

    async fn create_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        self.tables
            .lock()
            .await
            .entry(table.clone())
            .or_insert_with(|| MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: &[Row],
    ) -> Result<Vec<RowError>, WarehouseError> {
        let mut tables = self.tables.lock().await;
        let found = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;

        let mut errors = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            match prepare_row(&found.schema, row) {
                Ok(values) => {
                    let stored = row_from_values(&found.schema, values);
                    found.rows.push(stored);
                }
                Err(message) => errors.push(RowError { index, message }),
            }
        }
        Ok(errors)
    }

    async fn describe_table(&self, table: &TableRef) -> Result<TableInfo, WarehouseError> {
        let tables = self.tables.lock().await;
        let found = tables
            .get(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        Ok(TableInfo {
            table: table.clone(),
            num_rows: found.rows.len() as u64,
            schema: found.schema.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColumnSpec, ColumnType, LocalBlobStore};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn warehouse() -> (TempDir, Arc<LocalBlobStore>, MemoryWarehouse) {
        let dir = tempdir().expect("tempdir");
        let blobs = Arc::new(LocalBlobStore::new(dir.path()));
        let warehouse = MemoryWarehouse::new(blobs.clone());
        (dir, blobs, warehouse)
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        let mut ids: Vec<i64> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn merge_inserts_only_new_identities() {
        let (_dir, blobs, warehouse) = warehouse();
        let target = TableRef::new("ds", "movies");
        let staging = target.staging();

        let first = BlobRef::new("tmp", "a.csv");
        blobs
            .upload(&first, b"id,title\n1,Heat\n2,Up\n", "text/csv")
            .await
            .unwrap();
        let second = BlobRef::new("tmp", "b.csv");
        blobs
            .upload(&second, b"id,title\n2,Up again\n3,Alien\n", "text/csv")
            .await
            .unwrap();

        let options = LoadOptions::default();
        warehouse.load_csv(&first, &target, &options).await.unwrap();
        warehouse.load_csv(&second, &staging, &options).await.unwrap();

        let report = warehouse
            .merge_insert_only(&target, &staging, "id")
            .await
            .unwrap();
        assert_eq!(report.rows_inserted, 1);

        let rows = warehouse.rows(&target).await.unwrap();
        assert_eq!(ids(&rows), vec![1, 2, 3]);
        let two = rows.iter().find(|r| r["id"] == json!(2)).unwrap();
        assert_eq!(two["title"], json!("Up"));

        let again = warehouse
            .merge_insert_only(&target, &staging, "id")
            .await
            .unwrap();
        assert_eq!(again.rows_inserted, 0);
    }

    #[tokio::test]
    async fn overwrite_load_replaces_and_append_load_extends() {
        let (_dir, blobs, warehouse) = warehouse();
        let table = TableRef::new("ds", "movies-staging");
        let blob = BlobRef::new("tmp", "a.csv");
        blobs
            .upload(&blob, b"id,title\n1,Heat\n", "text/csv")
            .await
            .unwrap();

        let options = LoadOptions::default();
        warehouse.load_csv(&blob, &table, &options).await.unwrap();
        warehouse.load_csv(&blob, &table, &options).await.unwrap();
        assert_eq!(warehouse.rows(&table).await.unwrap().len(), 1);

        let append = LoadOptions {
            overwrite: false,
            ..options
        };
        warehouse.load_csv(&blob, &table, &append).await.unwrap();
        assert_eq!(warehouse.rows(&table).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn select_unenriched_is_a_pair_difference() {
        let (_dir, _blobs, warehouse) = warehouse();
        let base = TableRef::new("ds", "movies");
        let enriched = TableRef::new("ds", "movies-enriched");
        let schema = TableSchema::new(vec![
            ColumnSpec::required("title_hash", ColumnType::String),
            ColumnSpec::required("title", ColumnType::String),
        ]);
        let rows = |keys: &[(&str, &str)]| {
            keys.iter()
                .map(|(h, t)| TitleKey::new(*h, *t).to_row())
                .collect::<Vec<_>>()
        };

        warehouse
            .put_table(
                &base,
                schema.clone(),
                rows(&[("a", "A"), ("b", "B"), ("c", "C"), ("b", "B")]),
            )
            .await;
        warehouse
            .put_table(&enriched, schema, rows(&[("a", "A"), ("c", "not C")]))
            .await;

        let backlog = warehouse.select_unenriched(&base, &enriched).await.unwrap();
        assert_eq!(
            backlog,
            vec![TitleKey::new("b", "B"), TitleKey::new("c", "C")]
        );
    }

    #[tokio::test]
    async fn insert_rows_reports_rejections_per_row() {
        let (_dir, _blobs, warehouse) = warehouse();
        let table = TableRef::new("ds", "movies-enriched");
        let schema = TableSchema::new(vec![
            ColumnSpec::required("title_hash", ColumnType::String),
            ColumnSpec::required("title", ColumnType::String),
            ColumnSpec::nullable("genre", ColumnType::String),
        ]);
        warehouse.create_table(&table, &schema).await.unwrap();

        let mut good = TitleKey::new("h1", "Heat").to_row();
        good.insert("genre".into(), json!("Crime"));
        good.insert("plot".into(), json!("ignored"));
        let mut bad = Row::new();
        bad.insert("title_hash".into(), json!("h2"));

        let errors = warehouse
            .insert_rows(&table, &[bad, good])
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].index, 0);

        let rows = warehouse.rows(&table).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].get("plot").is_none());
        assert_eq!(rows[0]["genre"], json!("Crime"));
    }

    #[tokio::test]
    async fn missing_tables_are_errors_not_empty_results() {
        let (_dir, _blobs, warehouse) = warehouse();
        let base = TableRef::new("ds", "movies");
        assert!(!warehouse.table_exists(&base).await.unwrap());
        let err = warehouse
            .select_unenriched(&base, &base)
            .await
            .expect_err("missing");
        assert!(matches!(err, WarehouseError::TableNotFound(_)));
    }
}
