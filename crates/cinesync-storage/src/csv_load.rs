use std::collections::HashSet;

use serde_json::Value as JsonValue;

use crate::{coerce_text, ColumnSpec, ColumnType, LoadOptions, TableSchema, WarehouseError};

/// A parsed CSV source with an inferred schema. Cells are `None` where the source was empty.
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub schema: TableSchema,
    pub records: Vec<Vec<Option<String>>>,
}

impl CsvTable {
    /// Records coerced to the inferred column types.
    pub fn typed_records(&self) -> Vec<Vec<JsonValue>> {
        self.records
            .iter()
            .map(|record| {
                record
                    .iter()
                    .zip(&self.schema.columns)
                    .map(|(cell, column)| match cell {
                        Some(text) => coerce_text(column.column_type, text)
                            .unwrap_or_else(|_| JsonValue::String(text.clone())),
                        None => JsonValue::Null,
                    })
                    .collect()
            })
            .collect()
    }
}

/// Narrowest type that fits every non-empty cell. All-empty columns are strings.
pub fn infer_column_type<'a>(cells: impl IntoIterator<Item = &'a str>) -> ColumnType {
    let mut integer = true;
    let mut float = true;
    let mut boolean = true;
    let mut seen = false;

    for cell in cells {
        seen = true;
        integer &= cell.parse::<i64>().is_ok();
        float &= looks_numeric(cell) && cell.parse::<f64>().is_ok();
        boolean &= cell.eq_ignore_ascii_case("true") || cell.eq_ignore_ascii_case("false");
        if !(integer || float || boolean) {
            break;
        }
    }

    match (seen, integer, float, boolean) {
        (false, ..) => ColumnType::String,
        (true, true, ..) => ColumnType::Integer,
        (true, false, true, _) => ColumnType::Float,
        (true, false, false, true) => ColumnType::Boolean,
        _ => ColumnType::String,
    }
}

// f64 parsing also accepts "inf" and "NaN"; those stay strings.
fn looks_numeric(cell: &str) -> bool {
    cell.chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        && cell.chars().any(|c| c.is_ascii_digit())
}

/// Parse a CSV source according to `options` and infer its schema.
pub fn parse_csv(bytes: &[u8], options: &LoadOptions, uri: &str) -> Result<CsvTable, WarehouseError> {
    let invalid = |message: String| WarehouseError::InvalidSource {
        uri: uri.to_string(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(false)
        .flexible(false)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| invalid(e.to_string()))?;
        rows.push(record.iter().map(ToString::to_string).collect::<Vec<_>>());
    }

    let mut rows = rows.into_iter();
    let header = if options.skip_leading_rows > 0 {
        let header = rows
            .next()
            .ok_or_else(|| invalid("source has no header row".to_string()))?;
        for _ in 1..options.skip_leading_rows {
            rows.next();
        }
        Some(header)
    } else {
        None
    };
    let body: Vec<Vec<String>> = rows.collect();

    let names = match header {
        Some(names) => names,
        None => {
            let width = body.first().map(Vec::len).unwrap_or(0);
            (1..=width).map(|i| format!("column_{i}")).collect()
        }
    };

    let mut seen = HashSet::new();
    for name in &names {
        if name.trim().is_empty() {
            return Err(invalid("empty column name in header".to_string()));
        }
        if !seen.insert(name.as_str()) {
            return Err(invalid(format!("duplicate column name {name:?}")));
        }
    }

    if !options.allow_quoted_newlines {
        let multiline = body
            .iter()
            .flatten()
            .any(|cell| cell.contains('\n') || cell.contains('\r'));
        if multiline {
            return Err(invalid("field contains a newline".to_string()));
        }
    }

    let columns = names
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let cells = body
                .iter()
                .map(|row| row[idx].as_str())
                .filter(|cell| !cell.is_empty());
            ColumnSpec::nullable(name.clone(), infer_column_type(cells))
        })
        .collect();

    let records = body
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| if cell.is_empty() { None } else { Some(cell) })
                .collect()
        })
        .collect();

    Ok(CsvTable {
        schema: TableSchema::new(columns),
        records,
    })
}
