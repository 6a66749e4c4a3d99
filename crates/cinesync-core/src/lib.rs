//! Core domain model and pure record transforms for cinesync.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "cinesync-core";

pub const TITLE_COLUMN: &str = "title";
pub const TITLE_HASH_COLUMN: &str = "title_hash";

/// One flat warehouse row, column name to value.
pub type Row = Map<String, JsonValue>;

/// Fully qualified warehouse table (`dataset.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Per-run staging table paired with this target.
    pub fn staging(&self) -> Self {
        Self::new(self.dataset.clone(), format!("{}-staging", self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Enrichment identity: one distinct `(title_hash, title)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TitleKey {
    pub title_hash: String,
    pub title: String,
}

impl TitleKey {
    pub fn new(title_hash: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            title_hash: title_hash.into(),
            title: title.into(),
        }
    }

    pub fn from_title(title: &str) -> Self {
        Self::new(title_hash(title), title)
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(
            TITLE_HASH_COLUMN.to_string(),
            JsonValue::String(self.title_hash.clone()),
        );
        row.insert(TITLE_COLUMN.to_string(), JsonValue::String(self.title.clone()));
        row
    }
}

/// Object-finalized notification identifying exactly one newly arrived blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub bucket: String,
    pub name: String,
}

/// Repair one line of the semicolon-terminated, doubled-quote dialect into standard CSV.
///
/// The result always ends with exactly one `\n`. An empty line comes back as a bare
/// newline so line numbering and quoted multi-line fields survive.
pub fn normalize_line(raw: &str) -> String {
    let mut line = raw.trim_end_matches(&['\r', '\n'][..]);
    if let Some(stripped) = line.strip_suffix(';') {
        line = stripped;
    }
    let mut line = line.replace("\"\"", "\"");
    if line.starts_with('"') && line.ends_with('"') {
        line = if line.len() >= 2 {
            line[1..line.len() - 1].to_string()
        } else {
            String::new()
        };
    }
    line.push('\n');
    line
}

/// Normalize a whole inbound file, line by line, in order.
pub fn normalize_csv(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut out = String::with_capacity(text.len());
    for raw in text.split_inclusive('\n') {
        out.push_str(&normalize_line(raw));
    }
    out
}

/// SHA-256 of the trimmed title, lowercase hex.
pub fn title_hash(title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Merge two flat rows. On a key present in both, the `payload` value wins over `identity`.
pub fn merge_rows(identity: Row, payload: Row) -> Row {
    let mut merged = identity;
    for (key, value) in payload {
        merged.insert(key, value);
    }
    merged
}
