//! External metadata sources: lookup, response classification and payload flattening.

use async_trait::async_trait;
use cinesync_core::Row;
use cinesync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cinesync-adapters";

pub const RATINGS_KEY: &str = "ratings";
pub const RATINGS_FIELD_PREFIX: &str = "ratings_";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response body is not a JSON object")]
    NotAnObject,
}

impl LookupError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LookupError::Fetch(err) if err.is_timeout())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlattenError {
    #[error("ratings field is not a list")]
    RatingsNotAList,
}

/// Result of one lookup. Exactly one of these is produced per attempted title.
#[derive(Debug)]
pub enum LookupOutcome {
    /// Raw response object, keys as the API sent them.
    Found(Row),
    /// The API answered but flagged the title as unknown.
    NotFound { message: String },
    /// Transport error, non-2xx status, timeout or undecodable body.
    Failed(LookupError),
}

impl LookupOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LookupOutcome::Found(_) => "found",
            LookupOutcome::NotFound { .. } => "not_found",
            LookupOutcome::Failed(_) => "failed",
        }
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// One bounded request for `title`. Never returns an error; failures are outcomes.
    async fn lookup(&self, title: &str) -> LookupOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmdbConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
}

/// OMDb title lookup (`?apikey=..&t=..&plot=short`).
pub struct OmdbSource {
    http: HttpFetcher,
    config: OmdbConfig,
}

impl OmdbSource {
    pub fn new(http: HttpFetcher, config: OmdbConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl MetadataSource for OmdbSource {
    fn source_id(&self) -> &'static str {
        "omdb"
    }

    async fn lookup(&self, title: &str) -> LookupOutcome {
        let query = [
            ("apikey", self.config.api_key.as_str()),
            ("t", title),
            ("plot", "short"),
        ];
        match self.http.get(&self.config.base_url, &query).await {
            Ok(resp) => {
                debug!(status = resp.status.as_u16(), bytes = resp.body.len(), "omdb response");
                classify_body(&resp.body)
            }
            Err(err) => LookupOutcome::Failed(err.into()),
        }
    }
}

/// Classify a 2xx response body by its `Response` flag. The flag may be a string
/// (`"True"`/`"False"`) or a JSON boolean; anything else counts as not found.
pub fn classify_body(body: &[u8]) -> LookupOutcome {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => return LookupOutcome::Failed(err.into()),
    };
    let JsonValue::Object(object) = value else {
        return LookupOutcome::Failed(LookupError::NotAnObject);
    };

    if response_flag(object.get("Response")) {
        return LookupOutcome::Found(object);
    }
    let message = object
        .get("Error")
        .and_then(JsonValue::as_str)
        .unwrap_or("response flag not set")
        .to_string();
    LookupOutcome::NotFound { message }
}

fn response_flag(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(flag)) => *flag,
        Some(JsonValue::String(text)) => text.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// `ratings_` plus the source name lower-cased with spaces and hyphens removed.
pub fn rating_field_name(source: &str) -> String {
    format!(
        "{RATINGS_FIELD_PREFIX}{}",
        source.replace([' ', '-'], "").to_lowercase()
    )
}

/// Lower-case every top-level key and add one `ratings_<source>` field per ratings entry.
/// Entries without a string `Source` are ignored. A missing or null ratings value adds
/// nothing; any other non-list value is malformed.
pub fn flatten_payload(raw: Row) -> Result<Row, FlattenError> {
    let mut flat = Row::new();
    for (key, value) in raw {
        flat.insert(key.to_lowercase(), value);
    }

    let ratings = match flat.get(RATINGS_KEY) {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let source = entry.get("Source")?.as_str()?;
                if source.trim().is_empty() {
                    return None;
                }
                let value = entry.get("Value").cloned().unwrap_or(JsonValue::Null);
                Some((rating_field_name(source), value))
            })
            .collect(),
        Some(_) => return Err(FlattenError::RatingsNotAList),
    };
    flat.extend(ratings);
    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn response_flag_accepts_string_and_bool() {
        assert!(matches!(
            classify_body(br#"{"Response":"True","Title":"Heat"}"#),
            LookupOutcome::Found(_)
        ));
        assert!(matches!(
            classify_body(br#"{"Response":true}"#),
            LookupOutcome::Found(_)
        ));
        match classify_body(br#"{"Response":"False","Error":"Movie not found!"}"#) {
            LookupOutcome::NotFound { message } => assert_eq!(message, "Movie not found!"),
            other => panic!("unexpected outcome {}", other.label()),
        }
        assert_eq!(classify_body(br#"{"Title":"Heat"}"#).label(), "not_found");
    }

    #[test]
    fn undecodable_bodies_are_failures() {
        assert!(matches!(
            classify_body(b"<html>rate limited</html>"),
            LookupOutcome::Failed(LookupError::Decode(_))
        ));
        assert!(matches!(
            classify_body(b"[1,2]"),
            LookupOutcome::Failed(LookupError::NotAnObject)
        ));
    }

    #[test]
    fn rating_sources_are_normalized() {
        assert_eq!(
            rating_field_name("Internet Movie Database"),
            "ratings_internetmoviedatabase"
        );
        assert_eq!(rating_field_name("Rotten-Tomatoes"), "ratings_rottentomatoes");
        assert_eq!(rating_field_name("Metacritic"), "ratings_metacritic");
    }

    #[test]
    fn flatten_lowercases_keys_and_expands_ratings() {
        let raw = object(json!({
            "Title": "Heat",
            "BoxOffice": "$67,436,818",
            "Ratings": [
                {"Source": "Internet Movie Database", "Value": "8.3/10"},
                {"Source": "Metacritic", "Value": "76/100"},
                {"Value": "no source"}
            ],
            "Response": "True"
        }));
        let flat = flatten_payload(raw).expect("flatten");
        assert_eq!(flat["title"], json!("Heat"));
        assert_eq!(flat["boxoffice"], json!("$67,436,818"));
        assert_eq!(flat["ratings_internetmoviedatabase"], json!("8.3/10"));
        assert_eq!(flat["ratings_metacritic"], json!("76/100"));
        assert!(!flat.contains_key("Title"));
        assert_eq!(
            flat.keys().filter(|k| k.starts_with(RATINGS_FIELD_PREFIX)).count(),
            2
        );
    }

    #[test]
    fn missing_ratings_is_fine_but_non_list_is_malformed() {
        let flat = flatten_payload(object(json!({"Title": "Heat"}))).expect("flatten");
        assert_eq!(flat.len(), 1);

        let err = flatten_payload(object(json!({"Ratings": "8/10"}))).expect_err("malformed");
        assert_eq!(err, FlattenError::RatingsNotAList);
    }
}
