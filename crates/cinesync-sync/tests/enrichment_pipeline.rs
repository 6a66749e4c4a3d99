use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cinesync_adapters::{LookupError, LookupOutcome, MetadataSource, OmdbConfig};
use cinesync_core::{Row, TableRef, TitleKey};
use cinesync_storage::{
    scalar_text, ColumnSpec, ColumnType, LocalBlobStore, MemoryWarehouse, TableSchema, Throttle,
    Warehouse,
};
use cinesync_sync::{EnrichConfig, EnrichmentPipeline};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Reply {
    Found,
    FoundAs(&'static str),
    ListGenre,
    BadRatings,
    NotFound,
    Fail,
}

#[derive(Default)]
struct FakeSource {
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<String>>,
}

impl FakeSource {
    fn with(replies: &[(&str, Reply)]) -> Self {
        Self {
            replies: replies
                .iter()
                .map(|(title, reply)| (title.to_string(), *reply))
                .collect(),
            calls: Mutex::default(),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

fn object(value: JsonValue) -> Row {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    fn source_id(&self) -> &'static str {
        "fake"
    }

    async fn lookup(&self, title: &str) -> LookupOutcome {
        self.calls.lock().expect("calls lock").push(title.to_string());
        match self.replies.get(title).copied().unwrap_or(Reply::Found) {
            Reply::Found => LookupOutcome::Found(object(json!({
                "Title": title,
                "Genre": "Drama",
                "Ratings": [{"Source": "Rotten Tomatoes", "Value": "91%"}],
                "Response": "True"
            }))),
            Reply::FoundAs(canonical) => LookupOutcome::Found(object(json!({
                "Title": canonical,
                "Genre": "Crime",
                "Response": "True"
            }))),
            Reply::ListGenre => LookupOutcome::Found(object(json!({
                "Title": title,
                "Genre": ["Drama", "Crime"],
                "Response": "True"
            }))),
            Reply::BadRatings => LookupOutcome::Found(object(json!({
                "Title": title,
                "Ratings": "n/a",
                "Response": "True"
            }))),
            Reply::NotFound => LookupOutcome::NotFound {
                message: "Movie not found!".to_string(),
            },
            Reply::Fail => LookupOutcome::Failed(LookupError::NotAnObject),
        }
    }
}

struct Harness {
    _dir: TempDir,
    warehouse: Arc<MemoryWarehouse>,
    config: EnrichConfig,
}

fn base() -> TableRef {
    TableRef::new("catalog", "movies")
}

fn enriched() -> TableRef {
    TableRef::new("catalog", "movies_enriched")
}

async fn harness(titles: &[&str], max_queries: usize) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let blobs = Arc::new(LocalBlobStore::new(dir.path()));
    let warehouse = Arc::new(MemoryWarehouse::new(blobs));

    let schema = TableSchema::new(vec![
        ColumnSpec::nullable("id", ColumnType::Integer),
        ColumnSpec::nullable("title", ColumnType::String),
        ColumnSpec::nullable("title_hash", ColumnType::String),
    ]);
    let rows = titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            let mut row = TitleKey::from_title(title).to_row();
            row.insert("id".to_string(), json!(i as i64 + 1));
            row
        })
        .collect();
    warehouse.put_table(&base(), schema, rows).await;

    let config = EnrichConfig {
        database_url: String::new(),
        blob_root: dir.path().to_path_buf(),
        base_table: base(),
        enriched_table: enriched(),
        omdb: OmdbConfig {
            base_url: "http://unused.invalid/".to_string(),
            api_key: "k".to_string(),
        },
        max_queries,
        call_interval: Duration::from_millis(300),
        http_timeout_secs: 15,
        user_agent: "cinesync-test".to_string(),
    };
    Harness {
        _dir: dir,
        warehouse,
        config,
    }
}

fn pipeline(h: &Harness, source: Arc<FakeSource>) -> EnrichmentPipeline {
    EnrichmentPipeline::new(h.warehouse.clone(), source, &h.config)
        .with_throttle(Throttle::new(Duration::ZERO))
}

async fn enriched_titles(h: &Harness) -> Vec<String> {
    let mut titles: Vec<String> = h
        .warehouse
        .rows(&enriched())
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|row| row.get("title").and_then(scalar_text))
        .collect();
    titles.sort();
    titles
}

#[tokio::test]
async fn cap_bounds_external_calls() {
    let h = harness(&["A", "B", "C", "D", "E"], 2).await;
    let source = Arc::new(FakeSource::default());
    let summary = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(1))
        .await
        .expect("run");

    assert_eq!(summary.backlog, 5);
    assert_eq!(summary.attempted, 2);
    assert_eq!(source.calls().len(), 2);
    assert_eq!(summary.enriched, 2);
    assert_eq!(enriched_titles(&h).await.len(), 2);
}

#[tokio::test]
async fn failures_never_stop_later_items() {
    let h = harness(&["Lost", "Broken", "Heat", "Weird"], 10).await;
    let source = Arc::new(FakeSource::with(&[
        ("Lost", Reply::NotFound),
        ("Broken", Reply::Fail),
        ("Weird", Reply::BadRatings),
    ]));
    let summary = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(9))
        .await
        .expect("run");

    let mut calls = source.calls();
    calls.sort();
    assert_eq!(calls, vec!["Broken", "Heat", "Lost", "Weird"]);
    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.enriched, 1);
    assert_eq!(enriched_titles(&h).await, vec!["Heat"]);
}

#[tokio::test]
async fn enriched_rows_carry_identity_and_flattened_fields() {
    let h = harness(&["Heat"], 5).await;
    let source = Arc::new(FakeSource::default());
    pipeline(&h, source)
        .run_with_rng(&mut StdRng::seed_from_u64(3))
        .await
        .expect("run");

    let rows = h.warehouse.rows(&enriched()).await.expect("enriched table");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["title_hash"], json!(cinesync_core::title_hash("Heat")));
    assert_eq!(row["genre"], json!("Drama"));
    assert_eq!(row["ratings_rottentomatoes"], json!("91%"));
    assert_eq!(row["director"], JsonValue::Null);
    assert!(!row.contains_key("response"));
}

#[tokio::test]
async fn rejected_rows_are_counted_and_the_loop_continues() {
    let h = harness(&["Blank", "Heat"], 5).await;
    let source = Arc::new(FakeSource::with(&[("Blank", Reply::ListGenre)]));
    let summary = pipeline(&h, source)
        .run_with_rng(&mut StdRng::seed_from_u64(5))
        .await
        .expect("run");

    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.enriched, 1);
    assert_eq!(enriched_titles(&h).await, vec!["Heat"]);
}

#[tokio::test]
async fn api_spelling_of_the_title_does_not_reopen_the_backlog() {
    let h = harness(&["heat"], 5).await;
    let source = Arc::new(FakeSource::with(&[("heat", Reply::FoundAs("Heat"))]));

    let first = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(1))
        .await
        .expect("first run");
    assert_eq!(first.enriched, 1);

    let second = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(2))
        .await
        .expect("second run");
    assert_eq!(second.backlog, 0);
    assert_eq!(second.attempted, 0);
    assert_eq!(source.calls(), vec!["heat"]);

    let rows = h.warehouse.rows(&enriched()).await.expect("enriched table");
    assert_eq!(rows.len(), 1);
    let key = TitleKey::from_title("heat");
    assert_eq!(rows[0].get("title").and_then(scalar_text).as_deref(), Some("heat"));
    assert_eq!(
        rows[0].get("title_hash").and_then(scalar_text),
        Some(key.title_hash.clone())
    );
    assert_eq!(rows[0].get("genre").and_then(scalar_text).as_deref(), Some("Crime"));
}

#[tokio::test]
async fn enriched_titles_are_not_selected_again() {
    let h = harness(&["A", "B", "C"], 2).await;
    let source = Arc::new(FakeSource::default());
    let first = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(11))
        .await
        .expect("first run");
    assert_eq!(first.backlog, 3);

    let second = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(12))
        .await
        .expect("second run");
    assert_eq!(second.backlog, 1);
    assert_eq!(second.attempted, 1);

    let third = pipeline(&h, source.clone())
        .run_with_rng(&mut StdRng::seed_from_u64(13))
        .await
        .expect("third run");
    assert_eq!(third.backlog, 0);

    let mut calls = source.calls();
    calls.sort();
    assert_eq!(calls, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn same_seed_gives_same_call_order() {
    let order = |seed| async move {
        let h = harness(&["A", "B", "C", "D", "E", "F"], 6).await;
        let source = Arc::new(FakeSource::with(&[
            ("A", Reply::NotFound),
            ("B", Reply::NotFound),
            ("C", Reply::NotFound),
            ("D", Reply::NotFound),
            ("E", Reply::NotFound),
            ("F", Reply::NotFound),
        ]));
        pipeline(&h, source.clone())
            .run_with_rng(&mut StdRng::seed_from_u64(seed))
            .await
            .expect("run");
        source.calls()
    };
    assert_eq!(order(21).await, order(21).await);
}

#[tokio::test]
async fn enriched_table_is_created_once() {
    let h = harness(&[], 1).await;
    let pipeline = pipeline(&h, Arc::new(FakeSource::default()));
    assert!(pipeline.ensure_enriched_table().await.expect("create"));
    assert!(!pipeline.ensure_enriched_table().await.expect("exists"));
    let info = h.warehouse.describe_table(&enriched()).await.expect("describe");
    assert_eq!(info.schema.columns.len(), 12);
}

#[tokio::test]
async fn missing_base_table_is_fatal() {
    let h = harness(&[], 1).await;
    let missing = EnrichConfig {
        base_table: TableRef::new("catalog", "nope"),
        ..h.config.clone()
    };
    let source = Arc::new(FakeSource::default());
    let err = EnrichmentPipeline::new(h.warehouse.clone(), source.clone(), &missing)
        .with_throttle(Throttle::new(Duration::ZERO))
        .run_with_rng(&mut StdRng::seed_from_u64(1))
        .await
        .expect_err("fatal");
    assert!(format!("{err:#}").contains("not found"));
    assert!(source.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn every_call_waits_the_configured_interval() {
    let h = harness(&["A", "B", "C"], 3).await;
    let source = Arc::new(FakeSource::with(&[
        ("A", Reply::Fail),
        ("B", Reply::Fail),
        ("C", Reply::Fail),
    ]));
    let pipeline = EnrichmentPipeline::new(h.warehouse.clone(), source, &h.config);
    let started = tokio::time::Instant::now();
    let summary = pipeline
        .run_with_rng(&mut StdRng::seed_from_u64(2))
        .await
        .expect("run");
    assert_eq!(summary.failed, 3);
    assert!(started.elapsed() >= Duration::from_millis(900));
}
