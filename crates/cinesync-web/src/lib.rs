//! HTTP receiver for object-finalized storage events. Each accepted event runs one ingest.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cinesync_core::StorageEvent;
use cinesync_sync::IngestPipeline;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "cinesync-web";

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(ingest: IngestPipeline) -> Self {
        Self {
            ingest: Arc::new(ingest),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event body is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event does not name a bucket and object")]
    MissingObject,
}

#[derive(Debug, Deserialize)]
struct ObjectData {
    bucket: String,
    name: String,
}

/// Decode a storage event from a CloudEvent body. Structured mode wraps the object in
/// `data`; binary mode sends the object as the whole body.
pub fn decode_event(body: &[u8]) -> Result<StorageEvent, EventError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let data = match value.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => value,
    };
    let object: ObjectData = serde_json::from_value(data).map_err(|_| EventError::MissingObject)?;
    if object.bucket.is_empty() || object.name.is_empty() {
        return Err(EventError::MissingObject);
    }
    Ok(StorageEvent {
        bucket: object.bucket,
        name: object.name,
    })
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", post(event_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "event receiver listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn event_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let event = match decode_event(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "rejected storage event");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
                .into_response();
        }
    };

    match state.ingest.run(&event).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => {
            error!(bucket = %event.bucket, name = %event.name, error = ?err, "ingest failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{err:#}") })),
            )
                .into_response()
        }
    }
}
