//! HTTP surface for the answer service.
//!
//! - `POST /search` runs retrieval per target and returns display documents per section.
//! - `POST /generate` streams one section's answer as server-sent events.
//! - `POST /` streams answers for several sections (`retrievedResults`).
//! - `GET /` is a liveness check and `GET /metrics` reports pipeline counters.
//! - `OPTIONS` on any path answers CORS preflight requests.
//!
//! Validation failures map to 400 and anything unexpected to 500, both with an
//! `{"error": string}` body.

use crate::logging;
use crate::pipeline::{
    GenerationRequest, RagService, SearchError, SectionDocuments, StreamEvent, ValidationError,
};
use crate::retrieval::{RetrievedPassage, SearchTarget};
use axum::{
    Json, Router,
    extract::{Request, State, rejection::JsonRejection},
    http::{
        HeaderName, HeaderValue, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION,
        },
    },
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, options, post},
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str =
    "authorization, content-type, range, x-amz-date, x-amz-security-token, x-api-key, x-service-name";
const X_ACCEL_BUFFERING: &str = "x-accel-buffering";
const X_REQUEST_ID: &str = "x-request-id";

/// Build the HTTP router over a shared service.
pub fn create_router(service: Arc<RagService>) -> Router {
    Router::new()
        .route("/", get(liveness).post(chat).options(preflight))
        .route("/generate", post(generate).options(preflight))
        .route("/search", post(search).options(preflight))
        .route("/metrics", get(get_metrics))
        .route("/*path", options(preflight))
        .layer(middleware::from_fn(with_request_id))
        .with_state(service)
}

/// Request body for `POST /search`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    #[serde(default, alias = "search_text")]
    search_text: String,
    #[serde(default, alias = "search_target")]
    search_target: Option<SearchTarget>,
}

/// Request body for `POST /generate`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(default, alias = "search_text")]
    search_text: String,
    #[serde(default)]
    documents: Vec<RetrievedPassage>,
    #[serde(default, alias = "section_name")]
    section_name: String,
}

/// Request body for `POST /`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default, alias = "search_text")]
    search_text: String,
    #[serde(default, alias = "retrieved_results")]
    retrieved_results: Vec<SectionDocuments>,
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "statusCode": 200, "message": "success" }))
}

async fn get_metrics(State(service): State<Arc<RagService>>) -> impl IntoResponse {
    Json(service.metrics().snapshot())
}

/// Retrieve and format documents for each requested target.
async fn search(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(SearchRequest {
        search_text,
        search_target,
    }) = payload?;
    if search_text.trim().is_empty() {
        return Err(ValidationError::MissingField("searchText").into());
    }

    let results = service.search().search(&search_text, search_target).await?;
    tracing::info!(sections = results.len(), "Search request completed");
    Ok(Json(json!({
        "statusCode": 200,
        "body": {
            "total": results.len(),
            "results": results,
        }
    })))
}

/// Stream an answer for a single section.
async fn generate(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(GenerateRequest {
        search_text,
        documents,
        section_name,
    }) = payload?;
    let request = GenerationRequest::single(search_text, section_name, documents)?;
    Ok(event_stream(&service, request))
}

/// Stream answers for every retrieved section in order.
async fn chat(
    State(service): State<Arc<RagService>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(ChatRequest {
        search_text,
        retrieved_results,
    }) = payload?;
    let request = GenerationRequest::multi(search_text, retrieved_results)?;
    Ok(event_stream(&service, request))
}

fn event_stream(service: &RagService, request: GenerationRequest) -> Response {
    tracing::info!(sections = request.sections().len(), "Streaming generation started");
    let events = service
        .answers()
        .stream(request, CancellationToken::new())
        .map(|event: StreamEvent| {
            let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok::<_, Infallible>(Event::default().data(json))
        });

    (
        [
            (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (CONNECTION, HeaderValue::from_static("keep-alive")),
            (HeaderName::from_static(X_ACCEL_BUFFERING), HeaderValue::from_static("no")),
        ],
        Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))),
    )
        .into_response()
}

async fn preflight(State(service): State<Arc<RagService>>) -> Response {
    let origin = HeaderValue::from_str(service.allow_origin())
        .unwrap_or_else(|_| HeaderValue::from_static("*"));
    (
        StatusCode::OK,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, origin),
            (ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS)),
            (ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS)),
        ],
    )
        .into_response()
}

async fn with_request_id(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = logging::request_span(&request_id, request.method().as_str(), request.uri().path());
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(X_REQUEST_ID), value);
    }
    response
}

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    MalformedBody(String),
    #[error(transparent)]
    Search(#[from] SearchError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::MalformedBody(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) | Self::MalformedBody(_) => StatusCode::BAD_REQUEST,
            Self::Search(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, "Request failed");
        } else {
            tracing::warn!(error = %message, "Rejected request");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}
