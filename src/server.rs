//! HTTP API over the building code index.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/search` | Ranked, cited hits for `{ query, k? }` |
//! | `POST`   | `/ask` | Streamed answer (SSE) for `{ query, k?, history? }` |
//! | `POST`   | `/documents` | Ingest `{ document_id, pages }`, replacing any previous version |
//! | `DELETE` | `/documents/{id}` | Remove a document |
//! | `POST`   | `/mcp` | MCP Streamable HTTP endpoint (see [`mcp`](crate::mcp)) |
//!
//! # Streaming
//!
//! `/ask` answers with Server-Sent Events: any number of `token` events,
//! then exactly one of `citations` or `truncated`. Each event's data is the
//! JSON form of the event, e.g. `{"event":"token","text":"Section "}`.
//! Closing the connection drops the answer stream, which stops the
//! generation backend.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `configuration` (400), `not_found` (404),
//! `internal` (500), `generation_failed` (502), `embedding_unavailable` (503),
//! `index_not_ready` (503).

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use buildcode_harness_core::compose::{compose, AnswerEvent};
use buildcode_harness_core::index::VectorIndex;
use buildcode_harness_core::models::{ConversationTurn, RetrievalHit};
use buildcode_harness_core::Error;

use crate::config::Config;
use crate::harness::Harness;
use crate::ingest::{ingest_into_sqlite, IngestReport};
use crate::mcp::McpBridge;
use crate::pages::DocumentUpload;

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let harness = Harness::open(config).await?;
    let app = router(harness);

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    println!("Building code server listening on http://{}", bind_addr);
    println!("MCP endpoint: http://{}/mcp", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// The API routes and the MCP endpoint, with permissive CORS.
pub fn router(harness: Harness) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mcp = {
        let harness = harness.clone();
        StreamableHttpService::new(
            move || Ok(McpBridge::new(harness.clone())),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        )
    };

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/documents", post(handle_ingest))
        .route("/documents/{id}", delete(handle_remove))
        .nest_service("/mcp", mcp)
        .layer(cors)
        .with_state(harness)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::Configuration(_) => (StatusCode::BAD_REQUEST, "configuration"),
            Error::InvalidPage(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::EmbeddingBackend(_) => (StatusCode::SERVICE_UNAVAILABLE, "embedding_unavailable"),
            Error::IndexNotReady { .. } => (StatusCode::SERVICE_UNAVAILABLE, "index_not_ready"),
            Error::GenerationBackend(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
            Error::DimensionMismatch { .. } | Error::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        warn!(error = %err, code, "request failed");
        // Configuration and page errors are actionable by the caller as is.
        let message = match &err {
            Error::Configuration(_) | Error::InvalidPage(_) => err.to_string(),
            _ => err.user_message(),
        };
        AppError {
            status,
            code,
            message,
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    hits: Vec<RetrievalHit>,
}

async fn handle_search(
    State(harness): State<Harness>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    // An empty index answers without touching the embedding backend.
    if harness.index.stats().await?.chunks == 0 {
        return Ok(Json(SearchResponse { hits: Vec::new() }));
    }
    let hits = harness.retriever.retrieve(&req.query, req.k, None).await?;
    Ok(Json(SearchResponse { hits }))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    history: Vec<ConversationTurn>,
}

fn sse_event(event: &AnswerEvent) -> Event {
    let name = match event {
        AnswerEvent::Token { .. } => "token",
        AnswerEvent::Citations { .. } => "citations",
        AnswerEvent::Truncated { .. } => "truncated",
        AnswerEvent::Cancelled => "cancelled",
    };
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(name).data(data)
}

async fn handle_ask(
    State(harness): State<Harness>,
    Json(req): Json<AskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let hits = if harness.index.stats().await?.chunks == 0 {
        Vec::new()
    } else {
        harness
            .retriever
            .retrieve(&req.query, req.k, Some(req.history.as_slice()))
            .await?
    };

    let answer = compose(
        harness.generator.as_ref(),
        &req.query,
        &hits,
        &req.history,
        &harness.config.composer_params(),
    )
    .await?;

    let events = answer.map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ /documents ============

async fn handle_ingest(
    State(harness): State<Harness>,
    Json(upload): Json<DocumentUpload>,
) -> Result<Json<IngestReport>, AppError> {
    let doc = upload
        .into_document()
        .map_err(|e| bad_request(format!("{:#}", e)))?;
    let chunker = harness.config.chunker().map_err(|e| bad_request(e.to_string()))?;
    let report = ingest_into_sqlite(
        &harness.index,
        harness.embedder.as_ref(),
        &chunker,
        harness.config.embedding.batch_size,
        &doc,
    )
    .await?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct RemoveResponse {
    document_id: String,
    removed_chunks: usize,
}

async fn handle_remove(
    State(harness): State<Harness>,
    Path(id): Path<String>,
) -> Result<Json<RemoveResponse>, AppError> {
    let removed = harness.index.remove(&id).await?;
    if removed == 0 {
        return Err(not_found(format!("no document with id: {}", id)));
    }
    Ok(Json(RemoveResponse {
        document_id: id,
        removed_chunks: removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    async fn spawn_server(tmp: &TempDir) -> String {
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("bch.sqlite").display()
        ))
        .unwrap();
        let harness = Harness::open(&config).await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(harness)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let base = spawn_server(&tmp).await;
        let body: Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_search_on_empty_index_returns_no_hits() {
        let tmp = TempDir::new().unwrap();
        let base = spawn_server(&tmp).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/search", base))
            .json(&json!({ "query": "stair riser height" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["hits"], json!([]));
    }

    #[tokio::test]
    async fn test_blank_query_is_bad_request() {
        let tmp = TempDir::new().unwrap();
        let base = spawn_server(&tmp).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/search", base))
            .json(&json!({ "query": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_remove_unknown_document_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let base = spawn_server(&tmp).await;
        let resp = reqwest::Client::new()
            .delete(format!("{}/documents/IBC-2021", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_ingest_with_embeddings_disabled_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let base = spawn_server(&tmp).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/documents", base))
            .json(&json!({
                "document_id": "IBC-2021",
                "pages": [{ "page_number": 1, "text": "Section 1011.5.2 Riser height." }]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "configuration");
    }

    #[tokio::test]
    async fn test_ask_with_generation_disabled_fails_before_streaming() {
        let tmp = TempDir::new().unwrap();
        let base = spawn_server(&tmp).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/ask", base))
            .json(&json!({ "query": "minimum corridor width" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "generation_failed");
    }
}
