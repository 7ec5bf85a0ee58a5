//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/documents` | Caller's documents, newest first |
//! | `POST`   | `/documents?filename=…&content_type=…` | Upload raw bytes; 202 + pending document |
//! | `GET`    | `/documents/{id}` | One document |
//! | `DELETE` | `/documents/{id}` | Delete a document and its chunks |
//! | `POST`   | `/search` | Hybrid search |
//! | `GET`    | `/threads/{id}/messages` | Thread history |
//! | `POST`   | `/threads/{id}/messages` | Send a message; SSE response |
//! | `GET`    | `/settings` | Current settings, credentials redacted (admin) |
//! | `PUT`    | `/settings` | Partial settings update (admin) |
//! | `POST`   | `/eval` | Retrieval evaluation |
//!
//! # Identity
//!
//! The server sits behind an authenticating proxy. The caller's owner id
//! is taken from the `x-owner-id` header and admin rights from
//! `x-admin: true`. Requests without an owner id are rejected with 401.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "duplicate_content", "message": "…" } }
//! ```
//!
//! Codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `duplicate_content` (409), `embedding_locked` (409),
//! `unavailable` (503), `internal` (500).

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};

use crate::agent::{self, events::EventSink, TurnRequest};
use crate::error::{IngestError, SearchError, SettingsError};
use crate::ingest::{self, UploadRequest};
use crate::models::{Document, Message, MetadataFilter, SearchRow};
use crate::retrieval::{self, eval};
use crate::services::{Services, Session};
use crate::settings::SettingsUpdate;

/// Events buffered per chat stream before the turn waits on the client.
const EVENT_BUFFER: usize = 64;

/// Serve until the process is terminated.
pub async fn run_server(services: Services) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let app = router(services);

    tracing::info!(addr = %bind_addr, "docent server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Let oversized uploads reach validation so the error is ours.
    let body_limit = services.config.chunking.max_upload_bytes + 1024 * 1024;

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", get(handle_list_documents).post(handle_upload))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_delete_document),
        )
        .route("/search", post(handle_search))
        .route(
            "/threads/{id}/messages",
            get(handle_list_messages).post(handle_send_message),
        )
        .route("/settings", get(handle_get_settings).put(handle_put_settings))
        .route("/eval", post(handle_eval))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(services)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

fn unavailable(err: impl std::fmt::Display) -> AppError {
    AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", err.to_string())
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(format!("{:#}", err))
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::Validation(_) => bad_request(err.to_string()),
            IngestError::DuplicateContent { existing_id, .. } => AppError::new(
                StatusCode::CONFLICT,
                "duplicate_content",
                format!("{} (document_id: {})", err, existing_id),
            ),
            IngestError::NotFound(_) => not_found(err.to_string()),
            IngestError::Stage { .. } | IngestError::Backend(_) => internal(&err),
        }
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::EmptyQuery => bad_request(err.to_string()),
            SearchError::BackendUnavailable { .. } => unavailable(err),
        }
    }
}

impl From<SettingsError> for AppError {
    fn from(err: SettingsError) -> Self {
        match &err {
            SettingsError::Forbidden => {
                AppError::new(StatusCode::FORBIDDEN, "forbidden", err.to_string())
            }
            SettingsError::EmbeddingLocked { .. } => {
                AppError::new(StatusCode::CONFLICT, "embedding_locked", err.to_string())
            }
            SettingsError::Invalid(_) => bad_request(err.to_string()),
            SettingsError::Backend(_) => internal(&err),
        }
    }
}

// ============ Identity ============

/// The authenticated caller, as asserted by the fronting proxy.
#[derive(Debug, Clone)]
pub struct Caller {
    pub owner_id: String,
    pub is_admin: bool,
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get("x-owner-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing x-owner-id header")
            })?;
        let is_admin = parts
            .headers
            .get("x-admin")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        Ok(Caller {
            owner_id: owner_id.to_string(),
            is_admin,
        })
    }
}

fn session(services: &Services) -> Result<Session, AppError> {
    services.session().map_err(|e| unavailable(format!("{:#}", e)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Documents ============

async fn handle_list_documents(
    State(services): State<Services>,
    caller: Caller,
) -> Result<Json<Vec<Document>>, AppError> {
    Ok(Json(services.store.list_documents(&caller.owner_id).await?))
}

#[derive(Deserialize)]
struct UploadParams {
    filename: String,
    content_type: Option<String>,
}

async fn handle_upload(
    State(services): State<Services>,
    caller: Caller,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let session = session(&services)?;
    let doc = ingest::upload(
        &session,
        UploadRequest {
            owner_id: caller.owner_id.clone(),
            filename: params.filename,
            content_type: params.content_type,
            bytes: body.to_vec(),
        },
    )
    .await?;
    ingest::spawn_processing(services, caller.owner_id, doc.id.clone());
    Ok((StatusCode::ACCEPTED, Json(doc)))
}

async fn handle_get_document(
    State(services): State<Services>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    services
        .store
        .get_document(&caller.owner_id, &id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("document not found: {}", id)))
}

async fn handle_delete_document(
    State(services): State<Services>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let doc = services
        .store
        .get_document(&caller.owner_id, &id)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", id)))?;
    services.store.delete_document(&caller.owner_id, &id).await?;
    if let Err(e) = services.objects.delete(&doc.storage_path).await {
        tracing::warn!(path = %doc.storage_path, error = %e, "failed to delete raw file");
    }
    tracing::info!(owner = %caller.owner_id, id = %id, "document deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    top_k: Option<usize>,
    #[serde(default)]
    filters: Option<Value>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchRow>,
}

async fn handle_search(
    State(services): State<Services>,
    caller: Caller,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    let session = session(&services)?;
    let top_k = requested_top_k(body.top_k, services.config.retrieval.default_top_k)?;
    let filter = MetadataFilter::from_value(body.filters.as_ref());
    let results =
        retrieval::search(&session, &caller.owner_id, &body.query, top_k, filter.as_ref()).await?;
    Ok(Json(SearchResponse { results }))
}

fn requested_top_k(requested: Option<usize>, default: usize) -> Result<usize, AppError> {
    retrieval::check_top_k(requested.unwrap_or(default)).map_err(bad_request)
}

// ============ Threads ============

async fn handle_list_messages(
    State(services): State<Services>,
    caller: Caller,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    Ok(Json(
        services
            .store
            .list_messages(&caller.owner_id, &thread_id)
            .await?,
    ))
}

#[derive(Deserialize)]
struct SendMessageBody {
    content: String,
}

async fn handle_send_message(
    State(services): State<Services>,
    caller: Caller,
    Path(thread_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if body.content.trim().is_empty() {
        return Err(bad_request("content must not be empty"));
    }
    let session = session(&services)?;
    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let request = TurnRequest {
        owner_id: caller.owner_id,
        thread_id,
        content: body.content,
    };
    tokio::spawn(async move {
        agent::run_turn(&session, request, sink).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .event(event.name())
            .data(event.data().to_string());
        Some((Ok(sse), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ Settings ============

async fn handle_get_settings(
    State(services): State<Services>,
    caller: Caller,
) -> Result<Json<Value>, AppError> {
    if !caller.is_admin {
        return Err(SettingsError::Forbidden.into());
    }
    Ok(Json(services.settings.snapshot().redacted()))
}

async fn handle_put_settings(
    State(services): State<Services>,
    caller: Caller,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<Value>, AppError> {
    let updated = services
        .settings
        .update(caller.is_admin, &update, services.store.as_ref())
        .await?;
    Ok(Json(updated.redacted()))
}

// ============ POST /eval ============

#[derive(Deserialize)]
struct EvalBody {
    #[serde(default)]
    cases: Vec<eval::EvalCase>,
    /// Generate this many cases from the caller's documents when `cases`
    /// is empty.
    #[serde(default)]
    generate: Option<usize>,
    top_k: Option<usize>,
}

async fn handle_eval(
    State(services): State<Services>,
    caller: Caller,
    Json(body): Json<EvalBody>,
) -> Result<Json<Value>, AppError> {
    let session = session(&services)?;
    let top_k = requested_top_k(body.top_k, 10)?;
    let cases = if body.cases.is_empty() {
        let n = body.generate.unwrap_or(10);
        eval::generate_cases(&session, &caller.owner_id, n).await?
    } else {
        body.cases
    };
    if cases.is_empty() {
        return Err(bad_request("no eval cases given and none could be generated"));
    }
    let summary = eval::run_eval(&session, &caller.owner_id, &cases, top_k).await;
    Ok(Json(json!({ "cases": cases, "summary": summary })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::mock::HashEmbedder;
    use crate::llm::mock::ScriptedChatModel;
    use crate::objects::MemoryObjectStore;
    use crate::services::FixedProviders;
    use crate::store::memory::InMemoryStore;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_services(chat: ScriptedChatModel) -> Services {
        let config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
        Services::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(FixedProviders::new(
                Arc::new(chat),
                Arc::new(HashEmbedder::new(32)),
            )),
        )
    }

    fn request(method: Method, uri: &str, owner: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(owner) = owner {
            builder = builder.header("x-owner-id", owner);
        }
        builder.body(body).expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        let response = app
            .oneshot(request(Method::GET, "/health", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_owner_is_unauthorized() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        let response = app
            .oneshot(request(Method::GET, "/documents", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_upload_then_duplicate_conflict() {
        let app = router(test_services(ScriptedChatModel::always("context")));
        let upload = || {
            request(
                Method::POST,
                "/documents?filename=notes.txt",
                Some("alice"),
                Body::from("The Eiffel Tower is 330 metres tall."),
            )
        };

        let response = app.clone().oneshot(upload()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let doc = json_body(response).await;
        assert_eq!(doc["filename"], "notes.txt");
        assert_eq!(doc["content_type"], "text/plain");
        let id = doc["id"].as_str().unwrap().to_string();

        let response = app.clone().oneshot(upload()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let err = json_body(response).await;
        assert_eq!(err["error"]["code"], "duplicate_content");
        assert!(err["error"]["message"].as_str().unwrap().contains(&id));

        // Another owner sees nothing.
        let response = app
            .oneshot(request(
                Method::GET,
                &format!("/documents/{}", id),
                Some("bob"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_rejects_unsupported_type() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        let response = app
            .oneshot(request(
                Method::POST,
                "/documents?filename=tool.exe",
                Some("alice"),
                Body::from(vec![0u8, 1, 2]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_unknown_document() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        let response = app
            .oneshot(request(
                Method::DELETE,
                "/documents/missing",
                Some("alice"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_search_empty_query_is_bad_request() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        let response = app
            .oneshot(request(
                Method::POST,
                "/search",
                Some("alice"),
                Body::from(json!({"query": "   "}).to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_out_of_range_top_k_is_bad_request() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        for (uri, body) in [
            ("/search", json!({"query": "tower", "top_k": usize::MAX / 2 + 1})),
            ("/search", json!({"query": "tower", "top_k": 0})),
            ("/eval", json!({"cases": [{"question": "q", "expected_keywords": ["k"]}], "top_k": 51})),
        ] {
            let response = app
                .clone()
                .oneshot(request(Method::POST, uri, Some("alice"), Body::from(body.to_string())))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{} {}", uri, body);
            let body = json_body(response).await;
            assert_eq!(body["error"]["code"], "bad_request");
            assert!(body["error"]["message"].as_str().unwrap().contains("top_k"));
        }
    }

    #[tokio::test]
    async fn test_settings_require_admin() {
        let app = router(test_services(ScriptedChatModel::always("ok")));
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/settings", Some("alice"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let mut admin = request(Method::GET, "/settings", Some("root"), Body::empty());
        admin
            .headers_mut()
            .insert("x-admin", "true".parse().unwrap());
        let response = app.oneshot(admin).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_send_message_streams_events_and_persists() {
        let services = test_services(ScriptedChatModel::always("Hi!"));
        let app = router(services.clone());
        let response = app
            .oneshot(request(
                Method::POST,
                "/threads/t1/messages",
                Some("alice"),
                Body::from(json!({"content": "hello"}).to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: text_delta"));
        assert!(text.contains("event: done"));
        let text_at = text.find("event: text_delta").unwrap();
        assert!(text_at < text.find("event: done").unwrap());

        let history = services.store.list_messages("alice", "t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Hi!");
    }
}
