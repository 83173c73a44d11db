//! HTTP API: thin glue over the engine handle, store and change stream.
//!
//! Routes:
//! - `POST /api/add-nodes` — submit a batch of nodes, returns assigned ids
//! - `POST /api/kill` — enqueue kills, ack only
//! - `GET /api/target/:id` — full node plus flattened history
//! - `GET /api/changes` — server-sent events from the rate-limited stream
//!
//! Every request must carry a bearer token from the configured token
//! file, either as `Authorization: Bearer <token>` or a `?token=` query
//! parameter.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, warn};

use crate::auth::TokenSet;
use crate::cache::NodeCache;
use crate::engine::{EngineError, EngineHandle};
use crate::events::ChangeBatch;
use crate::history::{FlatState, SimpleStatus};
use crate::model::{Node, NodeId};
use crate::store::{Store, StoreError};

// ============================================================================
// State & errors
// ============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub cache: Arc<NodeCache>,
    pub handle: EngineHandle,
    pub changes: broadcast::Sender<ChangeBatch>,
    pub tokens: Arc<TokenSet>,
}

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid token".to_string(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Rejected(msg) => HttpError::bad_request(msg),
            other => HttpError::internal(other),
        }
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => HttpError::not_found(format!("no such node: {id}")),
            other => HttpError::internal(other),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/add-nodes", post(add_nodes))
        .route("/api/kill", post(kill))
        .route("/api/target/:id", get(target))
        .route("/api/changes", get(changes))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Auth middleware
// ============================================================================

fn presented_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(axum::http::header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        return value.strip_prefix("Bearer ").map(str::to_string);
    }
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        pair.strip_prefix("token=").map(str::to_string)
    })
}

async fn require_token(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = presented_token(&request) else {
        warn!(path = %request.uri().path(), "request without token");
        return HttpError::unauthorized().into_response();
    };
    match state.tokens.authenticate(&token) {
        Some(name) => {
            debug!(user = name, path = %request.uri().path(), "authenticated");
            next.run(request).await
        }
        None => {
            warn!(path = %request.uri().path(), "request with unknown token");
            HttpError::unauthorized().into_response()
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Serialize)]
struct AddNodesResponse {
    ids: Vec<NodeId>,
}

async fn add_nodes(
    State(state): State<ApiState>,
    Json(nodes): Json<Vec<Node>>,
) -> Result<Json<AddNodesResponse>, HttpError> {
    let ids = state.handle.submit(nodes).await?;
    Ok(Json(AddNodesResponse { ids }))
}

#[derive(Debug, Serialize)]
struct AckResponse {
    ok: bool,
}

async fn kill(
    State(state): State<ApiState>,
    Json(ids): Json<Vec<NodeId>>,
) -> Result<Json<AckResponse>, HttpError> {
    state.handle.kill(ids).await?;
    Ok(Json(AckResponse { ok: true }))
}

#[derive(Debug, Serialize)]
struct TargetResponse {
    id: NodeId,
    name: String,
    metadata: Option<String>,
    depends_on: Vec<NodeId>,
    on_failure_activate: Vec<NodeId>,
    on_success_activate: Vec<NodeId>,
    tags: Vec<String>,
    status: SimpleStatus,
    history: Vec<FlatState>,
}

async fn target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TargetResponse>, HttpError> {
    let id = NodeId(id);
    let node = state.cache.get(&state.store, &id).await?;
    Ok(Json(TargetResponse {
        id: node.id.clone(),
        name: node.name.clone(),
        metadata: node.metadata.clone(),
        depends_on: node.depends_on.clone(),
        on_failure_activate: node.on_failure_activate.clone(),
        on_success_activate: node.on_success_activate.clone(),
        tags: node.tags.clone(),
        status: node.history.simplify(),
        history: node.history.flatten(),
    }))
}

async fn changes(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.changes.subscribe()).filter_map(|batch| async move {
        match batch {
            Ok(batch) => match Event::default().event("changes").json_data(&batch) {
                Ok(event) => Some(Ok(event)),
                Err(err) => {
                    error!(error = %err, "cannot encode change batch");
                    None
                }
            },
            // A lagged subscriber just misses coalesced windows.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// Tests
// ============================================================================
