use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use meshvault_protocol::{
    ContentAddress, ErrorBody, StoreChunkRequest, ADMIN_TOKEN_HEADER,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::node::{NodeError, StorageNode};
use crate::store::StoreError;

/// HTTP request/reply binding of the peer protocol.
pub fn router(node: Arc<StorageNode>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/store", post(store_chunk))
        .route("/retrieve/:cid", get(retrieve_chunk))
        .route("/exists/:cid", get(exists))
        .route("/verify/:cid", get(verify))
        .route("/chunk/:cid", delete(delete_chunk))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

pub async fn serve(
    listener: TcpListener,
    node: Arc<StorageNode>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), node_id = %node.node_id(), "peer HTTP surface listening");
    axum::serve(listener, router(node))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeStats {
    node_id: String,
    chunk_count: u64,
    used_bytes: u64,
    capacity_bytes: u64,
    free_bytes: u64,
    version: &'static str,
}

struct ApiError(StatusCode, String);

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        let status = match &e {
            NodeError::Protocol(_) | NodeError::MissingField(_) => StatusCode::BAD_REQUEST,
            NodeError::NotFound(_) => StatusCode::NOT_FOUND,
            NodeError::Forbidden => StatusCode::FORBIDDEN,
            NodeError::Store(StoreError::CapacityExceeded { .. }) => StatusCode::INSUFFICIENT_STORAGE,
            NodeError::Store(StoreError::Corrupted(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            NodeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

/// Run a store-touching call on the blocking pool.
async fn blocking<T, F>(node: Arc<StorageNode>, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&StorageNode) -> Result<T, NodeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&node))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(ApiError::from)
}

fn parse_cid(raw: &str) -> Result<ContentAddress, ApiError> {
    ContentAddress::parse(raw).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))
}

async fn health(State(node): State<Arc<StorageNode>>) -> Result<impl IntoResponse, ApiError> {
    let health = blocking(node, |node| Ok(node.health())).await?;
    Ok(Json(health))
}

async fn stats(State(node): State<Arc<StorageNode>>) -> Result<impl IntoResponse, ApiError> {
    let stats = blocking(node, |node| {
        let store = node.block_store();
        let used_bytes = store.used_bytes();
        let capacity_bytes = store.capacity_bytes();
        Ok(NodeStats {
            node_id: node.node_id().to_string(),
            chunk_count: store.chunk_count(),
            used_bytes,
            capacity_bytes,
            free_bytes: capacity_bytes.saturating_sub(used_bytes),
            version: env!("CARGO_PKG_VERSION"),
        })
    })
    .await?;
    Ok(Json(stats))
}

async fn store_chunk(
    State(node): State<Arc<StorageNode>>,
    Json(request): Json<StoreChunkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = blocking(node, move |node| node.store_chunk(&request)).await?;
    info!(cid = %response.chunk_hash, status = ?response.status, size = response.size, "store");
    Ok(Json(response))
}

/// Raw ciphertext on success.
async fn retrieve_chunk(
    State(node): State<Arc<StorageNode>>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError> {
    let cid = parse_cid(&cid)?;
    let data = blocking(node, move |node| node.retrieve_chunk(&cid)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

async fn exists(
    State(node): State<Arc<StorageNode>>,
    Path(cid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cid = parse_cid(&cid)?;
    Ok(Json(blocking(node, move |node| node.exists(&cid)).await?))
}

async fn verify(
    State(node): State<Arc<StorageNode>>,
    Path(cid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cid = parse_cid(&cid)?;
    Ok(Json(blocking(node, move |node| node.verify(&cid)).await?))
}

async fn delete_chunk(
    State(node): State<Arc<StorageNode>>,
    Path(cid): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    node.authorize_admin(token)?;
    let cid = parse_cid(&cid)?;
    let response = blocking(node, {
        let cid = cid.clone();
        move |node| node.delete_chunk(&cid)
    })
    .await?;
    if !response.deleted {
        return Err(NodeError::NotFound(cid.to_string()).into());
    }
    info!(cid = %cid.short(), "chunk deleted by admin");
    Ok(Json(response))
}
