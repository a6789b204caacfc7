use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use meshvault_protocol::WsMessage;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::directory::{PeerDirectory, RosterEntry};
use crate::ledger::{Ledger, LedgerStats};
use crate::transport::{registration, PeerHub};

/// How long a fresh socket may take to send its `node:register` frame.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<PeerHub>,
    pub directory: Arc<dyn PeerDirectory>,
    pub ledger: Arc<Ledger>,
    pub transport: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/peers/ws", get(peers_ws))
        .route("/ledger/stats", get(ledger_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), transport = state.transport, "coordinator listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    transport: &'static str,
    connected_peers: usize,
    live_peers: usize,
    ledger: LedgerStats,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        transport: state.transport,
        connected_peers: state.hub.roster().len(),
        live_peers: state.directory.live_count(),
        ledger: state.ledger.stats(),
    })
}

async fn peers(State(state): State<AppState>) -> Json<Vec<RosterEntry>> {
    Json(state.hub.roster().entries())
}

async fn ledger_stats(State(state): State<AppState>) -> Json<LedgerStats> {
    Json(state.ledger.stats())
}

async fn peers_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_peer(state.hub, socket))
}

/// Drive one peer socket: wait for registration, then pump the hub's
/// outbound queue to the socket and inbound frames into the hub until
/// either side goes away.
pub async fn serve_peer(hub: Arc<PeerHub>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let entry = match tokio::time::timeout(REGISTER_TIMEOUT, first_registration(&mut stream)).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            debug!("socket closed before registering");
            return;
        }
        Err(_) => {
            warn!("peer did not register in time");
            return;
        }
    };

    let link = hub.attach(entry);
    let node_id = link.node_id.clone();
    let conn_id = link.conn_id;
    let mut outbound = link.outbound;

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("unencodable frame dropped: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(msg) => hub.dispatch(&node_id, msg),
                Err(e) => warn!(peer = %node_id, "malformed frame: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %node_id, "socket error: {e}");
                break;
            }
        }
    }

    hub.detach(&node_id, conn_id);
    writer.abort();
}

async fn first_registration(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<RosterEntry> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<WsMessage>(&text).ok().and_then(|m| registration(&m)) {
                    Some(entry) => return Some(entry),
                    None => debug!("ignoring frame before registration"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}
