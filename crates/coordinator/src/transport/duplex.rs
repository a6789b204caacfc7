use async_trait::async_trait;
use chrono::Utc;
use meshvault_protocol::{
    decode_b64, encode_b64, ContentAddress, NodeHealth, Operation, OperationResult,
    ReplyEnvelope, RequestEnvelope, RequestPayload, StoreChunkResponse, VerifyResponse,
    WsMessage,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ReplicaTransport;
use crate::directory::{Peer, PeerDirectory, PeerRoster, RosterEntry};
use crate::error::TransportError;

/// Handler for a peer-initiated frame, keyed by its `type`.
pub type Handler = Arc<dyn Fn(&PeerHub, &str, WsMessage) + Send + Sync>;

struct Link {
    conn_id: u64,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

/// A freshly attached connection: frames pushed to `outbound` must be
/// written to the peer's socket.
pub struct PeerLink {
    pub node_id: String,
    pub conn_id: u64,
    pub outbound: mpsc::UnboundedReceiver<WsMessage>,
}

/// Correlated-duplex binding. Owns the roster of connected peers, one
/// outbound queue per peer, the request-id → reply-slot map, and the
/// table of handlers for frames nobody is waiting on.
///
/// Locks here guard a single map operation each and are never held
/// across an await.
pub struct PeerHub {
    roster: Arc<PeerRoster>,
    links: RwLock<HashMap<String, Link>>,
    pending: Mutex<HashMap<String, (String, oneshot::Sender<ReplyEnvelope>)>>,
    handlers: RwLock<HashMap<&'static str, Handler>>,
    request_timeout: Duration,
    next_conn: AtomicU64,
}

impl PeerHub {
    pub fn new(request_timeout: Duration) -> Self {
        let hub = Self {
            roster: Arc::new(PeerRoster::new()),
            links: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            request_timeout,
            next_conn: AtomicU64::new(1),
        };
        hub.on(
            "heartbeat",
            Arc::new(|hub: &PeerHub, peer_id: &str, msg: WsMessage| {
                if let WsMessage::Heartbeat { used_bytes, .. } = msg {
                    if !hub.roster.heartbeat(peer_id, used_bytes) {
                        debug!(peer = %peer_id, "heartbeat from unknown peer");
                    }
                }
            }),
        );
        hub.on(
            "node:register",
            Arc::new(|hub: &PeerHub, peer_id: &str, msg: WsMessage| {
                if let Some(entry) = registration(&msg) {
                    if entry.node_id == peer_id {
                        hub.roster.register(entry);
                    } else {
                        warn!(peer = %peer_id, claimed = %entry.node_id, "re-registration under another id ignored");
                    }
                }
            }),
        );
        hub
    }

    pub fn roster(&self) -> &Arc<PeerRoster> {
        &self.roster
    }

    /// Install (or replace) the handler for one frame type.
    pub fn on(&self, kind: &'static str, handler: Handler) {
        self.handlers.write().insert(kind, handler);
    }

    /// Bind a registered peer to a new outbound queue. A reconnect under
    /// the same id replaces the old queue.
    pub fn attach(&self, entry: RosterEntry) -> PeerLink {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let node_id = entry.node_id.clone();
        let _ = tx.send(WsMessage::Registered {
            node_id: node_id.clone(),
        });
        self.links.write().insert(
            node_id.clone(),
            Link {
                conn_id,
                outbound: tx,
            },
        );
        self.roster.register(entry);
        info!(peer = %node_id, conn_id, live = self.roster.len(), "peer attached");
        PeerLink {
            node_id,
            conn_id,
            outbound: rx,
        }
    }

    /// Drop a connection. In-flight requests to that peer fail at once
    /// instead of waiting out their timeout.
    pub fn detach(&self, node_id: &str, conn_id: u64) {
        {
            let mut links = self.links.write();
            match links.get(node_id) {
                Some(link) if link.conn_id == conn_id => {
                    links.remove(node_id);
                }
                _ => return,
            }
        }
        self.roster.remove(node_id);
        self.pending.lock().retain(|_, (peer, _)| peer != node_id);
        info!(peer = %node_id, conn_id, live = self.roster.len(), "peer detached");
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.links.read().contains_key(node_id)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Route one inbound frame: replies wake their waiting caller, other
    /// frames go to the handler for their type.
    pub fn dispatch(&self, peer_id: &str, msg: WsMessage) {
        if let WsMessage::Reply(reply) = msg {
            let slot = self.pending.lock().remove(&reply.request_id);
            match slot {
                Some((expected_peer, tx)) if expected_peer == peer_id => {
                    let _ = tx.send(reply);
                }
                Some((expected_peer, tx)) => {
                    warn!(peer = %peer_id, %expected_peer, request_id = %reply.request_id, "reply from wrong peer dropped");
                    self.pending
                        .lock()
                        .insert(reply.request_id.clone(), (expected_peer, tx));
                }
                None => debug!(peer = %peer_id, request_id = %reply.request_id, "late or unknown reply"),
            }
            return;
        }

        let handler = self.handlers.read().get(msg.kind()).cloned();
        match handler {
            Some(handler) => handler(self, peer_id, msg),
            None => debug!(peer = %peer_id, kind = msg.kind(), "no handler for frame"),
        }
    }

    /// Send one request and wait for the reply carrying its id.
    pub async fn request(
        &self,
        peer_id: &str,
        operation: Operation,
        payload: RequestPayload,
    ) -> Result<OperationResult, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(request_id.clone(), (peer_id.to_string(), tx));
        // Frees the slot however this call ends, including when the caller
        // stops polling before the reply or the timeout.
        let _slot = SlotGuard {
            hub: self,
            request_id: &request_id,
        };

        let frame = WsMessage::Request(RequestEnvelope::new(request_id.clone(), operation, payload));
        let sent = self
            .links
            .read()
            .get(peer_id)
            .map(|link| link.outbound.send(frame).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(TransportError::NotConnected(peer_id.to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) if reply.success => reply
                .result
                .ok_or_else(|| TransportError::Protocol("successful reply without result".into())),
            Ok(Ok(reply)) => Err(TransportError::Rejected(
                reply.error.unwrap_or_else(|| "unspecified".into()),
            )),
            Ok(Err(_)) => Err(TransportError::Connection(format!(
                "peer {peer_id} disconnected"
            ))),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

struct SlotGuard<'a> {
    hub: &'a PeerHub,
    request_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.hub.pending.lock().remove(self.request_id);
    }
}

impl PeerDirectory for PeerHub {
    fn live_peers(&self) -> Vec<Peer> {
        self.roster.live_peers()
    }

    fn live_count(&self) -> usize {
        self.roster.live_count()
    }

    fn resolve(&self, id: &str) -> Option<Peer> {
        self.roster.resolve(id)
    }
}

/// Roster entry described by a `node:register` frame.
pub(crate) fn registration(msg: &WsMessage) -> Option<RosterEntry> {
    match msg {
        WsMessage::NodeRegister {
            node_id,
            address,
            capacity_bytes,
            used_bytes,
            platform,
            version,
        } => {
            let now = Utc::now();
            Some(RosterEntry {
                node_id: node_id.clone(),
                address: address.clone(),
                capacity_bytes: *capacity_bytes,
                used_bytes: *used_bytes,
                platform: platform.clone(),
                version: version.clone(),
                connected_at: now,
                last_seen: now,
            })
        }
        _ => None,
    }
}

fn unexpected(op: &str, got: OperationResult) -> TransportError {
    TransportError::Protocol(format!("expected {op} result, got {got:?}"))
}

fn addressed(cid: &ContentAddress) -> RequestPayload {
    RequestPayload {
        chunk_hash: Some(cid.clone()),
        data_b64: None,
    }
}

#[async_trait]
impl ReplicaTransport for PeerHub {
    fn name(&self) -> &'static str {
        "duplex"
    }

    async fn store(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
        data: &[u8],
    ) -> Result<StoreChunkResponse, TransportError> {
        let payload = RequestPayload {
            chunk_hash: Some(cid.clone()),
            data_b64: Some(encode_b64(data)),
        };
        match self.request(&peer.id, Operation::Store, payload).await? {
            OperationResult::Store(response) => Ok(response),
            other => Err(unexpected("store", other)),
        }
    }

    async fn retrieve(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        match self.request(&peer.id, Operation::Retrieve, addressed(cid)).await? {
            OperationResult::Retrieve(response) if response.found => {
                let encoded = response
                    .data_b64
                    .ok_or_else(|| TransportError::Protocol("found chunk without data".into()))?;
                decode_b64(&encoded)
                    .map(Some)
                    .map_err(|e| TransportError::Protocol(e.to_string()))
            }
            OperationResult::Retrieve(_) => Ok(None),
            other => Err(unexpected("retrieve", other)),
        }
    }

    async fn exists(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError> {
        match self.request(&peer.id, Operation::Exists, addressed(cid)).await? {
            OperationResult::Exists(response) => Ok(response.exists),
            other => Err(unexpected("exists", other)),
        }
    }

    async fn delete(&self, peer: &Peer, cid: &ContentAddress) -> Result<bool, TransportError> {
        match self.request(&peer.id, Operation::Delete, addressed(cid)).await? {
            OperationResult::Delete(response) => Ok(response.deleted),
            other => Err(unexpected("delete", other)),
        }
    }

    async fn verify(
        &self,
        peer: &Peer,
        cid: &ContentAddress,
    ) -> Result<VerifyResponse, TransportError> {
        match self.request(&peer.id, Operation::Verify, addressed(cid)).await? {
            OperationResult::Verify(response) => Ok(response),
            other => Err(unexpected("verify", other)),
        }
    }

    async fn ping(&self, peer: &Peer) -> Result<NodeHealth, TransportError> {
        match self
            .request(&peer.id, Operation::Ping, RequestPayload::default())
            .await?
        {
            OperationResult::Ping(health) => Ok(health),
            other => Err(unexpected("ping", other)),
        }
    }
}
