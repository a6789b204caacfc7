use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use meshvault_protocol::WsMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::node::StorageNode;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound duplex link to the coordinator. The node dials out, so it can
/// sit behind NAT and still be asked to store and serve chunks.
pub struct WsBridge {
    pub url: String,
    pub node: Arc<StorageNode>,
    /// Request/reply address advertised at registration, if reachable.
    pub advertise_address: Option<String>,
}

impl WsBridge {
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        info!(url = %self.url, "starting duplex bridge");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("duplex bridge shutdown signal received");
                    break;
                }
                outcome = self.connect_and_process() => {
                    if let Err(e) = outcome {
                        warn!("duplex connection failed: {e:#}");
                    }
                    warn!("duplex connection lost, reconnecting in {}s", RECONNECT_DELAY.as_secs());
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }

        Ok(())
    }

    async fn connect_and_process(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("failed to connect to coordinator")?;

        info!(url = %self.url, "connected to coordinator");
        let (mut write, mut read) = ws_stream.split();

        let health = self.node.health();
        let register = WsMessage::NodeRegister {
            node_id: self.node.node_id().to_string(),
            address: self.advertise_address.clone(),
            capacity_bytes: health.capacity_bytes,
            used_bytes: health.used_bytes,
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write
            .send(Message::Text(serde_json::to_string(&register)?))
            .await?;

        let mut heartbeat_ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        loop {
            tokio::select! {
                _ = heartbeat_ticker.tick() => {
                    let heartbeat = WsMessage::Heartbeat {
                        node_id: self.node.node_id().to_string(),
                        used_bytes: self.node.block_store().used_bytes(),
                        timestamp: chrono::Utc::now().timestamp_millis() as u64,
                    };
                    let json = serde_json::to_string(&heartbeat)?;
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Some(outgoing) = rx.recv() => {
                    let json = serde_json::to_string(&outgoing)?;
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                incoming = read.next() => {
                    let msg = match incoming {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => {
                            debug!("duplex read error: {e}");
                            break;
                        }
                        None => break,
                    };

                    let Message::Text(text) = msg else {
                        continue;
                    };
                    match serde_json::from_str::<WsMessage>(&text) {
                        Ok(WsMessage::Request(request)) => {
                            // Disk work stays off the socket task.
                            let node = self.node.clone();
                            let tx = tx.clone();
                            tokio::task::spawn_blocking(move || {
                                let reply = node.handle(request);
                                let _ = tx.send(WsMessage::Reply(reply));
                            });
                        }
                        Ok(WsMessage::Registered { node_id }) => {
                            info!(%node_id, "registered with coordinator");
                        }
                        Ok(other) => debug!(kind = other.kind(), "ignoring frame"),
                        Err(e) => error!("malformed frame from coordinator: {e}"),
                    }
                }
            }
        }
        Ok(())
    }
}
