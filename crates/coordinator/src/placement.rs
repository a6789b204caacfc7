//! Choosing which peers receive a chunk.

use futures::{stream, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::directory::Peer;
use crate::transport::ReplicaTransport;

/// Round-trip time of one probe; `None` stands for "timed out or failed".
pub type Latency = Option<Duration>;

#[derive(Debug, Clone)]
pub struct PlacementPlanner {
    probe_timeout: Duration,
    probe_workers: usize,
}

impl PlacementPlanner {
    pub fn new(probe_timeout: Duration, probe_workers: usize) -> Self {
        Self {
            probe_timeout,
            probe_workers: probe_workers.max(1),
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.probe_timeout(), config.probe_workers)
    }

    /// Upper bound on a whole probing round, however many peers are slow.
    pub fn ceiling(&self) -> Duration {
        self.probe_timeout * 2
    }

    /// Ping every peer through a bounded pool. Results are returned in
    /// input order; probes that did not finish before the ceiling count
    /// as failed.
    pub async fn measure(
        &self,
        transport: &dyn ReplicaTransport,
        peers: &[Peer],
    ) -> Vec<(Peer, Latency)> {
        let probe_timeout = self.probe_timeout;
        let finished: Vec<(usize, Latency)> = stream::iter(peers.iter().enumerate())
            .map(|(i, peer)| async move {
                let started = Instant::now();
                match tokio::time::timeout(probe_timeout, transport.ping(peer)).await {
                    Ok(Ok(_)) => (i, Some(started.elapsed())),
                    Ok(Err(e)) => {
                        debug!(peer = %peer.id, "probe failed: {e}");
                        (i, None)
                    }
                    Err(_) => {
                        debug!(peer = %peer.id, "probe timed out");
                        (i, None)
                    }
                }
            })
            .buffer_unordered(self.probe_workers)
            .take_until(tokio::time::sleep(self.ceiling()))
            .collect()
            .await;

        let mut latencies: Vec<Latency> = vec![None; peers.len()];
        for (i, latency) in finished {
            latencies[i] = latency;
        }
        peers.iter().cloned().zip(latencies).collect()
    }

    /// Pick up to `replication` peers, fastest first.
    pub async fn select(
        &self,
        transport: &dyn ReplicaTransport,
        peers: Vec<Peer>,
        replication: usize,
    ) -> Vec<Peer> {
        if peers.len() <= replication {
            return peers;
        }
        let measured = self.measure(transport, &peers).await;
        let selected = rank(measured, replication);
        info!(
            candidates = peers.len(),
            selected = selected.len(),
            requested = replication,
            "placement selected"
        );
        selected
    }
}

/// Lowest finite latencies first; when fewer than `count` peers answered,
/// top up from the unresponsive ones in their original order.
pub fn rank(measured: Vec<(Peer, Latency)>, count: usize) -> Vec<Peer> {
    let (mut answered, silent): (Vec<_>, Vec<_>) =
        measured.into_iter().partition(|(_, latency)| latency.is_some());
    answered.sort_by_key(|(_, latency)| *latency);

    answered
        .into_iter()
        .chain(silent)
        .take(count)
        .map(|(peer, _)| peer)
        .collect()
}
