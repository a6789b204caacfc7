use meshvault_codec::sha256_hex;
use meshvault_coordinator::ledger::{BlockPayload, FileMetadata};
use meshvault_coordinator::{
    BlockStatus, CoordinatorConfig, CoreError, Ledger, MemoryTransport, Orchestrator, Peer,
    QuorumPolicy, RetrievalVerifier, StaticDirectory,
};
use meshvault_protocol::ContentAddress;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &[u8] = b"correct horse battery staple";

struct Net {
    transport: Arc<MemoryTransport>,
    directory: Arc<StaticDirectory>,
    ledger: Arc<Ledger>,
    orchestrator: Orchestrator,
    verifier: RetrievalVerifier,
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        chunk_size: 64,
        replication_factor: 2,
        kdf_iterations: 1,
        kdf_memory_kib: 64,
        probe_timeout_secs: 0.2,
        consensus_timeout_secs: 2.0,
        ..Default::default()
    }
}

fn net(peer_ids: &[&str]) -> Net {
    let transport = Arc::new(MemoryTransport::new());
    let peers: Vec<Peer> = peer_ids.iter().map(|id| transport.add_peer(id)).collect();
    let directory = Arc::new(StaticDirectory::new(peers));
    let ledger = Arc::new(Ledger::in_memory(QuorumPolicy::default()));
    let config = config();
    let orchestrator = Orchestrator::new(
        config.clone(),
        directory.clone(),
        transport.clone(),
        ledger.clone(),
    );
    let verifier = RetrievalVerifier::new(
        directory.clone(),
        transport.clone(),
        ledger.clone(),
        config.retrieve_workers,
    );
    Net {
        transport,
        directory,
        ledger,
        orchestrator,
        verifier,
    }
}

/// 200 distinct-looking bytes: four chunks of 64, 64, 64 and 8.
fn sample() -> Vec<u8> {
    (0..200u32).map(|i| (i * 7 % 251) as u8).collect()
}

fn cid(raw: &str) -> ContentAddress {
    ContentAddress::parse(raw).unwrap()
}

/// Record a copy of `file_id`'s metadata under a new id after `edit`, with
/// no confirmations attached.
fn forge(net: &Net, file_id: &str, new_id: &str, edit: impl FnOnce(&mut FileMetadata)) {
    let mut metadata = net.ledger.file_metadata(file_id).unwrap();
    metadata.file_id = new_id.to_string();
    edit(&mut metadata);
    net.ledger
        .add_block(BlockPayload::FileMetadata(metadata), vec![], 3)
        .unwrap();
}

#[tokio::test]
async fn upload_then_download_round_trips() {
    let net = net(&["p1", "p2", "p3"]);
    let data = sample();

    let report = net
        .orchestrator
        .upload("alice", "notes.txt", &data, SECRET)
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 4);
    assert_eq!(report.block_index, 0);
    assert_eq!(report.status, BlockStatus::Confirmed);
    assert!(report.under_replicated.is_empty());

    let metadata = net.ledger.file_metadata(&report.file_id).unwrap();
    assert_eq!(metadata.size, 200);
    assert_eq!(metadata.placements.len(), 4);
    for record in &metadata.placements {
        assert_eq!(record.peers.len(), 2);
        for peer in &record.peers {
            assert!(net.transport.holds(peer, &cid(&record.ciphertext_hash)));
        }
    }

    let file = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap();
    assert_eq!(file.data, data);
    assert_eq!(file.metadata.name, "notes.txt");
}

#[tokio::test]
async fn empty_file_round_trips() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "empty", b"", SECRET)
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 0);
    assert_eq!(report.status, BlockStatus::Confirmed);
    assert!(net.ledger.pending_blocks().is_empty());
    assert_eq!(net.ledger.user_files("alice", false).len(), 1);
    let file = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap();
    assert!(file.data.is_empty());
}

#[tokio::test]
async fn slow_peers_are_passed_over() {
    let net = net(&["fast-1", "fast-2", "slow"]);
    net.transport.set_latency("slow", Duration::from_millis(150));

    net.orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    assert_eq!(net.transport.chunk_count("slow"), 0);
    assert_eq!(net.transport.chunk_count("fast-1"), 4);
    assert_eq!(net.transport.chunk_count("fast-2"), 4);
}

#[tokio::test]
async fn altered_plaintext_hash_fails_integrity() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    forge(&net, &report.file_id, "forged", |m| {
        m.placements[1].plaintext_hash = sha256_hex(b"something else");
    });

    let err = net
        .verifier
        .retrieve("forged", "alice", SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IntegrityFailure(_)), "{err:?}");
}

#[tokio::test]
async fn reordered_chunks_fail_the_merkle_check() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    forge(&net, &report.file_id, "swapped", |m| {
        m.placements[0].index = 1;
        m.placements[1].index = 0;
    });

    let err = net
        .verifier
        .retrieve("swapped", "alice", SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::IntegrityFailure(_)), "{err:?}");
}

#[tokio::test]
async fn wrong_secret_and_wrong_user_are_refused() {
    let net = net(&["p1", "p2"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();

    let err = net
        .verifier
        .retrieve(&report.file_id, "alice", b"not the secret")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::WrongSecret), "{err:?}");

    let err = net
        .verifier
        .retrieve(&report.file_id, "mallory", SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AccessDenied(_)), "{err:?}");

    let err = net
        .verifier
        .retrieve("no-such-file", "alice", SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::FileNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn chunk_missing_everywhere_is_unavailable() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    let record = net.ledger.file_metadata(&report.file_id).unwrap().placements[2].clone();
    for peer in &record.peers {
        assert!(net.transport.remove_chunk(peer, &cid(&record.ciphertext_hash)));
    }

    let err = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ChunkUnavailable { index: 2 }), "{err:?}");
}

#[tokio::test]
async fn corrupted_replica_falls_back_to_the_next_peer() {
    let net = net(&["p1", "p2", "p3"]);
    let data = sample();
    let report = net
        .orchestrator
        .upload("alice", "f", &data, SECRET)
        .await
        .unwrap();
    let metadata = net.ledger.file_metadata(&report.file_id).unwrap();
    for record in &metadata.placements {
        assert!(net
            .transport
            .corrupt(&record.peers[0], &cid(&record.ciphertext_hash)));
    }

    let file = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap();
    assert_eq!(file.data, data);
}

#[tokio::test]
async fn unreachable_first_replica_falls_back() {
    let net = net(&["p1", "p2"]);
    let data = sample();
    let report = net
        .orchestrator
        .upload("alice", "f", &data, SECRET)
        .await
        .unwrap();
    net.transport.set_reachable("p1", false);

    let file = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap();
    assert_eq!(file.data, data);
}

#[tokio::test]
async fn deleted_files_disappear() {
    let net = net(&["p1", "p2"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();

    let err = net
        .orchestrator
        .delete_file(&report.file_id, "mallory")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AccessDenied(_)));

    let block = net
        .orchestrator
        .delete_file(&report.file_id, "alice")
        .await
        .unwrap();
    assert_eq!(block.status, BlockStatus::Confirmed);
    assert!(net.ledger.is_deleted(&report.file_id));
    assert!(net.ledger.user_files("alice", true).is_empty());

    let err = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::FileNotFound(_)), "{err:?}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(net.transport.chunk_count("p1"), 0);
    assert_eq!(net.transport.chunk_count("p2"), 0);
}

#[tokio::test]
async fn sharing_is_recorded_and_withdrawn() {
    let net = net(&["p1", "p2"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();

    assert!(matches!(
        net.orchestrator.share_file(&report.file_id, "mallory", "bob"),
        Err(CoreError::AccessDenied(_))
    ));

    net.orchestrator
        .share_file(&report.file_id, "alice", "bob")
        .unwrap();
    let shared = net.ledger.shared_with("bob");
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].metadata.file_id, report.file_id);
    assert!(net.ledger.shared_with("carol").is_empty());

    net.orchestrator
        .unshare_file(&report.file_id, "alice", "bob")
        .unwrap();
    assert!(net.ledger.shared_with("bob").is_empty());
    assert_eq!(net.ledger.len(), 3);
}

#[tokio::test]
async fn pending_block_is_confirmed_by_verifying_replicas() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    forge(&net, &report.file_id, "late", |_| {});
    let pending = net.ledger.file_block("late").unwrap();
    assert_eq!(pending.status, BlockStatus::Pending);

    let status = net
        .orchestrator
        .gather_confirmations(&pending.hash)
        .await
        .unwrap();
    assert_eq!(status, BlockStatus::Confirmed);
    let block = net.ledger.block_by_hash(&pending.hash).unwrap();
    assert!(block.confirmation_count() >= 2);
    assert!(block.confirmed_at.is_some());
}

#[tokio::test]
async fn corrupted_peer_does_not_confirm() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    let metadata = net.ledger.file_metadata(&report.file_id).unwrap();
    let record = &metadata.placements[0];
    let bad = record.peers[0].clone();
    assert!(net.transport.corrupt(&bad, &cid(&record.ciphertext_hash)));

    forge(&net, &report.file_id, "late", |_| {});
    let pending = net.ledger.file_block("late").unwrap();
    net.orchestrator
        .gather_confirmations(&pending.hash)
        .await
        .unwrap();

    let block = net.ledger.block_by_hash(&pending.hash).unwrap();
    assert!(!block.has_confirmation_from(&bad));
    assert!(block.confirmation_count() >= 1);
}

#[tokio::test]
async fn sweep_confirms_pending_file_blocks() {
    let net = net(&["p1", "p2", "p3"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    forge(&net, &report.file_id, "late-1", |_| {});
    forge(&net, &report.file_id, "late-2", |_| {});
    assert_eq!(net.ledger.pending_blocks().len(), 2);

    assert_eq!(net.orchestrator.sweep_pending().await, 2);
    assert!(net.ledger.pending_blocks().is_empty());
}

#[tokio::test]
async fn unreachable_network_fails_placement() {
    let net = net(&["p1", "p2"]);
    net.transport.set_reachable("p1", false);
    net.transport.set_reachable("p2", false);

    let err = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::PlacementFailed { .. }), "{err:?}");
    assert!(net.ledger.is_empty());
}

#[tokio::test]
async fn no_peers_means_no_upload() {
    let net = net(&[]);
    let err = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoPeers), "{err:?}");
}

#[tokio::test]
async fn single_peer_upload_is_reported_under_replicated() {
    let net = net(&["only"]);
    let report = net
        .orchestrator
        .upload("alice", "f", &sample(), SECRET)
        .await
        .unwrap();
    assert_eq!(report.under_replicated, vec![0, 1, 2, 3]);
    assert_eq!(report.status, BlockStatus::Confirmed);

    // A peer joining later holds nothing and is never asked.
    net.directory.insert(net.transport.add_peer("spare"));
    let file = net
        .verifier
        .retrieve(&report.file_id, "alice", SECRET)
        .await
        .unwrap();
    assert_eq!(file.data, sample());
}
