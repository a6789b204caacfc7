use libp2p_identity::Keypair;
use meshvault_coordinator::transport::store_checked;
use meshvault_coordinator::{
    BlockStatus, CoordinatorConfig, CoreError, HttpTransport, Ledger, Orchestrator, Peer,
    QuorumPolicy, ReplicaTransport, RetrievalVerifier, StaticDirectory, TransportError,
};
use meshvault_node::{server, SecureBlockStore, StorageNode};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use meshvault_protocol::{ContentAddress, ErrorBody, ExistsResponse, StoreStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const ADMIN: &str = "let-me-delete";

struct Running {
    peer: Peer,
    node: Arc<StorageNode>,
    _dir: tempfile::TempDir,
}

async fn spawn_node(admin_token: Option<&str>) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let store = SecureBlockStore::with_capacity_bytes(dir.path().join("blocks"), 1 << 20).unwrap();
    let node = Arc::new(StorageNode::new(
        Arc::new(store),
        Keypair::generate_ed25519(),
        admin_token.map(str::to_string),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = Peer::new(
        node.node_id(),
        format!("http://{}", listener.local_addr().unwrap()),
    );
    tokio::spawn(server::serve(listener, node.clone(), std::future::pending()));
    Running {
        peer,
        node,
        _dir: dir,
    }
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(5), 1, Duration::from_millis(10))
        .unwrap()
        .with_admin_token(Some(ADMIN.to_string()))
}

#[tokio::test]
async fn chunk_operations_over_http() {
    let running = spawn_node(Some(ADMIN)).await;
    let http = transport();
    let peer = &running.peer;
    let data = b"sealed chunk".to_vec();
    let cid = ContentAddress::of(&data);

    let health = http.ping(peer).await.unwrap();
    assert_eq!(health.node_id, running.node.node_id());

    let ack = store_checked(&http, peer, &cid, &data).await.unwrap();
    assert_eq!(ack.status, StoreStatus::Stored);
    assert!(ack.signature.is_some());
    let again = store_checked(&http, peer, &cid, &data).await.unwrap();
    assert_eq!(again.status, StoreStatus::Exists);

    assert!(http.exists(peer, &cid).await.unwrap());
    assert_eq!(http.retrieve(peer, &cid).await.unwrap(), Some(data.clone()));
    let verdict = http.verify(peer, &cid).await.unwrap();
    assert!(verdict.exists && verdict.valid);

    assert!(http.delete(peer, &cid).await.unwrap());
    assert!(!http.exists(peer, &cid).await.unwrap());
    assert_eq!(http.retrieve(peer, &cid).await.unwrap(), None);
}

#[tokio::test]
async fn delete_without_the_admin_token_is_refused() {
    let running = spawn_node(Some(ADMIN)).await;
    let anonymous =
        HttpTransport::new(Duration::from_secs(5), 0, Duration::from_millis(10)).unwrap();
    let data = b"keep me".to_vec();
    let cid = ContentAddress::of(&data);
    store_checked(&anonymous, &running.peer, &cid, &data)
        .await
        .unwrap();

    let err = anonymous.delete(&running.peer, &cid).await.unwrap_err();
    assert!(matches!(err, TransportError::Http { status: 401 | 403, .. }), "{err:?}");
    assert!(!err.is_retryable());
    assert!(anonymous.exists(&running.peer, &cid).await.unwrap());
}

#[tokio::test]
async fn mislabelled_store_is_caught() {
    let running = spawn_node(None).await;
    let http = transport();
    let claimed = ContentAddress::of(b"what we meant to send");

    let err = store_checked(&http, &running.peer, &claimed, b"what we actually sent")
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            TransportError::HashMismatch { .. } | TransportError::Rejected(_) | TransportError::Http { .. }
        ),
        "{err:?}"
    );
    assert!(!http.exists(&running.peer, &claimed).await.unwrap());
}

#[tokio::test]
async fn upload_and_download_across_http_peers() {
    let nodes = vec![
        spawn_node(Some(ADMIN)).await,
        spawn_node(Some(ADMIN)).await,
        spawn_node(Some(ADMIN)).await,
    ];
    let directory = Arc::new(StaticDirectory::new(
        nodes.iter().map(|n| n.peer.clone()).collect(),
    ));
    let http = Arc::new(transport());
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(
        Ledger::open(dir.path().join("ledger.json"), QuorumPolicy::default()).unwrap(),
    );
    let config = CoordinatorConfig {
        chunk_size: 1024,
        replication_factor: 2,
        kdf_iterations: 1,
        kdf_memory_kib: 64,
        probe_timeout_secs: 1.0,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        config.clone(),
        directory.clone(),
        http.clone(),
        ledger.clone(),
    );
    let verifier = RetrievalVerifier::new(directory.clone(), http.clone(), ledger.clone(), 4);

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    let report = orchestrator
        .upload("alice", "report.pdf", &data, b"s3cret")
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 5);
    assert_eq!(report.status, BlockStatus::Confirmed);

    let block = ledger.block_by_hash(&report.block_hash).unwrap();
    assert!(block.confirmations.iter().all(|c| c.signature.is_some()));

    let file = verifier
        .retrieve(&report.file_id, "alice", b"s3cret")
        .await
        .unwrap();
    assert_eq!(file.data, data);

    // The ledger survives a reopen and still serves the download.
    drop(orchestrator);
    let reopened = Arc::new(
        Ledger::open(dir.path().join("ledger.json"), QuorumPolicy::default()).unwrap(),
    );
    let verifier = RetrievalVerifier::new(directory.clone(), http.clone(), reopened.clone(), 4);
    assert_eq!(
        verifier
            .retrieve(&report.file_id, "alice", b"s3cret")
            .await
            .unwrap()
            .data,
        data
    );

    let orchestrator = Orchestrator::new(config, directory, http, reopened);
    orchestrator
        .delete_file(&report.file_id, "alice")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    for node in &nodes {
        assert_eq!(node.node.health().chunk_count, 0);
    }
    assert!(matches!(
        verifier.retrieve(&report.file_id, "alice", b"s3cret").await,
        Err(CoreError::FileNotFound(_))
    ));
}

/// A peer that answers `/exists` and `/health` with a fixed run of
/// statuses, then 200, counting every hit.
struct Scripted {
    statuses: Vec<u16>,
    hits: AtomicUsize,
}

impl Scripted {
    fn next_status(&self) -> StatusCode {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        let code = self.statuses.get(n).copied().unwrap_or(200);
        StatusCode::from_u16(code).unwrap()
    }
}

async fn scripted_exists(
    State(script): State<Arc<Scripted>>,
    Path(cid): Path<String>,
) -> Response {
    let status = script.next_status();
    if !status.is_success() {
        let body = ErrorBody {
            error: format!("scripted {status}"),
        };
        return (status, Json(body)).into_response();
    }
    Json(ExistsResponse {
        chunk_hash: ContentAddress::parse(&cid).unwrap(),
        exists: true,
        size: 1,
    })
    .into_response()
}

async fn scripted_health(State(script): State<Arc<Scripted>>) -> Response {
    let status = script.next_status();
    (status, Json(ErrorBody { error: "down".into() })).into_response()
}

async fn spawn_scripted(statuses: &[u16]) -> (Peer, Arc<Scripted>) {
    let script = Arc::new(Scripted {
        statuses: statuses.to_vec(),
        hits: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/exists/:cid", get(scripted_exists))
        .route("/health", get(scripted_health))
        .with_state(script.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = Peer::new(
        "scripted",
        format!("http://{}", listener.local_addr().unwrap()),
    );
    tokio::spawn(async move { axum::serve(listener, app).await });
    (peer, script)
}

fn retrying(retries: u32) -> HttpTransport {
    HttpTransport::new(Duration::from_secs(5), retries, Duration::from_millis(5)).unwrap()
}

#[tokio::test]
async fn transient_statuses_are_retried_until_success() {
    let (peer, script) = spawn_scripted(&[503, 502]).await;
    let cid = ContentAddress::of(b"x");

    assert!(retrying(2).exists(&peer, &cid).await.unwrap());
    assert_eq!(script.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_stop_at_the_configured_limit() {
    let (peer, script) = spawn_scripted(&[503, 503, 503, 503, 503]).await;
    let cid = ContentAddress::of(b"x");

    let err = retrying(2).exists(&peer, &cid).await.unwrap_err();
    assert!(matches!(err, TransportError::Http { status: 503, .. }), "{err:?}");
    assert_eq!(script.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_tried_once() {
    for status in [400u16, 403, 422] {
        let (peer, script) = spawn_scripted(&[status]).await;
        let err = retrying(3)
            .exists(&peer, &ContentAddress::of(b"x"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransportError::Http { status: s, .. } if s == status),
            "{err:?}"
        );
        assert!(!err.is_retryable());
        assert_eq!(script.hits.load(Ordering::SeqCst), 1, "status {status}");
    }
}

#[tokio::test]
async fn ping_is_a_single_attempt() {
    let (peer, script) = spawn_scripted(&[503]).await;
    assert!(retrying(3).ping(&peer).await.is_err());
    assert_eq!(script.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn receipt_from_a_different_peer_is_refused() {
    let honest = spawn_node(None).await;
    let impostor = spawn_node(None).await;
    let http = transport();
    let data = b"who really holds this".to_vec();
    let cid = ContentAddress::of(&data);

    // Claims the honest node's identity but answers from the impostor.
    let spoofed = Peer::new(honest.node.node_id(), impostor.peer.address.clone());
    let err = store_checked(&http, &spoofed, &cid, &data)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidReceipt), "{err:?}");

    let ack = store_checked(&http, &impostor.peer, &cid, &data)
        .await
        .unwrap();
    assert_eq!(ack.status, StoreStatus::Exists);
}
