use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use meshvault_coordinator::server::{self, AppState};
use meshvault_coordinator::{
    Addressed, CoordinatorConfig, HttpTransport, Ledger, Orchestrator, Peer, PeerDirectory,
    PeerHub, QuorumPolicy, ReplicaTransport, RetrievalVerifier, StaticDirectory, TransportKind,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "meshvault-coordinator",
    version,
    about = "meshvault coordinator: replica placement, consensus ledger and verified retrieval"
)]
struct Args {
    /// JSON config file; `MESHVAULT_*` variables override it.
    #[arg(long, env = "MESHVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    ledger_path: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept peer connections and run periodic consensus rounds.
    Serve(ServeArgs),
    /// Encrypt and distribute a file to the given peers.
    Upload(UploadArgs),
    /// Fetch, verify and decrypt a file.
    Download(DownloadArgs),
    /// Append a deletion marker and drop the file's replicas.
    Delete(FileArgs),
    /// Record that a file is shared with another user.
    Share(ShareArgs),
    /// Withdraw a share.
    Unshare(ShareArgs),
    /// List an owner's files.
    List(ListArgs),
    /// Run one consensus round over the pending blocks.
    Sweep(PeerArgs),
    /// Print ledger statistics.
    Stats,
    /// Re-check every block hash and link.
    VerifyLedger,
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    transport: Option<TransportKind>,
}

#[derive(ClapArgs, Debug, Default)]
struct PeerArgs {
    /// Request/reply peers as `id=host:port`.
    #[arg(long = "peer", num_args = 1..)]
    peers: Vec<String>,
}

#[derive(ClapArgs, Debug)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,

    #[arg(long)]
    owner: String,

    #[arg(long, env = "MESHVAULT_SECRET", hide_env_values = true)]
    secret: String,

    /// Display name; defaults to the file name.
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    peers: PeerArgs,
}

#[derive(ClapArgs, Debug)]
struct DownloadArgs {
    #[arg(long)]
    file_id: String,

    #[arg(long)]
    owner: String,

    #[arg(long, env = "MESHVAULT_SECRET", hide_env_values = true)]
    secret: String,

    #[arg(long, default_value = "recovered.bin")]
    out: PathBuf,

    #[command(flatten)]
    peers: PeerArgs,
}

#[derive(ClapArgs, Debug)]
struct FileArgs {
    #[arg(long)]
    file_id: String,

    #[arg(long)]
    owner: String,

    #[command(flatten)]
    peers: PeerArgs,
}

#[derive(ClapArgs, Debug)]
struct ShareArgs {
    #[arg(long)]
    file_id: String,

    #[arg(long)]
    owner: String,

    #[arg(long)]
    grantee: String,
}

#[derive(ClapArgs, Debug)]
struct ListArgs {
    #[arg(long)]
    owner: String,

    #[arg(long, default_value_t = false)]
    confirmed_only: bool,

    /// List files shared with `owner` instead of files owned.
    #[arg(long, default_value_t = false)]
    shared: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = CoordinatorConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.ledger_path {
        config.ledger_path = path.clone();
    }

    match args.command {
        Commands::Serve(serve) => {
            if let Some(listen) = serve.listen {
                config.listen = listen;
            }
            if let Some(transport) = serve.transport {
                config.transport = transport;
            }
            run_coordinator(config).await
        }
        Commands::Upload(upload) => {
            let data = fs::read(&upload.file)
                .with_context(|| format!("failed to read {}", upload.file.display()))?;
            let name = upload.name.clone().unwrap_or_else(|| {
                upload
                    .file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".to_string())
            });
            let orchestrator = offline_orchestrator(&config, &upload.peers)?;
            let report = orchestrator
                .upload(&upload.owner, &name, &data, upload.secret.as_bytes())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Download(download) => {
            let (directory, transport) = static_peers(&config, &download.peers)?;
            let ledger = open_ledger(&config)?;
            let verifier =
                RetrievalVerifier::new(directory, transport, ledger, config.retrieve_workers);
            let file = verifier
                .retrieve(&download.file_id, &download.owner, download.secret.as_bytes())
                .await?;
            fs::write(&download.out, &file.data)
                .with_context(|| format!("failed to write {}", download.out.display()))?;
            info!(
                file = %download.file_id,
                name = %file.metadata.name,
                bytes = file.data.len(),
                out = %download.out.display(),
                "download complete"
            );
            Ok(())
        }
        Commands::Delete(delete) => {
            let orchestrator = offline_orchestrator(&config, &delete.peers)?;
            let block = orchestrator.delete_file(&delete.file_id, &delete.owner).await?;
            // Give the fire-and-forget replica deletes a moment before exit.
            tokio::time::sleep(config.request_timeout().min(std::time::Duration::from_secs(2))).await;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(())
        }
        Commands::Share(share) => {
            let orchestrator = offline_orchestrator(&config, &PeerArgs::default())?;
            let block = orchestrator.share_file(&share.file_id, &share.owner, &share.grantee)?;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(())
        }
        Commands::Unshare(share) => {
            let orchestrator = offline_orchestrator(&config, &PeerArgs::default())?;
            let block = orchestrator.unshare_file(&share.file_id, &share.owner, &share.grantee)?;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(())
        }
        Commands::List(list) => {
            let ledger = open_ledger(&config)?;
            let files = if list.shared {
                ledger.shared_with(&list.owner)
            } else {
                ledger.user_files(&list.owner, !list.confirmed_only)
            };
            println!("{}", serde_json::to_string_pretty(&files)?);
            Ok(())
        }
        Commands::Sweep(peers) => {
            let orchestrator = offline_orchestrator(&config, &peers)?;
            let confirmed = orchestrator.sweep_pending().await;
            println!("{confirmed} block(s) confirmed");
            Ok(())
        }
        Commands::Stats => {
            let ledger = open_ledger(&config)?;
            println!("{}", serde_json::to_string_pretty(&ledger.stats())?);
            Ok(())
        }
        Commands::VerifyLedger => {
            let ledger = open_ledger(&config)?;
            ledger.verify_chain()?;
            println!("ledger ok: {} block(s)", ledger.len());
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_ledger(config: &CoordinatorConfig) -> Result<Arc<Ledger>> {
    let ledger = Ledger::open(&config.ledger_path, QuorumPolicy::from_config(config))
        .with_context(|| format!("failed to open ledger {}", config.ledger_path.display()))?;
    Ok(Arc::new(ledger))
}

fn http_transport(config: &CoordinatorConfig) -> Result<HttpTransport> {
    Ok(
        HttpTransport::new(config.request_timeout(), config.retries, config.backoff_base())?
            .with_admin_token(config.admin_token.clone()),
    )
}

fn parse_peer(raw: &str) -> Result<Peer> {
    let (id, address) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("peer '{raw}' must look like id=host:port"))?;
    if id.is_empty() || address.is_empty() {
        return Err(anyhow!("peer '{raw}' must look like id=host:port"));
    }
    Ok(Peer::new(id, address))
}

fn static_peers(
    config: &CoordinatorConfig,
    args: &PeerArgs,
) -> Result<(Arc<dyn PeerDirectory>, Arc<dyn ReplicaTransport>)> {
    let peers = args
        .peers
        .iter()
        .map(|raw| parse_peer(raw))
        .collect::<Result<Vec<_>>>()?;
    let directory: Arc<dyn PeerDirectory> = Arc::new(StaticDirectory::new(peers));
    let transport: Arc<dyn ReplicaTransport> = Arc::new(http_transport(config)?);
    Ok((directory, transport))
}

/// One-shot commands talk to explicitly listed peers over HTTP.
fn offline_orchestrator(config: &CoordinatorConfig, args: &PeerArgs) -> Result<Orchestrator> {
    let (directory, transport) = static_peers(config, args)?;
    Ok(Orchestrator::new(
        config.clone(),
        directory,
        transport,
        open_ledger(config)?,
    ))
}

async fn run_coordinator(config: CoordinatorConfig) -> Result<()> {
    let ledger = open_ledger(&config)?;
    let hub = Arc::new(PeerHub::new(config.request_timeout()));

    // Peers always register over the socket; in http mode they are then
    // reached at the address they advertised.
    let directory: Arc<dyn PeerDirectory> = match config.transport {
        TransportKind::Duplex => hub.clone(),
        TransportKind::Http => Arc::new(Addressed(hub.clone())),
    };
    let transport: Arc<dyn ReplicaTransport> = match config.transport {
        TransportKind::Duplex => hub.clone(),
        TransportKind::Http => Arc::new(http_transport(&config)?),
    };
    info!(
        transport = transport.name(),
        replication = config.replication_factor,
        min_confirmations = config.min_confirmations,
        quorum_percent = config.quorum_percent,
        allow_pending = config.allow_pending,
        ledger = %config.ledger_path.display(),
        blocks = ledger.len(),
        "coordinator configured"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        directory.clone(),
        transport.clone(),
        ledger.clone(),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(
        orchestrator
            .clone()
            .run_sweeper(config.consensus_sweep_interval(), stop_rx),
    );

    let state = AppState {
        hub,
        directory,
        ledger,
        transport: transport.name(),
    };
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    let _ = stop_tx.send(true);
    sweeper.await?;
    Ok(())
}
