use anyhow::{Context, Result};
use clap::Parser;
use meshvault_node::{load_or_create_identity, server, SecureBlockStore, StorageNode, WsBridge};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

const DEFAULT_STORAGE_PATH: &str = "./node-data";
const DEFAULT_MAX_GB: u64 = 50;

#[derive(Parser, Debug)]
#[command(name = "meshvault-node", version, about = "meshvault storage peer")]
struct Args {
    /// Directory for the block store and the node identity.
    #[arg(long, env = "MESHVAULT_NODE_STORAGE")]
    storage_path: Option<PathBuf>,

    /// Storage allowance in GiB.
    #[arg(long, env = "MESHVAULT_NODE_MAX_GB")]
    max_gb: Option<u64>,

    /// Request/reply HTTP listen address.
    #[arg(long, env = "MESHVAULT_NODE_LISTEN", default_value = "0.0.0.0:9000")]
    listen: String,

    /// Coordinator duplex endpoint, e.g. ws://host:8080/peers/ws
    #[arg(long, env = "MESHVAULT_COORDINATOR_URL")]
    coordinator_url: Option<String>,

    /// HTTP address the coordinator should use to reach this node.
    #[arg(long, env = "MESHVAULT_NODE_ADVERTISE")]
    advertise_address: Option<String>,

    #[arg(long, env = "MESHVAULT_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Saved setup (storage path, allowance, coordinator); flags win.
    #[arg(long, env = "MESHVAULT_NODE_SETUP")]
    setup: Option<PathBuf>,

    /// Write the resolved setup back to `--setup` and exit.
    #[arg(long, default_value_t = false, requires = "setup")]
    save_setup: bool,

    #[arg(long, default_value_t = false)]
    print_node_id: bool,

    #[arg(long, default_value_t = false)]
    log_json: bool,
}

/// The part of the node's configuration worth keeping between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeSetup {
    storage_path: PathBuf,
    max_gb: u64,
    #[serde(default)]
    coordinator_url: Option<String>,
}

impl Default for NodeSetup {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            max_gb: DEFAULT_MAX_GB,
            coordinator_url: None,
        }
    }
}

impl NodeSetup {
    fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .with_context(|| format!("failed to parse setup {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read setup {}", path.display())),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("failed to write setup {}", path.display()))
    }

    /// Saved values, each replaced by its flag or variable when given.
    fn overlay(self, args: &Args) -> Self {
        Self {
            storage_path: args.storage_path.clone().unwrap_or(self.storage_path),
            max_gb: args.max_gb.unwrap_or(self.max_gb),
            coordinator_url: args.coordinator_url.clone().or(self.coordinator_url),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(args.log_json);

    let saved = match &args.setup {
        Some(path) => NodeSetup::load(path)?,
        None => None,
    };
    if saved.is_some() {
        info!(path = ?args.setup, "loaded saved node setup");
    }
    let setup = saved.unwrap_or_default().overlay(&args);
    if setup.max_gb == 0 {
        anyhow::bail!("max_gb must be greater than zero");
    }

    if let (true, Some(path)) = (args.save_setup, &args.setup) {
        setup.save(path)?;
        println!("saved node setup to {}", path.display());
        return Ok(());
    }
    if args.print_node_id {
        fs::create_dir_all(&setup.storage_path)?;
        let keypair = load_or_create_identity(&setup.storage_path)?;
        println!("{}", keypair.public().to_peer_id());
        return Ok(());
    }
    run_node(setup, &args).await
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

async fn run_node(setup: NodeSetup, args: &Args) -> Result<()> {
    fs::create_dir_all(&setup.storage_path).with_context(|| {
        format!("failed to create storage dir {}", setup.storage_path.display())
    })?;

    let store = SecureBlockStore::open(setup.storage_path.join("blocks"), setup.max_gb)
        .context("failed to open block store")?;
    let keypair = load_or_create_identity(&setup.storage_path)?;
    let node = Arc::new(StorageNode::new(
        Arc::new(store),
        keypair,
        args.admin_token.clone().filter(|t| !t.is_empty()),
    ));
    info!(
        node_id = %node.node_id(),
        max_gb = setup.max_gb,
        path = %setup.storage_path.display(),
        admin_delete = args.admin_token.is_some(),
        "storage peer ready"
    );

    let (stop_bridge, bridge_stopped) = oneshot::channel();
    let bridge = setup.coordinator_url.clone().map(|url| {
        tokio::spawn(
            WsBridge {
                url,
                node: node.clone(),
                advertise_address: args.advertise_address.clone(),
            }
            .run(bridge_stopped),
        )
    });

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    server::serve(listener, node.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    let _ = stop_bridge.send(());
    if let Some(handle) = bridge {
        handle.await??;
    }
    node.block_store().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_saved_setup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("node.json");
        let saved = NodeSetup {
            storage_path: PathBuf::from("/srv/meshvault"),
            max_gb: 10,
            coordinator_url: Some("ws://coord:8080/peers/ws".into()),
        };
        saved.save(&path).unwrap();
        assert_eq!(NodeSetup::load(&path).unwrap(), Some(saved.clone()));

        let args = Args::parse_from(["meshvault-node", "--max-gb", "75"]);
        let merged = saved.overlay(&args);
        assert_eq!(merged.max_gb, 75);
        assert_eq!(merged.storage_path, PathBuf::from("/srv/meshvault"));
        assert_eq!(merged.coordinator_url.as_deref(), Some("ws://coord:8080/peers/ws"));
    }

    #[test]
    fn missing_setup_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(NodeSetup::load(&dir.path().join("absent.json")).unwrap(), None);
    }
}
