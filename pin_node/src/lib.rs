//! A pin cluster node.
//!
//! Every node embeds an [`Allocator`]. A node with a `listen_addr` accepts
//! connections and allocates when the rotation picks it; a node with a
//! `discovery` address dials that allocator, reports its capacity and pins
//! what it is given.

use crate::capacity::CapacitySource;
use crate::config::{NodeConfigBlockStore, NodeConfigLedger, PinNodeConfig};
use crate::executor::{KuboExecutor, PinExecutor};
use crate::peer::PeerOptions;
use anyhow::Context;
use pin_core::Ledger;
use pin_ledger_memory::MemoryLedger;
use pin_ledger_redb::RedbLedger;
use pin_protocol::ClusterSecret;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::info;

pub mod allocator;
pub mod capacity;
pub mod config;
mod connection;
pub mod executor;
pub mod identity;
pub mod peer;
pub mod peers;
pub mod server;

pub use allocator::Allocator;

fn resolve(path: &Path, config_dir: Option<&Path>) -> PathBuf {
    match config_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

pub fn create_ledger(
    config: &NodeConfigLedger,
    config_dir: Option<&Path>,
) -> anyhow::Result<Arc<dyn Ledger>> {
    let ledger: Arc<dyn Ledger> = match config {
        NodeConfigLedger::Redb { path } => Arc::new(RedbLedger::open(resolve(path, config_dir))?),
        NodeConfigLedger::Memory => Arc::new(MemoryLedger::new()),
    };
    Ok(ledger)
}

pub fn create_executor(
    config: &NodeConfigBlockStore,
) -> anyhow::Result<Option<Arc<dyn PinExecutor>>> {
    let Some(endpoint) = &config.endpoint else {
        return Ok(None);
    };
    let executor: Arc<dyn PinExecutor> = Arc::new(KuboExecutor::new(endpoint.as_str())?);
    Ok(Some(executor))
}

pub async fn run_node(config_file_path: PathBuf, config: PinNodeConfig) -> anyhow::Result<()> {
    let config_dir = config_file_path.parent();
    let secret_key = identity::load_secret_key(&config.identity, config_dir)
        .context("no usable secret key in node config")?;
    let own_id = identity::peer_id(&secret_key);

    let mut node = Allocator::new(own_id.clone(), create_ledger(&config.ledger, config_dir)?)
        .with_advertise(config.cluster.advertise.clone());
    if let Some(executor) = create_executor(&config.block_store)? {
        node = node.with_executor(executor);
    }
    let node = Arc::new(node);
    let secret = ClusterSecret::new(config.cluster.secret.clone());
    info!(peer = %own_id, "starting pin node");

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    if let Some(addr) = &config.cluster.listen_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tasks.spawn(server::serve(listener, node.clone(), secret.clone()));
    }
    if let Some(discovery) = config.cluster.discovery.clone() {
        let data_dir = config
            .block_store
            .data_dir
            .as_deref()
            .map(|dir| resolve(dir, config_dir))
            .or_else(|| config_dir.map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let options = PeerOptions {
            discovery,
            secret,
            capacity: CapacitySource::Disk(data_dir),
            report_interval: config.cluster.report_interval_secs.map(Duration::from_secs),
        };
        let node = node.clone();
        tasks.spawn(async move {
            peer::run_peer(node, options).await;
            Ok(())
        });
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        Some(res) = tasks.join_next() => res??,
    }

    info!("shutting down");
    tasks.shutdown().await;
    Ok(())
}
