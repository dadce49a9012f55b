use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use recon_store::{
    config::{paths, NodeConfig},
    net::tcp::{self, TcpTransport},
    store::{fs, memory, Store},
    workers::Ingress,
    Node, PeerId, Transaction, TxnId, Update,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Run a reconciliation node.
#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
struct Cli {
    /// Config file. Defaults to the `recon.config.toml` in the config directory, if present.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Override the configured node id.
    #[clap(long)]
    node_id: Option<u64>,
    /// Override the configured peer.
    #[clap(long)]
    peer: Option<String>,
    /// Override the configured listen address.
    #[clap(long)]
    bind_addr: Option<std::net::SocketAddr>,
    /// Publish the transactions in this TOML file once the node is up.
    #[clap(long)]
    publish: Option<PathBuf>,
    /// Reconcile periodically, every this many seconds.
    #[clap(long)]
    reconcile_every: Option<u64>,
}

/// Transactions to publish, as read from a `--publish` file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TxnFile {
    #[serde(default)]
    txn: Vec<TxnEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TxnEntry {
    seq: u32,
    #[serde(default)]
    update: Vec<UpdateEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateEntry {
    relation: String,
    key: String,
    /// Deletes the row if unset.
    value: Option<String>,
    /// Antecedents as `peer/seq`.
    #[serde(default)]
    depends_on: Vec<String>,
}

fn parse_tid(s: &str) -> Result<TxnId> {
    let (peer, seq) = s
        .rsplit_once('/')
        .ok_or_else(|| anyhow!("expected peer/seq, got {s:?}"))?;
    let peer: PeerId = peer.parse().unwrap_or_else(|e| match e {});
    Ok(TxnId::new(peer, seq.parse().context("invalid seq")?))
}

async fn read_txns(path: &Path, peer: &PeerId) -> Result<Vec<Transaction>> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: TxnFile = toml::from_str(&source)?;
    file.txn
        .into_iter()
        .map(|entry| -> Result<Transaction> {
            let updates = entry
                .update
                .into_iter()
                .map(|u| -> Result<Update> {
                    let mut update = match u.value {
                        Some(value) => Update::put(u.relation, u.key, value),
                        None => Update::delete(u.relation, u.key),
                    };
                    for dep in &u.depends_on {
                        update = update.depends_on(parse_tid(dep)?);
                    }
                    Ok(update)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Transaction::new(TxnId::new(peer.clone(), entry.seq), updates))
        })
        .collect()
}

fn init_terminal_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .try_init()?;
    Ok(())
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("recon-runtime")
        .enable_all()
        .build()?;
    rt.block_on(main_impl())?;
    rt.shutdown_timeout(Duration::from_millis(500));
    Ok(())
}

async fn main_impl() -> Result<()> {
    init_terminal_logging()?;
    let cli = Cli::parse();
    let file = match cli.config.clone() {
        Some(file) => Some(file),
        None => paths::default_config_file()?,
    };
    let mut config = NodeConfig::load(file.as_deref()).await?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(peer) = &cli.peer {
        config.peer = peer.clone();
    }
    if let Some(addr) = cli.bind_addr {
        config.bind_addr = addr;
    }
    match config.data_dir.clone() {
        Some(dir) => {
            tokio::fs::create_dir_all(&dir).await?;
            let store = fs::Store::persistent(dir.join("recon.redb"))?;
            run(config, store, &cli).await
        }
        None => {
            warn!("no data_dir configured, storing in memory");
            run(config, memory::Store::default(), &cli).await
        }
    }
}

async fn run<S: Store>(config: NodeConfig, store: S, cli: &Cli) -> Result<()> {
    let mut addrs: BTreeMap<_, _> = config
        .nodes
        .iter()
        .map(|n| (recon_store::NodeId(n.id), n.addr))
        .collect();
    addrs.insert(config.node_id(), config.bind_addr);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let ingress = Ingress::new();
    let server = tokio::spawn(tcp::serve(listener, ingress.inbox()));
    let transport = Arc::new(TcpTransport::new(addrs));
    let node = Arc::new(Node::builder(config, store).spawn(transport, ingress));

    if let Some(path) = &cli.publish {
        let txns = read_txns(path, node.peer()).await?;
        let epoch = node.publish(txns).await?;
        println!("published epoch {epoch}");
    }
    let reconciler = cli.reconcile_every.map(|secs| {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                interval.tick().await;
                match node.reconcile().await {
                    Ok(outcome) => info!(
                        recno = ?outcome.recno,
                        epoch = %outcome.epoch,
                        accepted = outcome.accepted.len(),
                        rejected = outcome.rejected.len(),
                        deferred = outcome.deferred.len(),
                        "reconciliation done"
                    ),
                    Err(err) => error!("reconciliation failed: {err:#}"),
                }
            }
        })
    });

    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        res = server => res??,
    }
    if let Some(reconciler) = reconciler {
        reconciler.abort();
    }
    node.shutdown();
    Ok(())
}
