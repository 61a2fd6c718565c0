//! Standalone mesh node.
//!
//! Run three nodes and join them into one mesh:
//!   cargo run -p mesh-node -- --port 7001
//!   cargo run -p mesh-node -- --port 7002 --peer localhost:7001
//!   cargo run -p mesh-node -- --port 7003 --peer localhost:7001 --state '{"name":"c"}'
//!
//! Settings can also come from a TOML file (`--config node.toml`); flags win.

use anyhow::Context;
use clap::Parser;
use meshlink_core::Contact;
use meshlink_node::{NodeEvent, Server, ServerConfig, UpdateOptions};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "Run a meshlink node")]
struct Args {
    /// TOML file with `host`, `port` and `state`
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Host to listen on and advertise to peers
    #[arg(long, env = "MESH_HOST")]
    host: Option<String>,

    /// Port to listen on (0 picks one)
    #[arg(long, short, env = "MESH_PORT")]
    port: Option<u16>,

    /// Initial local state as JSON
    #[arg(long)]
    state: Option<String>,

    /// Peer to join on startup, as host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<Contact>,
}

impl Args {
    fn config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => ServerConfig::new(0),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(state) = &self.state {
            config.state = serde_json::from_str(state).context("parsing --state")?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mesh_node=info".parse()?)
                .add_directive("meshlink_node=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let server = Server::bind(args.config()?).await?;
    let mut events = server.subscribe();
    tracing::info!("node {} up", server.contact());

    for peer in &args.peers {
        server.connect_peer(peer)?;
    }

    // this node forwards nothing, so offer each queued message once and let it go
    let drain = UpdateOptions {
        max_resends: 1,
        max_updates: usize::MAX,
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let drained = server.updates(drain).await?;
                if !drained.is_empty() {
                    tracing::debug!(count = drained.len(), "drained peer logs");
                }
            },
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("peers at shutdown: {:?}", server.peers().await?);
    server.stop();
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::Connected(peer) => tracing::info!("{peer} joined"),
        NodeEvent::Disconnected(peer) => tracing::info!("{peer} left"),
        NodeEvent::StateUpdated { peer, state } => tracing::info!("{peer} state: {state}"),
        NodeEvent::PeersReceived { peer, peers } => {
            let list: Vec<String> = peers.iter().map(Contact::encode).collect();
            tracing::info!("{peer} lists [{}]", list.join(", "));
        }
        NodeEvent::Message { peer, cmd, .. } => match peer {
            Some(peer) => tracing::debug!("{cmd} from {peer}"),
            None => tracing::debug!("{cmd} from unnamed connection"),
        },
        NodeEvent::Error(err) => tracing::warn!("{err}"),
    }
}
