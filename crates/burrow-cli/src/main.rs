//! Burrow CLI
//!
//! Join a topic, watch peers surface, and trade encrypted messages.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, warn};

use burrow_node::{Node, NodeEvent};
use config::Config;

/// Burrow - self-organizing peer discovery and encrypted messaging
#[derive(Parser)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a topic and chat with its peers
    Join {
        /// Rendezvous topic
        #[arg(required = true)]
        topic: String,

        /// Shared passphrase; peers must agree on it to talk
        #[arg(short, long)]
        passphrase: Option<String>,

        /// Bootstrap node, host:port (repeatable)
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Listen address
        #[arg(long)]
        bind: Option<String>,

        /// STUN server, host:port (repeatable)
        #[arg(long)]
        stun: Vec<String>,
    },

    /// Discover the public address of this machine via STUN
    Stun {
        /// STUN server, host:port (repeatable)
        #[arg(required = true)]
        server: Vec<String>,
    },

    /// Print the persistent node id, generating it if needed
    Id,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Precedence: RUST_LOG, then --verbose, then the config file.
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Join {
            topic,
            passphrase,
            bootstrap,
            bind,
            stun,
        } => {
            join_topic(&config, topic, passphrase, bootstrap, bind, stun).await?;
        }
        Commands::Stun { server } => {
            stun_probe(&server).await?;
        }
        Commands::Id => {
            let id = burrow_node::identity::load_or_generate(&config.identity.file);
            println!("{}", hex::encode(id.as_bytes()));
        }
    }

    Ok(())
}

/// Run the interactive topic session.
///
/// Stdin lines broadcast to every connected peer; node events print
/// as they arrive. Discovered peers are dialed automatically.
async fn join_topic(
    config: &Config,
    topic: String,
    passphrase: Option<String>,
    bootstrap: Vec<String>,
    bind: Option<String>,
    stun: Vec<String>,
) -> anyhow::Result<()> {
    let mut node_config = config.to_node_config().await?;
    node_config.topic = Some(topic.clone());
    node_config.passphrase = passphrase;
    if let Some(bind) = bind {
        node_config.listen_addr = bind
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid bind address {bind:?}: {err}"))?;
    }
    if !bootstrap.is_empty() {
        node_config.discovery.bootstrap_nodes = config::resolve_all(&bootstrap).await?;
    }
    if !stun.is_empty() {
        node_config.nat.stun_servers = config::resolve_all(&stun).await?;
    }
    if node_config.discovery.bootstrap_nodes.is_empty() {
        warn!("no bootstrap nodes configured; only direct dials will work");
    }

    let (node, mut events) = Node::new(node_config)?;
    node.start().await?;

    println!("joined topic {topic:?}");
    if let Some(addr) = node.local_addr() {
        println!("listening on {addr}");
    }
    if let Some(public) = node.public_addr() {
        println!("public address {public}");
    }
    println!("node id {}", hex::encode(node.local_id().as_bytes()));
    println!("type a line to broadcast it; Ctrl+C to leave");

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let node = Arc::new(node);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&node, event);
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) if !line.is_empty() => {
                        let reached = node.broadcast(line.as_bytes()).await;
                        println!("-> sent to {reached} peer(s)");
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("leaving {topic:?}");
    node.stop().await;
    Ok(())
}

fn handle_event(node: &Arc<Node>, event: NodeEvent) {
    match event {
        NodeEvent::PeerDiscovered { addr } => {
            println!("* discovered peer at {addr}, dialing");
            let node = Arc::clone(node);
            tokio::spawn(async move {
                if let Err(err) = node.connect(addr).await {
                    debug!(%addr, %err, "dial failed");
                    println!("* dial to {addr} failed: {err}");
                }
            });
        }
        NodeEvent::Connected { peer, addr } => {
            println!("* connected to {} at {addr}", short_id(&peer));
        }
        NodeEvent::Data { peer, payload } => {
            let text = String::from_utf8_lossy(&payload);
            println!("<{}> {text}", short_id(&peer));
        }
        NodeEvent::Closed { peer, addr, reason } => match peer {
            Some(peer) => println!("* {} at {addr} closed: {reason:?}", short_id(&peer)),
            None => println!("* {addr} closed: {reason:?}"),
        },
        NodeEvent::Error { message } => {
            println!("* error: {message}");
        }
    }
}

fn short_id(id: &burrow_dht::NodeId) -> String {
    hex::encode(&id.as_bytes()[..4])
}

/// One-shot reflexive address discovery.
async fn stun_probe(servers: &[String]) -> anyhow::Result<()> {
    let resolved: Vec<SocketAddr> = config::resolve_all(servers).await?;
    let socket = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:0").await?);
    println!("local address {}", socket.local_addr()?);

    match burrow_nat::first_mapping(&socket, &resolved, Duration::from_secs(3)).await {
        Some(mapped) => {
            println!("public address {mapped}");
            Ok(())
        }
        None => anyhow::bail!("no STUN server answered"),
    }
}
