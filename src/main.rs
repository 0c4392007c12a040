use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use ringchat::{ChatEvent, Identity, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "ringchat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for peers
    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// Address of an existing ring member to join, as host:port
    #[arg(long, value_name = "HOST:PORT")]
    peer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(NodeConfig {
        port: args.port,
        ..NodeConfig::default()
    })
    .await?;

    if let Some(peer) = &args.peer {
        if let Err(err) = node.join(peer).await {
            error!("failed to join peer {peer}: {err:#}");
            std::process::exit(1);
        }
        info!("joined ring via {peer}");
    }

    let mut events = node.events()?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChatEvent::Public { from, text } => info!("[{from}] {text}"),
                ChatEvent::Private { from, text } => info!("[(private) {from}] {text}"),
                ChatEvent::PrivateReady { peer } => {
                    info!("private chat ready with {peer}")
                }
            }
        }
    });

    tokio::spawn({
        let node = node.clone();
        async move { run_repl(node).await }
    });

    // Graceful shutdown on SIGINT or SIGTERM.
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received terminate"),
    }

    node.close().await;
    Ok(())
}

/// Read commands from stdin, one per line:
///
/// - `start_privatechat <base64 public key>` opens a private session
/// - `privatechat <base64 public key> <text...>` sends a private message
/// - anything else is broadcast as a public chat
async fn run_repl(node: Node) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("start_privatechat") {
            let mut tokens = rest.split_whitespace();
            let (Some(key), None) = (tokens.next(), tokens.next()) else {
                warn!("usage: start_privatechat <public key>");
                continue;
            };
            let target = match Identity::from_base64(key) {
                Ok(target) => target,
                Err(err) => {
                    warn!("start_privatechat: {err}");
                    continue;
                }
            };
            if let Err(err) = node.start_private_chat(&target).await {
                warn!("failed to start private chat: {err:#}");
            }
        } else if let Some(rest) = line.strip_prefix("privatechat") {
            let mut tokens = rest.split_whitespace();
            let Some(key) = tokens.next() else {
                warn!("usage: privatechat <public key> <text>");
                continue;
            };
            let text = tokens.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                warn!("usage: privatechat <public key> <text>");
                continue;
            }
            let target = match Identity::from_base64(key) {
                Ok(target) => target,
                Err(err) => {
                    warn!("privatechat: {err}");
                    continue;
                }
            };
            if let Err(err) = node.private_chat(&target, &text).await {
                warn!("failed to send private chat: {err:#}");
            }
        } else if let Err(err) = node.chat(line).await {
            warn!("failed to send chat: {err:#}");
        }
    }
}
