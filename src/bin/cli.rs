//! PeerDrop CLI tool
//!
//! A command-line peer: discovers other devices through a relay, then exchanges texts and
//! files with them over direct WebRTC data channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use peerdrop::config::DEFAULT_STUN_SERVER;
use peerdrop::negotiation::webrtc::WebRtcFactory;
use peerdrop::transfer::Direction;
use peerdrop::{
    ClientConfig, OutgoingFile, PeerCommand, PeerEvent, PeerId, PeerInfo, PeerManager,
    ReceivedFile, SignalingClient, TransferEvent,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// PeerDrop: send texts and files to nearby devices
#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Relay WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:3000")]
    server: String,

    /// STUN server URL (repeatable)
    #[arg(long, default_values_t = [DEFAULT_STUN_SERVER.to_string()])]
    stun: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay online, print peers and texts, save received files
    Listen {
        /// Where to save received files (default: Downloads)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Send texts and files to one peer, then exit
    Send {
        /// Peer id, display name or device name prefix
        #[arg(short, long)]
        to: String,

        /// Text message (repeatable)
        #[arg(long)]
        text: Vec<String>,

        /// File to send (repeatable)
        #[arg(long)]
        file: Vec<PathBuf>,
    },
}

struct Node {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    signaling: peerdrop::SignalingHandle,
}

impl Node {
    fn start(server: String, ice_servers: Vec<String>) -> anyhow::Result<Self> {
        let factory = WebRtcFactory::new(ice_servers.clone())
            .context("Failed to initialise WebRTC")?;
        let config = ClientConfig {
            server_url: server,
            ice_servers,
            ..Default::default()
        };

        let (signaling, client_events) = SignalingClient::spawn(config);
        let (manager, events) = PeerManager::new(Arc::new(factory), signaling.sender());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(manager.run(client_events, commands_rx));

        Ok(Node {
            events,
            commands,
            signaling,
        })
    }

    async fn next(&mut self) -> anyhow::Result<PeerEvent> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => bail!("Peer manager stopped"),
        }
    }

    fn command(&self, command: PeerCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Peer manager stopped"))
    }

    /// Let the manager finish queued commands, then leave the relay
    async fn stop(mut self) {
        drop(self.commands);
        while self.events.recv().await.is_some() {}
        self.signaling.shutdown().await;
    }
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("peerdrop={}", level).parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let node = Node::start(cli.server, cli.stun)?;
    match cli.command {
        Commands::Listen { output_dir } => {
            let dir = output_dir
                .or_else(dirs::download_dir)
                .unwrap_or_else(|| PathBuf::from("."));
            cmd_listen(node, &dir).await
        }
        Commands::Send { to, text, file } => cmd_send(node, &to, text, file).await,
    }
}

async fn cmd_listen(mut node: Node, dir: &Path) -> anyhow::Result<()> {
    println!("Saving received files to {}", dir.display());
    println!("Press Ctrl+C to quit.");

    loop {
        let event = tokio::select! {
            event = node.next() => event?,
            _ = tokio::signal::ctrl_c() => break,
        };

        match event {
            PeerEvent::Identity(me) => {
                println!("You are {} ({})", me.display_name, me.device_name)
            }
            PeerEvent::Peers(peers) => peers.iter().for_each(print_peer),
            PeerEvent::PeerJoined(peer) => print_peer(&peer),
            PeerEvent::PeerLeft(id) => println!("- {} left", id.short()),
            PeerEvent::Text { from, text } => println!("[{}] {}", from.short(), text),
            PeerEvent::Transfer { peer, event } => match event {
                TransferEvent::Received(file) => {
                    let path = save(dir, &file).await?;
                    println!("Received {} from {} -> {}", file.name, peer.short(), path.display());
                }
                TransferEvent::Progress {
                    direction: Direction::Incoming,
                    name,
                    progress,
                    ..
                } => println!("  {} {:>5.1}%", name, progress * 100.0),
                TransferEvent::Aborted { name, .. } => println!("Transfer of {} aborted", name),
                _ => {}
            },
            PeerEvent::SignalingLost => println!("Relay connection lost, reconnecting..."),
            _ => {}
        }
    }

    node.stop().await;
    Ok(())
}

async fn cmd_send(
    mut node: Node,
    target: &str,
    texts: Vec<String>,
    paths: Vec<PathBuf>,
) -> anyhow::Result<()> {
    if texts.is_empty() && paths.is_empty() {
        bail!("Nothing to send: use --text or --file");
    }
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = OutgoingFile::from_path(path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        files.push(file);
    }

    println!("Waiting for {}...", target);
    let peer = loop {
        let found = match node.next().await? {
            PeerEvent::Peers(peers) => peers.into_iter().find(|peer| is_target(peer, target)),
            PeerEvent::PeerJoined(peer) => Some(peer).filter(|peer| is_target(peer, target)),
            _ => None,
        };
        if let Some(peer) = found {
            break peer.peer_id;
        }
    };

    wait_for_channel(&mut node, &peer).await?;
    println!("Connected to {}", peer.short());

    for text in texts {
        node.command(PeerCommand::SendText {
            to: peer.clone(),
            text,
        })?;
    }
    let mut pending = files.len();
    for file in files {
        node.command(PeerCommand::SendFile {
            to: peer.clone(),
            file,
        })?;
    }

    while pending > 0 {
        match node.next().await? {
            PeerEvent::Transfer { event, .. } => match event {
                TransferEvent::Progress {
                    direction: Direction::Outgoing,
                    name,
                    progress,
                    ..
                } => println!("  {} {:>5.1}%", name, progress * 100.0),
                TransferEvent::Sent { name, .. } => {
                    println!("Sent {}", name);
                    pending -= 1;
                }
                TransferEvent::Aborted { name, .. } => bail!("Transfer of {} aborted", name),
                _ => {}
            },
            PeerEvent::PeerLeft(id) if id == peer => bail!("{} went away", peer.short()),
            _ => {}
        }
    }

    node.stop().await;
    Ok(())
}

async fn wait_for_channel(node: &mut Node, peer: &PeerId) -> anyhow::Result<()> {
    loop {
        match node.next().await? {
            PeerEvent::ChannelOpened(id) if &id == peer => return Ok(()),
            PeerEvent::PeerLeft(id) if &id == peer => bail!("{} went away", peer.short()),
            _ => {}
        }
    }
}

fn print_peer(peer: &PeerInfo) {
    println!(
        "+ {} {} ({})",
        peer.display_name, peer.device_name, peer.peer_id
    );
}

fn is_target(peer: &PeerInfo, target: &str) -> bool {
    let target = target.to_lowercase();
    [
        peer.peer_id.as_str(),
        peer.display_name.as_str(),
        peer.device_name.as_str(),
    ]
    .iter()
    .any(|candidate| candidate.to_lowercase().starts_with(&target))
}

/// Write `file` into `dir` without overwriting existing files
async fn save(dir: &Path, file: &ReceivedFile) -> anyhow::Result<PathBuf> {
    let name = Path::new(&file.name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("file-{}", file.file_id));

    tokio::fs::create_dir_all(dir).await?;
    let mut path = dir.join(&name);
    let mut n = 1;
    while tokio::fs::try_exists(&path).await? {
        path = dir.join(format!("{} ({})", name, n));
        n += 1;
    }
    tokio::fs::write(&path, &file.data).await?;
    Ok(path)
}
