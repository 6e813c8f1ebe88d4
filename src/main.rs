//! meshcall - Full-mesh call signaling client

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshcall::config::{IceServerConfig, MeshConfig};
use meshcall::mesh::{MeshClient, MeshEvent, MeshHandle};
use meshcall::network::{ChannelState, WebRtcTransportFactory};
use meshcall::PeerId;

#[derive(Parser)]
#[command(name = "meshcall")]
#[command(about = "Full-mesh call signaling client")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling relay URL (e.g., wss://example.com/socket)
    #[arg(short, long, env = "MESHCALL_SERVER")]
    server: Option<String>,

    /// Your user id on the relay
    #[arg(short, long, env = "MESHCALL_USER")]
    user: Option<u64>,

    /// Credential sent to the relay
    #[arg(long, env = "MESHCALL_CREDENTIAL", hide_env_values = true)]
    credential: Option<String>,

    /// ICE server URL, may be repeated (replaces the configured list)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Username for `turn:` servers given with --ice-server
    #[arg(long, env = "MESHCALL_TURN_USERNAME")]
    turn_username: Option<String>,

    /// Credential for `turn:` servers given with --ice-server
    #[arg(long, env = "MESHCALL_TURN_CREDENTIAL", hide_env_values = true)]
    turn_credential: Option<String>,

    /// Forward peer diagnostics to the relay
    #[arg(long)]
    forward_peer_logs: bool,

    /// Join the call as soon as the relay accepts us
    #[arg(long)]
    call: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<MeshConfig> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::load(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => MeshConfig::default(),
        };

        if let Some(server) = self.server {
            config.server_url = server;
        }
        if let Some(user) = self.user {
            config.user_id = PeerId(user);
        }
        if let Some(credential) = self.credential {
            config.credential = credential;
        }
        if !self.ice_servers.is_empty() {
            let (username, credential) = (self.turn_username, self.turn_credential);
            config.ice_servers = self
                .ice_servers
                .into_iter()
                .map(|url| {
                    let mut server = IceServerConfig::stun(url);
                    if server.is_turn() {
                        server.username = username.clone();
                        server.credential = credential.clone();
                    }
                    server
                })
                .collect();
        }
        config.forward_peer_logs |= self.forward_peer_logs;

        config.validate()?;
        Ok(config)
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Print a presentation event; returns true when the call should be joined
fn handle_mesh_event(event: &MeshEvent, auto_call: bool) -> bool {
    match event {
        MeshEvent::ChannelStateChanged(state) => {
            println!("📡 Relay: {}", state);
            auto_call && *state == ChannelState::Authenticated
        }
        MeshEvent::ChannelError(error) => {
            println!("⚠️  Relay error: {}", error);
            false
        }
        MeshEvent::ChannelClosed(info) => {
            println!("🔌 {}", info);
            false
        }
        MeshEvent::RelayClosing => {
            println!("🔌 Relay is shutting down");
            false
        }
        MeshEvent::PeerAdded { peer_id, role } => {
            println!("➕ Peer {} joined ({})", peer_id, role);
            false
        }
        MeshEvent::PeerRemoved { peer_id } => {
            println!("➖ Peer {} left", peer_id);
            false
        }
        MeshEvent::PeerConnectivityChanged { peer_id, state } => {
            println!("🔗 Peer {}: {}", peer_id, state);
            false
        }
        MeshEvent::RemoteTrackAvailable { peer_id, track } => {
            println!(
                "🎥 Peer {}: {:?} track {} (stream {})",
                peer_id, track.kind, track.track_id, track.stream_id
            );
            false
        }
        MeshEvent::MembershipReconciled { peers } => {
            let peers: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
            println!("👥 In call with: [{}]", peers.join(", "));
            false
        }
        MeshEvent::PeerRecoveryFailed { peer_id, reason } => {
            println!("❌ Could not reconnect to peer {}: {}", peer_id, reason);
            false
        }
    }
}

/// Handle one interactive command; returns false to quit
async fn handle_command(handle: &MeshHandle, line: &str) -> Result<bool> {
    match line {
        "connect" => match handle.connect().await {
            Ok(()) => println!("📡 Connecting..."),
            Err(e) => println!("Cannot connect: {}", e),
        },
        "disconnect" => {
            if !handle.disconnect().await? {
                println!("Not connected");
            }
        }
        "call" => match handle.call().await {
            Ok(()) => println!("📞 Joining call..."),
            Err(e) => println!("Cannot call: {}", e),
        },
        "hangup" => {
            if !handle.hangup().await? {
                println!("Not in a call");
            }
        }
        "status" => println!("{}", handle.snapshot().await?),
        "quit" | "exit" => return Ok(false),
        "" => {}
        other => println!(
            "Unknown command: {} (connect, disconnect, call, hangup, status, quit)",
            other
        ),
    }
    Ok(true)
}

async fn run(config: MeshConfig, auto_call: bool) -> Result<()> {
    let factory = WebRtcTransportFactory::new(&config.ice_servers)
        .context("Failed to set up the media engine")?;
    let server_url = config.server_url.clone();

    let (client, handle, mut events) = MeshClient::new(config, factory);
    let client_task = tokio::spawn(client.run());

    handle.connect().await?;
    info!("Connecting to {}", server_url);
    println!("Commands: connect, disconnect, call, hangup, status, quit");

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if handle_mesh_event(&event, auto_call) {
                    if let Err(e) = handle.call().await {
                        warn!("Failed to join call: {}", e);
                    }
                }
            }
            line_result = stdin_reader.next_line(), if stdin_open => {
                match line_result {
                    Ok(Some(line)) => {
                        if !handle_command(&handle, line.trim()).await? {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    handle.shutdown().await?;
    client_task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let auto_call = cli.call;
    let config = cli.into_config()?;
    run(config, auto_call).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<MeshConfig> {
        let mut argv = vec!["meshcall", "--server", "ws://127.0.0.1:8080", "--user", "3"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).into_config()
    }

    #[test]
    fn test_turn_server_from_flags() {
        let config = parse(&[
            "--ice-server",
            "stun:stun.example.com:3478",
            "--ice-server",
            "turn:turn.example.com:3478",
            "--turn-username",
            "alice",
            "--turn-credential",
            "secret",
        ])
        .unwrap();

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].username, None);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("alice"));
        assert_eq!(config.ice_servers[1].credential.as_deref(), Some("secret"));
    }

    #[test]
    fn test_turn_server_without_credentials_is_rejected() {
        assert!(parse(&["--ice-server", "turn:turn.example.com:3478"]).is_err());
    }

    #[tokio::test]
    async fn test_connect_command_reconnects() {
        // Accepts TCP but never answers the WebSocket handshake
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let config = MeshConfig {
            server_url: url,
            ..Default::default()
        };
        let factory = WebRtcTransportFactory::new(&[]).unwrap();
        let (client, handle, _events) = MeshClient::new(config, factory);
        let task = tokio::spawn(client.run());

        assert!(handle_command(&handle, "connect").await.unwrap());
        assert_eq!(handle.snapshot().await.unwrap().channel, ChannelState::Connecting);

        assert!(handle_command(&handle, "disconnect").await.unwrap());
        assert_eq!(handle.snapshot().await.unwrap().channel, ChannelState::Disconnected);

        assert!(handle_command(&handle, "connect").await.unwrap());
        assert_eq!(handle.snapshot().await.unwrap().channel, ChannelState::Connecting);

        assert!(!handle_command(&handle, "quit").await.unwrap());
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
