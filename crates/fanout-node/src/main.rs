mod common;
mod console;

use clap::{Parser, Subcommand};
use console::{ConsoleSink, Mode};
use fanout_core::{
    BroadcastService, DiscoveryBridge, DiscoveryMode, FanoutConfig, FrameSink, PingService,
    DEFAULT_PROTOCOL,
};
use fanout_transport::{
    Beacon, BeaconConfig, HostConfig, Overlay, PeerAddr, PeerFound, ProtocolId, TcpOverlay,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(name = "fanout", about = "Fan stdin lines out to every discovered peer")]
struct Cli {
    /// TCP listen address (default: FANOUT_LISTEN_ADDR or 127.0.0.1:0).
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Bootstrap peer as <peer-hex>@<ip:port>. Repeatable.
    #[arg(short, long = "peer")]
    peers: Vec<PeerAddr>,

    /// Beacon namespace; only peers in the same namespace are discovered.
    #[arg(long, default_value = "fanout")]
    namespace: String,

    /// Disable LAN multicast discovery.
    #[arg(long)]
    no_beacon: bool,

    /// Record discovered peers without opening a stream until the next broadcast.
    #[arg(long)]
    deferred: bool,

    /// Channel to broadcast on.
    #[arg(long, default_value = DEFAULT_PROTOCOL)]
    protocol: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Broadcast each stdin line to every peer.
    Broadcast,
    /// Ping every known peer with each stdin line.
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut host_config = HostConfig::new();
    if let Some(addr) = cli.listen {
        host_config = host_config.listen_addr(addr);
    }
    let host = Arc::new(TcpOverlay::bind(host_config).await?);

    eprintln!("fanout v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Peer ID: {}", host.local_peer_id());
    eprintln!("Listening on {}", host.listen_addr());
    eprintln!("Dial with: --peer {}", host.peer_addr());
    eprintln!();

    let shutdown = CancellationToken::new();
    common::watch_signals(shutdown.clone());

    let config = FanoutConfig {
        default_protocol: ProtocolId::new(&cli.protocol),
        discovery_mode: if cli.deferred {
            DiscoveryMode::Deferred
        } else {
            DiscoveryMode::Eager
        },
        ..FanoutConfig::default()
    };
    let sink: Arc<dyn FrameSink> = Arc::new(ConsoleSink);
    let service = BroadcastService::new(host.clone(), config, sink.clone(), shutdown.clone());
    service.add_channel(service.config().default_protocol.clone());
    let ping = PingService::register(host.clone(), sink, service.config());

    let (found_tx, found_rx) = mpsc::channel::<PeerFound>(64);
    let bridge = tokio::spawn(DiscoveryBridge::new(service.clone()).run(found_rx, shutdown.clone()));

    for PeerAddr { peer, addr } in cli.peers {
        let _ = found_tx
            .send(PeerFound {
                peer,
                addrs: vec![addr],
            })
            .await;
    }

    if !cli.no_beacon {
        let beacon_config = BeaconConfig::new().namespace(cli.namespace);
        match Beacon::bind(beacon_config, host.local_peer_id(), vec![host.listen_addr()]) {
            Ok(beacon) => {
                tokio::spawn(beacon.run(found_tx.clone(), shutdown.clone()));
            }
            Err(e) => warn!(error = %e, "beacon disabled"),
        }
    }
    drop(found_tx);

    let mode = match cli.command {
        Command::Broadcast => Mode::Broadcast,
        Command::Ping => Mode::Ping,
    };
    console::run(mode, service.clone(), ping, shutdown.clone()).await;

    shutdown.cancel();
    let _ = bridge.await;
    service.shutdown().await;
    eprintln!("bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_peers() {
        let a = format!("{}@127.0.0.1:4001", "aa".repeat(32));
        let b = format!("{}@10.0.0.2:4002", "bb".repeat(32));
        let cli = Cli::try_parse_from(["fanout", "--peer", a.as_str(), "-p", b.as_str(), "--deferred", "broadcast"])
            .unwrap();
        assert_eq!(cli.peers.len(), 2);
        assert_eq!(cli.peers[1].addr.port(), 4002);
        assert!(cli.deferred);
        assert_eq!(cli.protocol, DEFAULT_PROTOCOL);
        assert!(matches!(cli.command, Command::Broadcast));
    }

    #[test]
    fn rejects_peer_without_id() {
        assert!(Cli::try_parse_from(["fanout", "--peer", "127.0.0.1:4001", "ping"]).is_err());
    }
}
