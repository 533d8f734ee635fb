mod capture;
mod playback;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use meshcast_core::{init_logging, Config, GeoLocation, PeerId};
use meshcast_mesh::{
    ConnectionFactory, MemoryNetwork, MeshSession, MockSignaling, MockSignalingConfig, PeerInfo,
    SessionEvent, SignalingGateway, WebRtcConnectionFactory, WebSocketSignaling,
    WebSocketSignalingConfig,
};

use playback::WriterSink;

/// Slices read per capture tick, in chunks
const CHUNKS_PER_SLICE: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "meshcast")]
#[command(about = "Peer-to-peer live streaming node", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "MESHCAST_CONFIG")]
    config: Option<String>,

    /// Peer id (generated when not provided)
    #[arg(long, env = "MESHCAST_PEER_ID")]
    peer_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a capture stream as the source of the room
    Broadcast {
        /// Capture input, `-` for stdin
        #[arg(long, default_value = "-")]
        input: String,
    },
    /// Join the room and play the stream
    View {
        /// Playback output, `-` for stdout
        #[arg(long, default_value = "-")]
        output: String,

        #[arg(long, requires = "lon", allow_negative_numbers = true)]
        lat: Option<f64>,

        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lon: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = Config::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    init_logging(&config.logging)?;
    info!("Meshcast node starting...");

    let peer_id = args.peer_id.map_or_else(PeerId::generate, PeerId::from);
    info!(peer_id = %peer_id, room_id = %config.signaling.room_id, "Node identity");

    match args.command {
        Command::Broadcast { input } => broadcast(config, peer_id, &input).await,
        Command::View { output, lat, lon } => {
            let location = lat.zip(lon).map(|(lat, lon)| GeoLocation::new(lat, lon));
            view(config, peer_id, &output, location).await
        }
    }
}

async fn broadcast(config: Config, peer_id: PeerId, input: &str) -> Result<()> {
    let info = PeerInfo {
        is_source: true,
        ..PeerInfo::default()
    };
    let session = build_session(config.clone(), peer_id, info);
    let _events = spawn_event_logger(&session);
    session.start()?;

    let capture = capture::open(
        input,
        config.stream.chunk_size.saturating_mul(CHUNKS_PER_SLICE),
        Duration::from_millis(config.stream.capture_interval_ms),
    )
    .await?;
    session.start_streaming(capture)?;

    shutdown_signal().await;
    session.stop().await;
    Ok(())
}

async fn view(
    config: Config,
    peer_id: PeerId,
    output: &str,
    location: Option<GeoLocation>,
) -> Result<()> {
    let info = PeerInfo {
        location: location.clone(),
        ..PeerInfo::default()
    };
    let session = build_session(config, peer_id, info);
    let _events = spawn_event_logger(&session);
    session.start()?;

    let sink = Arc::new(WriterSink::open(output).await?);
    let upstreams = session.start_viewing(location, sink).await?;
    if upstreams.is_empty() {
        warn!("No upstream yet, waiting for the room to fill");
    }

    shutdown_signal().await;
    let snapshot = session.network_snapshot();
    info!(
        peers = snapshot.nodes.len(),
        edges = snapshot.edges.len(),
        "Final topology"
    );
    session.stop().await;
    Ok(())
}

/// Mock signaling over the memory transport in test mode, WebSocket and WebRTC otherwise
fn build_session(config: Config, peer_id: PeerId, info: PeerInfo) -> Arc<MeshSession> {
    let signaling: Arc<dyn SignalingGateway>;
    let factory: Arc<dyn ConnectionFactory>;
    if config.signaling.test_mode {
        info!("Test mode: mock signaling and in-memory transport");
        signaling = MockSignaling::new(MockSignalingConfig::default());
        factory = MemoryNetwork::new().factory();
    } else {
        info!(server_url = %config.signaling.server_url, "Connecting to signaling server");
        signaling = WebSocketSignaling::connect(
            WebSocketSignalingConfig::from_config(&config.signaling, peer_id.clone()),
            info,
        );
        factory = Arc::new(WebRtcConnectionFactory::new(
            config.signaling.ice_servers.clone(),
        ));
    }
    MeshSession::new(config, Some(peer_id), signaling, factory)
}

fn spawn_event_logger(session: &MeshSession) -> tokio::task::JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Error(e)) => error!(error = %e, "Session error"),
                Ok(SessionEvent::NetworkStats(_)) => {}
                Ok(event) => info!(event = ?event, "Session event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Session events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
