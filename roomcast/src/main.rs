mod config;
mod http;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use roomcast_sfu::{LogRecordingObserver, SfuManager, WebRtcTransport};
use std::sync::Arc;
use tracing::info;

use server::RoomcastServer;

/// Roomcast - WebRTC conferencing SFU with room recording
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "ROOMCAST_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = config::load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Roomcast server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Media transport
    let transport = WebRtcTransport::new(&config.webrtc)?;
    info!(
        stun_servers = config.webrtc.stun_servers.len(),
        "WebRTC transport initialized"
    );

    // 4. SFU manager
    let sfu = SfuManager::new(
        config.sfu.clone(),
        Arc::new(transport),
        Arc::new(LogRecordingObserver),
    );
    if config.sfu.recording.enabled {
        info!(
            recordings_dir = %config.sfu.recording.recordings_dir.display(),
            output_dir = %config.sfu.recording.output_dir.display(),
            "Room recording enabled"
        );
    }

    // 5. Serve until shutdown
    RoomcastServer::new(config, sfu).start().await
}
