use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomlink::config::{AppConfig, ConfigStore};
use roomlink::events::{EventBus, RoomEvent};
use roomlink::media::{MediaPipeline, NativeCodecFactory};
use roomlink::signaling::SignalingClient;
use roomlink::transport::{MuxConnector, PeerFactory, PlatformCapabilities, QuicConnector, RtcPeerFactory};
use roomlink::{ConnectionManager, Transports};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// roomlink command line arguments
#[derive(Parser, Debug)]
#[command(name = "roomlink")]
#[command(version, about = "Real-time audio/video room client", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "roomlink.toml")]
    config: PathBuf,

    /// Signaling relay URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    signaling_url: Option<String>,

    /// Room to join (overrides config; a new room is created if neither is set)
    #[arg(short = 'r', long, value_name = "ROOM")]
    room: Option<String>,

    /// Display name announced to other participants (overrides config)
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Write the signaling URL and display name overrides back to the config file
    #[arg(long)]
    save: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting roomlink v{}", env!("CARGO_PKG_VERSION"));

    let store = ConfigStore::open(&args.config).await?;
    let apply_overrides = |config: &mut AppConfig| {
        if let Some(url) = &args.signaling_url {
            config.signaling.url = url.clone();
        }
        if let Some(name) = &args.name {
            config.room.display_name = name.clone();
        }
    };
    let config = if args.save {
        store.update(apply_overrides).await?;
        tracing::info!("Saved overrides to {}", args.config.display());
        (*store.get()).clone()
    } else {
        let mut config = (*store.get()).clone();
        apply_overrides(&mut config);
        config.validate()?;
        config
    };

    let events = EventBus::new();
    let pipeline = Arc::new(MediaPipeline::new(
        config.video.clone(),
        config.audio.clone(),
        Arc::new(NativeCodecFactory),
        events.clone(),
    ));

    let connector: Option<Arc<dyn MuxConnector>> = match QuicConnector::new(&config.fast_path) {
        Ok(connector) => Some(Arc::new(connector)),
        Err(e) => {
            tracing::warn!("Fast path unavailable: {}", e);
            None
        }
    };
    let peers: Option<Arc<dyn PeerFactory>> = Some(Arc::new(RtcPeerFactory::new(
        config.ice.clone(),
        &config.video,
        &config.audio,
    )));

    let capabilities = PlatformCapabilities::detect(&config.capabilities);
    tracing::info!("Platform capabilities: {:?}", capabilities);

    let (signaling, signaling_rx) = SignalingClient::spawn(&config.signaling);
    let signaling = Arc::new(signaling);
    tracing::info!("Signaling relay: {}", signaling.url());

    let room = args.room.or_else(|| config.room.default_room.clone());
    let manager = ConnectionManager::new(
        config,
        capabilities,
        signaling.clone(),
        Transports { connector, peers },
        pipeline,
        events.clone(),
    )?;

    let event_logger = tokio::spawn(log_events(events.subscribe()));
    let runner = tokio::spawn(manager.clone().run(signaling_rx));

    let room_id = manager.join_room(room)?;
    tracing::info!("Room {} (share this id to invite others)", room_id);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        result = runner => {
            match result {
                Ok(Ok(())) => tracing::info!("Connection manager stopped"),
                Ok(Err(e)) => tracing::error!("Connection manager failed: {}", e),
                Err(e) => tracing::error!("Connection manager task panicked: {}", e),
            }
        }
    }

    manager.shutdown().await;
    signaling.shutdown().await;
    event_logger.abort();

    tracing::info!("roomlink stopped");
    Ok(())
}

/// Log room events for headless runs
async fn log_events(mut rx: broadcast::Receiver<RoomEvent>) {
    loop {
        match rx.recv().await {
            Ok(RoomEvent::SessionFailed { participant, error }) => {
                tracing::warn!("[{}] session failed: {}", participant, error);
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("event: {}", json),
                Err(_) => tracing::info!("event: {}", event.event_name()),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event logger lagged, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "roomlink=error,webrtc=error",
        LogLevel::Warn => "roomlink=warn,webrtc=warn",
        LogLevel::Info => "roomlink=info,webrtc=warn",
        LogLevel::Verbose => "roomlink=debug,webrtc=warn",
        LogLevel::Debug => "roomlink=debug,webrtc=info,quinn=info",
        LogLevel::Trace => "roomlink=trace,webrtc=debug,quinn=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
