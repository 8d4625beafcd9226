use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use jamrtc_core::config::{EngineConfig, IceServer, parse_endpoint};
use jamrtc_core::telemetry::{self, LayerLevel, LogConfig, Verbosity};
use jamrtc_core::{Engine, EngineEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "jamrtc",
    about = "Jam with other musicians over a Janus VideoRoom",
    author,
    version
)]
struct Cli {
    #[arg(long = "ws", short = 'w', env = "JAMRTC_WS", help = "Janus WebSocket endpoint")]
    ws: String,

    #[arg(long, short = 'r', help = "VideoRoom room id")]
    room: u64,

    #[arg(long, short = 'd', help = "Display name shown to other participants")]
    display: String,

    #[arg(long = "no-mic", short = 'M', help = "Do not publish the microphone")]
    no_mic: bool,

    #[arg(long = "no-webcam", short = 'W', help = "Do not publish the webcam")]
    no_webcam: bool,

    #[arg(
        long = "video-device",
        short = 'v',
        default_value = "/dev/video0",
        help = "Capture device for the webcam"
    )]
    video_device: String,

    #[arg(
        long,
        short = 'i',
        default_value = "unknown",
        help = "Name of the instrument being played"
    )]
    instrument: String,

    #[arg(long, short = 's', help = "Publish the instrument in stereo")]
    stereo: bool,

    #[arg(long = "no-instrument", short = 'I', help = "Do not publish an instrument")]
    no_instrument: bool,

    #[arg(
        long = "jitter-buffer",
        short = 'b',
        value_name = "MS",
        default_value_t = 0,
        help = "Playout jitter buffer in milliseconds"
    )]
    jitter_buffer: u32,

    #[arg(long = "stun-server", short = 'S', value_name = "HOST:PORT")]
    stun_server: Option<String>,

    #[arg(long = "turn-server", short = 'T', value_name = "USER:PWD@HOST:PORT")]
    turn_server: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "debug-level",
        short = 'l',
        value_name = "0-7",
        env = "JAMRTC_DEBUG_LEVEL",
        default_value_t = 4,
        value_parser = clap::value_parser!(u8).range(0..=7),
        help = "Logging level (0 disables logging, 7 also traces WebRTC and WebSocket internals)"
    )]
    level: u8,

    #[arg(
        long = "log-layer",
        value_name = "LAYER=LEVEL",
        help = "Per-layer level override, e.g. transport=trace or engine=6; repeatable"
    )]
    layers: Vec<LayerLevel>,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "JAMRTC_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            verbosity: Verbosity::new(self.level),
            layers: self.layers.clone(),
            file: self.file.clone(),
        }
    }
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::new(parse_endpoint(&self.ws)?);
        if let Some(stun) = &self.stun_server {
            config.ice_servers.push(IceServer::stun(stun)?);
        }
        if let Some(turn) = &self.turn_server {
            config.ice_servers.push(IceServer::turn(turn)?);
        }
        config.jitter_buffer_ms = self.jitter_buffer;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    telemetry::init(&log_config).context("initializing logging")?;
    debug!(
        verbosity = log_config.verbosity.get(),
        filter = %telemetry::directives(&log_config),
        log_file = ?log_config.file,
        "logging configured"
    );

    let config = cli.engine_config()?;
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let engine = jamrtc_core::init(config, events_tx).context("starting session engine")?;
    info!(local_uuid = engine.local_uuid(), "engine started");

    let mut interrupted = false;
    loop {
        tokio::select! {
            Some(event) = events.recv() => on_event(&cli, &engine, event),
            _ = engine.stopped() => break,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed to listen for ctrl-c");
                    engine.shutdown();
                    continue;
                }
                if interrupted {
                    eprintln!("forced exit");
                    std::process::exit(130);
                }
                interrupted = true;
                eprintln!("shutting down; press ctrl-c again to force");
                engine.shutdown();
            }
        }
    }
    info!("bye");
    Ok(())
}

/// Auto-join, auto-publish and auto-subscribe.
fn on_event(cli: &Cli, engine: &Engine, event: EngineEvent) {
    match event {
        EngineEvent::ServerConnected => {
            info!(room = cli.room, "connected; joining room");
            report(engine.join_room(cli.room, cli.display.clone()));
        }
        EngineEvent::ServerDisconnected => {
            error!("lost the signaling server");
            engine.shutdown();
        }
        EngineEvent::JoinedRoom => {
            if !(cli.no_mic && cli.no_webcam) {
                report(engine.publish_av(!cli.no_mic, !cli.no_webcam, cli.video_device.clone()));
            }
            if !cli.no_instrument {
                report(engine.publish_instrument(cli.instrument.clone(), cli.stereo));
            }
        }
        EngineEvent::ParticipantJoined { uuid, display: name } => {
            info!(uuid = %uuid, display = %name, "participant joined");
        }
        EngineEvent::StreamStarted {
            uuid,
            display: name,
            instrument,
            has_audio,
            has_video,
        } => {
            info!(
                uuid = %uuid,
                display = %name,
                instrument = ?instrument,
                has_audio,
                has_video,
                "stream started; subscribing"
            );
            if let Err(err) = engine.subscribe(&uuid, instrument.is_some()) {
                warn!(uuid = %uuid, error = %err, "subscribe refused");
            }
        }
        EngineEvent::StreamStopped {
            uuid,
            display: name,
            instrument,
        } => info!(uuid = %uuid, display = %name, instrument = ?instrument, "stream stopped"),
        EngineEvent::ParticipantLeft { uuid, display: name } => {
            info!(uuid = %uuid, display = %name, "participant left");
        }
    }
}

fn report(result: Result<(), jamrtc_core::EngineError>) {
    if let Err(err) = result {
        warn!(error = %err, "engine request rejected");
    }
}
