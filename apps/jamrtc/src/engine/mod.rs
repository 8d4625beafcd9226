//! Session engine: session and handle lifecycle, SDP/ICE orchestration.
//!
//! [`init`] spawns a single scheduler task that owns all engine state. The
//! returned [`Engine`] is a cheap handle that posts commands into it; the only
//! state read outside the scheduler is the [`Directory`], so `subscribe` can
//! answer synchronously.

mod sdp;
mod session;

pub use sdp::{fix_zero_audio_port, inlined_candidates};

use std::sync::Arc;

use janus_proto::Jsep;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, JITTER_BUFFER_WARN_MS};
use crate::directory::{Directory, HandleKey};
use crate::error::{EngineError, SubscribeError};
use crate::event::EngineEvent;
use crate::media::{MediaBackend, MediaEngine, MediaError, WebRtcEngine};
use crate::render::{RenderQueue, RenderRequest};
use session::SessionEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    CreatingSession,
    SessionCreated,
}

pub(crate) enum Command {
    JoinRoom { room: u64, display: String },
    PublishAv { mic: bool, webcam: bool, device: String },
    PublishInstrument { name: String, stereo: bool },
    Subscribe(HandleKey),
    DescriptionReady {
        key: HandleKey,
        result: Result<Jsep, MediaError>,
    },
    KeepAlive,
    Shutdown,
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    directory: Arc<Mutex<Directory>>,
    state: watch::Receiver<SessionState>,
    stopped: watch::Receiver<bool>,
    local_uuid: Arc<str>,
}

/// Start an engine without a render queue.
pub fn init(
    config: EngineConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<Engine, EngineError> {
    init_with_render(config, events, None)
}

/// Start an engine. Must be called from within a tokio runtime.
///
/// Connection failures are not returned here: they surface as
/// [`EngineEvent::ServerDisconnected`] followed by the stop signal.
pub fn init_with_render(
    config: EngineConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
    render: Option<mpsc::UnboundedSender<RenderRequest>>,
) -> Result<Engine, EngineError> {
    config.validate()?;
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|_| EngineError::InvalidConfig("init must run inside a tokio runtime".into()))?;
    if config.jitter_buffer_ms > JITTER_BUFFER_WARN_MS {
        warn!(
            target = "jamrtc::engine",
            jitter_buffer_ms = config.jitter_buffer_ms,
            "jitter buffer above {JITTER_BUFFER_WARN_MS}ms; expect noticeable latency"
        );
    }

    let media: Arc<dyn MediaEngine> = match &config.media {
        MediaBackend::WebRtc => Arc::new(WebRtcEngine::new(config.jitter_buffer_ms)?),
        MediaBackend::Custom(engine) => Arc::clone(engine),
    };
    let local_uuid = config
        .local_uuid
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let directory = Arc::new(Mutex::new(Directory::new(local_uuid.clone())));

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (leg_tx, leg_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
    let (stopped_tx, stopped_rx) = watch::channel(false);

    debug!(
        target = "jamrtc::engine",
        endpoint = %config.endpoint,
        local_uuid = %local_uuid,
        media = ?config.media,
        "starting session engine"
    );
    let engine = SessionEngine::new(
        config,
        media,
        Arc::clone(&directory),
        events,
        RenderQueue::new(render),
        commands_tx.clone(),
        leg_tx,
        state_tx,
        stopped_tx,
    );
    runtime.spawn(engine.run(commands_rx, leg_rx));

    Ok(Engine {
        commands: commands_tx,
        directory,
        state: state_rx,
        stopped: stopped_rx,
        local_uuid: local_uuid.into(),
    })
}

impl Engine {
    fn post(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Stopped)
    }

    pub fn join_room(&self, room: u64, display: impl Into<String>) -> Result<(), EngineError> {
        self.post(Command::JoinRoom {
            room,
            display: display.into(),
        })
    }

    pub fn publish_av(&self, mic: bool, webcam: bool, device: impl Into<String>) -> Result<(), EngineError> {
        self.post(Command::PublishAv {
            mic,
            webcam,
            device: device.into(),
        })
    }

    pub fn publish_instrument(&self, name: impl Into<String>, stereo: bool) -> Result<(), EngineError> {
        self.post(Command::PublishInstrument {
            name: name.into(),
            stereo,
        })
    }

    /// Subscribe to one of a participant's legs.
    pub fn subscribe(&self, uuid: &str, want_instrument: bool) -> Result<(), SubscribeError> {
        let key = self.directory.lock().prepare_subscribe(uuid, want_instrument)?;
        if self.commands.send(Command::Subscribe(key)).is_err() {
            debug!(target = "jamrtc::engine", uuid, "subscribe after engine stopped");
        }
        Ok(())
    }

    /// Request teardown. Idempotent; does not emit `ServerDisconnected`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Resolves once the engine has torn everything down.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn local_uuid(&self) -> &str {
        &self.local_uuid
    }
}
