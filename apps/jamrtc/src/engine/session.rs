use std::sync::Arc;
use std::time::Duration;

use janus_proto::{
    EventKind, Inbound, Jsep, ParticipantInfo, PluginBody, Request, SdpType, TrickleCandidate,
    VideoRoomEvent,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::sdp::{fix_zero_audio_port, inlined_candidates};
use super::{Command, SessionState};
use crate::config::{EngineConfig, IceServer};
use crate::correlator::Correlator;
use crate::directory::{Directory, Handle, HandleKey, HandleKind, HandleState, Recycled, StreamKind};
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::media::{LegEvent, LegEvents, LegSpec, MediaEngine, MediaError, MediaLeg};
use crate::render::{RenderQueue, RenderRequest};
use crate::transport::{Dialer, Transport, TransportConfig, TransportError, TransportEvent};

struct Session {
    id: u64,
    created_at: Instant,
}

struct Room {
    id: u64,
    display: String,
    private_id: Option<u64>,
    joined: bool,
}

struct AvRequest {
    mic: bool,
    webcam: bool,
    device: String,
}

struct InstrumentRequest {
    name: String,
    stereo: bool,
}

/// Engine-owned state. Lives on one task; only the directory is shared.
pub(super) struct SessionEngine {
    endpoint: Url,
    plugin: String,
    keepalive_interval: Duration,
    transport_config: TransportConfig,
    dialer: Arc<dyn Dialer>,
    ice_servers: Vec<IceServer>,
    jitter_buffer_ms: u32,
    media: Arc<dyn MediaEngine>,
    directory: Arc<Mutex<Directory>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    render: RenderQueue,
    commands: mpsc::UnboundedSender<Command>,
    leg_tx: mpsc::UnboundedSender<(HandleKey, LegEvent)>,
    state: watch::Sender<SessionState>,
    stopped: watch::Sender<bool>,

    correlator: Correlator,
    transport: Option<Transport>,
    session: Option<Session>,
    create_transaction: Option<String>,
    keepalive: Option<JoinHandle<()>>,
    deferred: Vec<HandleKey>,
    room: Option<Room>,
    mic: Option<HandleKey>,
    instrument: Option<HandleKey>,
    pending_av: Option<AvRequest>,
    instrument_request: Option<InstrumentRequest>,
    torn_down: bool,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: EngineConfig,
        media: Arc<dyn MediaEngine>,
        directory: Arc<Mutex<Directory>>,
        events: mpsc::UnboundedSender<EngineEvent>,
        render: RenderQueue,
        commands: mpsc::UnboundedSender<Command>,
        leg_tx: mpsc::UnboundedSender<(HandleKey, LegEvent)>,
        state: watch::Sender<SessionState>,
        stopped: watch::Sender<bool>,
    ) -> Self {
        Self {
            dialer: config.signaling.dialer(),
            endpoint: config.endpoint,
            plugin: config.plugin,
            keepalive_interval: config.keepalive_interval,
            transport_config: config.transport,
            ice_servers: config.ice_servers,
            jitter_buffer_ms: config.jitter_buffer_ms,
            media,
            directory,
            events,
            render,
            commands,
            leg_tx,
            state,
            stopped,
            correlator: Correlator::new(),
            transport: None,
            session: None,
            create_transaction: None,
            keepalive: None,
            deferred: Vec::new(),
            room: None,
            mic: None,
            instrument: None,
            pending_av: None,
            instrument_request: None,
            torn_down: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut leg_events: mpsc::UnboundedReceiver<(HandleKey, LegEvent)>,
    ) {
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        self.connect(transport_tx).await;

        while !self.torn_down {
            tokio::select! {
                Some(command) = commands.recv() => self.on_command(command).await,
                Some(event) = transport_rx.recv() => self.on_transport(event).await,
                Some((key, event)) = leg_events.recv() => self.on_leg_event(key, event).await,
                else => break,
            }
        }
        if !self.torn_down {
            self.teardown(false).await;
            self.finish();
        }
        debug!(target = "jamrtc::engine", "session engine stopped");
    }

    // ----- plumbing -------------------------------------------------------

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(target = "jamrtc::engine", from = ?previous, to = ?state, "session state");
        }
    }

    fn emit(&self, event: EngineEvent) {
        debug!(target = "jamrtc::engine", event = ?event, "notify");
        let _ = self.events.send(event);
    }

    fn set_handle_state(&self, key: HandleKey, state: HandleState) {
        self.directory.lock().set_state(key, state);
    }

    fn send(&self, request: &Request, transaction: &str) -> bool {
        let document = match janus_proto::encode(request, transaction) {
            Ok(document) => document,
            Err(err) => {
                warn!(target = "jamrtc::engine", verb = request.verb(), error = %err, "failed to encode request");
                return false;
            }
        };
        let Some(transport) = &self.transport else {
            debug!(target = "jamrtc::engine", verb = request.verb(), "no transport; request dropped");
            return false;
        };
        match transport.enqueue(document) {
            Ok(()) => {
                trace!(target = "jamrtc::engine", verb = request.verb(), transaction, "request queued");
                true
            }
            Err(err) => {
                debug!(target = "jamrtc::engine", verb = request.verb(), error = %err, "request not queued");
                false
            }
        }
    }

    /// Send a request whose response must come back to `key`.
    fn send_for(&mut self, key: HandleKey, request: &Request) -> bool {
        let token = self.correlator.register(key);
        if self.send(request, &token) {
            return true;
        }
        self.correlator.take(&token);
        false
    }

    fn send_uncorrelated(&self, request: &Request) -> bool {
        let token = self.correlator.token();
        self.send(request, &token)
    }

    fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.id)
    }

    fn send_message(&mut self, key: HandleKey, body: PluginBody, jsep: Option<Jsep>) -> bool {
        let handle_id = self.directory.lock().handle(key).and_then(Handle::handle_id);
        let (Some(session_id), Some(handle_id)) = (self.session_id(), handle_id) else {
            warn!(target = "jamrtc::engine", handle = %key, "message for unattached handle dropped");
            return false;
        };
        let request = Request::Message {
            session_id,
            handle_id,
            body,
            jsep,
        };
        self.send_for(key, &request)
    }

    fn leg_spec(&self, kind: HandleKind, audio: bool, video: bool) -> LegSpec {
        LegSpec {
            kind,
            audio,
            video,
            stereo: false,
            device: None,
            ice_servers: self.ice_servers.clone(),
            jitter_buffer_ms: self.jitter_buffer_ms,
        }
    }

    /// Build a leg and install it on `key`. A handle destroyed meanwhile gets
    /// its fresh leg closed instead.
    async fn build_leg(&mut self, key: HandleKey, spec: LegSpec) -> Option<Arc<dyn MediaLeg>> {
        let kind = spec.kind;
        let events = LegEvents::new(key, self.leg_tx.clone());
        let leg = match self.media.create_leg(spec, events).await {
            Ok(leg) => leg,
            Err(err) => {
                warn!(target = "jamrtc::engine", handle = %key, kind = ?kind, error = %err, "failed to build media leg");
                self.handle_failed(key);
                return None;
            }
        };
        let installed = match self.directory.lock().handle_mut(key) {
            Some(handle) => {
                handle.leg = Some(Arc::clone(&leg));
                true
            }
            None => false,
        };
        if !installed {
            debug!(target = "jamrtc::engine", handle = %key, "handle gone before its leg was ready");
            leg.close();
            return None;
        }
        Some(leg)
    }

    // ----- connection and session ----------------------------------------

    async fn connect(&mut self, transport_tx: mpsc::UnboundedSender<TransportEvent>) {
        self.set_state(SessionState::Connecting);
        let dialed = self
            .dialer
            .dial(&self.endpoint, self.transport_config, transport_tx)
            .await;
        match dialed {
            Ok(transport) => {
                info!(target = "jamrtc::engine", endpoint = %self.endpoint, "connected to signaling server");
                self.transport = Some(transport);
                self.set_state(SessionState::Connected);
                let token = self.correlator.token();
                self.create_transaction = Some(token.clone());
                self.set_state(SessionState::CreatingSession);
                self.send(&Request::Create, &token);
            }
            Err(err) => self.fail(err.into()).await,
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(document) => self.on_inbound(&document).await,
            TransportEvent::Disconnected(reason) => {
                let err = reason.unwrap_or(TransportError::Closed);
                self.fail(err.into()).await;
            }
        }
    }

    async fn on_inbound(&mut self, document: &str) {
        let inbound = match janus_proto::decode(document) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(target = "jamrtc::engine", error = %err, "ignoring undecodable message");
                return;
            }
        };
        trace!(
            target = "jamrtc::engine",
            kind = ?inbound.janus,
            transaction = ?inbound.transaction,
            sender = ?inbound.sender,
            "inbound"
        );

        if self.session.is_none() {
            self.on_create_response(inbound).await;
            return;
        }

        let resolution = {
            let directory = self.directory.lock();
            self.correlator.resolve(
                inbound.transaction.as_deref(),
                inbound.sender,
                |handle_id| directory.handle_by_id(handle_id),
            )
        };
        let Some(key) = resolution.key() else {
            self.on_unmatched(inbound).await;
            return;
        };
        trace!(target = "jamrtc::engine", handle = %key, resolution = ?resolution, "matched");
        self.on_handle_message(key, inbound).await;
    }

    async fn on_create_response(&mut self, inbound: Inbound) {
        let expected = self.create_transaction.as_deref();
        if expected.is_none() || inbound.transaction.as_deref() != expected {
            debug!(target = "jamrtc::engine", kind = ?inbound.janus, "message before session exists ignored");
            return;
        }
        self.create_transaction = None;
        if inbound.janus == EventKind::Error {
            let (code, reason) = inbound
                .error
                .map(|err| (err.code, err.reason))
                .unwrap_or_default();
            self.fail(EngineError::Application { code, reason }).await;
            return;
        }
        let id = match inbound.created_id() {
            Ok(id) => id,
            Err(err) => {
                self.fail(err.into()).await;
                return;
            }
        };
        self.session = Some(Session {
            id,
            created_at: Instant::now(),
        });
        self.set_state(SessionState::SessionCreated);
        info!(target = "jamrtc::engine", session_id = id, "session created");
        self.arm_keepalive();
        self.emit(EngineEvent::ServerConnected);
        for key in std::mem::take(&mut self.deferred) {
            self.attach(key);
        }
    }

    fn arm_keepalive(&mut self) {
        let commands = self.commands.clone();
        let interval = self.keepalive_interval;
        self.keepalive = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if commands.send(Command::KeepAlive).is_err() {
                    break;
                }
            }
        }));
    }

    fn keepalive(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        trace!(target = "jamrtc::engine", session_id, "keepalive");
        self.send_uncorrelated(&Request::KeepAlive { session_id });
    }

    async fn on_unmatched(&mut self, inbound: Inbound) {
        match inbound.janus {
            EventKind::Ack => trace!(target = "jamrtc::engine", "unmatched ack"),
            EventKind::Timeout => {
                self.fail(EngineError::SessionExpired).await;
            }
            EventKind::Error => {
                let error = inbound.error.unwrap_or_default();
                warn!(
                    target = "jamrtc::engine",
                    code = error.code,
                    reason = %error.reason,
                    "server error not tied to a handle"
                );
            }
            kind => debug!(
                target = "jamrtc::engine",
                kind = ?kind,
                transaction = ?inbound.transaction,
                sender = ?inbound.sender,
                "dropping unmatched message"
            ),
        }
    }

    // ----- commands ---------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::JoinRoom { room, display } => self.join_room(room, display),
            Command::PublishAv { mic, webcam, device } => {
                self.publish_av(AvRequest { mic, webcam, device }).await
            }
            Command::PublishInstrument { name, stereo } => {
                self.publish_instrument(InstrumentRequest { name, stereo })
            }
            Command::Subscribe(key) => self.attach(key),
            Command::DescriptionReady { key, result } => self.on_description_ready(key, result).await,
            Command::KeepAlive => self.keepalive(),
            Command::Shutdown => self.shutdown().await,
        }
    }

    fn join_room(&mut self, room: u64, display_name: String) {
        if self.mic.is_some() {
            warn!(target = "jamrtc::engine", room, "join_room called twice; ignoring");
            return;
        }
        info!(target = "jamrtc::engine", room, display = %display_name, "joining room");
        self.room = Some(Room {
            id: room,
            display: display_name,
            private_id: None,
            joined: false,
        });
        let key = self.directory.lock().insert_local(HandleKind::LocalMicWebcam);
        self.mic = Some(key);
        self.attach(key);
    }

    async fn publish_av(&mut self, request: AvRequest) {
        let Some(key) = self.mic else {
            warn!(target = "jamrtc::engine", "publish_av before join_room; ignoring");
            return;
        };
        if !self.room.as_ref().is_some_and(|room| room.joined) {
            debug!(target = "jamrtc::engine", "publish_av deferred until the room is joined");
            self.pending_av = Some(request);
            return;
        }
        if !request.mic && !request.webcam {
            info!(target = "jamrtc::engine", "mic and webcam both disabled; nothing to publish");
            return;
        }
        let already = self
            .directory
            .lock()
            .handle(key)
            .is_some_and(|handle| handle.leg.is_some());
        if already {
            warn!(target = "jamrtc::engine", "mic/webcam already published");
            return;
        }

        let mut spec = self.leg_spec(HandleKind::LocalMicWebcam, request.mic, request.webcam);
        spec.device = Some(request.device);
        if self.build_leg(key, spec).await.is_none() {
            return;
        }
        if let Some(handle) = self.directory.lock().handle_mut(key) {
            handle.audio = request.mic;
            handle.video = request.webcam;
        }
        self.set_handle_state(key, HandleState::NegotiationPending);
        self.render.post(RenderRequest::Preview {
            video: request.webcam,
            instrument: None,
        });
    }

    fn publish_instrument(&mut self, request: InstrumentRequest) {
        if self.instrument.is_some() {
            warn!(target = "jamrtc::engine", "instrument already published");
            return;
        }
        if self.room.is_none() {
            warn!(target = "jamrtc::engine", "publish_instrument before join_room; ignoring");
            return;
        }
        info!(target = "jamrtc::engine", instrument = %request.name, stereo = request.stereo, "publishing instrument");
        let key = self.directory.lock().insert_local(HandleKind::LocalInstrument);
        self.instrument = Some(key);
        self.instrument_request = Some(request);
        self.attach(key);
    }

    /// Attach `key` to the plugin, or defer until the session exists.
    fn attach(&mut self, key: HandleKey) {
        if self.directory.lock().handle(key).is_none() {
            debug!(target = "jamrtc::engine", handle = %key, "not attaching a handle that is already gone");
            return;
        }
        self.set_handle_state(key, HandleState::AttachRequested);
        let Some(session_id) = self.session_id() else {
            debug!(target = "jamrtc::engine", handle = %key, "attach deferred until session exists");
            self.deferred.push(key);
            return;
        };
        let request = Request::Attach {
            session_id,
            plugin: self.plugin.clone(),
        };
        self.send_for(key, &request);
    }

    // ----- per-handle inbound ---------------------------------------------

    async fn on_handle_message(&mut self, key: HandleKey, inbound: Inbound) {
        let snapshot = self
            .directory
            .lock()
            .handle(key)
            .map(|handle| (handle.kind, handle.state, handle.handle_id()));
        let Some((kind, state, handle_id)) = snapshot else {
            debug!(target = "jamrtc::engine", handle = %key, "message for destroyed handle");
            return;
        };

        if handle_id.is_none() {
            if state == HandleState::AttachRequested {
                self.on_attach_response(key, kind, inbound).await;
            } else {
                debug!(target = "jamrtc::engine", handle = %key, state = ?state, "message for unattached handle");
            }
            return;
        }

        match inbound.janus {
            EventKind::Ack => trace!(target = "jamrtc::engine", handle = %key, "ack"),
            EventKind::Error => {
                let error = inbound.error.unwrap_or_default();
                warn!(
                    target = "jamrtc::engine",
                    handle = %key,
                    code = error.code,
                    reason = %error.reason,
                    "request failed"
                );
                self.handle_failed(key);
            }
            EventKind::WebrtcUp => {
                info!(target = "jamrtc::engine", handle = %key, kind = ?kind, "media leg up");
                if matches!(state, HandleState::AnswerPrepared | HandleState::OfferSent) {
                    self.set_handle_state(key, HandleState::Established);
                }
            }
            EventKind::Media => debug!(
                target = "jamrtc::engine",
                handle = %key,
                media = ?inbound.media_kind,
                receiving = ?inbound.receiving,
                "media flow changed"
            ),
            EventKind::SlowLink => debug!(target = "jamrtc::engine", handle = %key, "slow link reported"),
            EventKind::Hangup => {
                info!(target = "jamrtc::engine", handle = %key, reason = ?inbound.reason, "media leg hung up");
                self.handle_closed(key, true);
            }
            EventKind::Detached => {
                debug!(target = "jamrtc::engine", handle = %key, "handle detached by server");
                self.handle_closed(key, false);
            }
            _ => self.on_event(key, kind, inbound).await,
        }
    }

    async fn on_attach_response(&mut self, key: HandleKey, kind: HandleKind, inbound: Inbound) {
        match inbound.janus {
            EventKind::Ack => return,
            EventKind::Error => {
                let error = inbound.error.unwrap_or_default();
                self.fail(EngineError::Application {
                    code: error.code,
                    reason: error.reason,
                })
                .await;
                return;
            }
            _ => {}
        }
        let handle_id = match inbound.created_id() {
            Ok(id) => id,
            Err(err) => {
                self.fail(err.into()).await;
                return;
            }
        };
        let assigned = self.directory.lock().assign_handle_id(key, handle_id);
        if let Err(err) = assigned {
            warn!(target = "jamrtc::engine", handle = %key, error = %err, "rejecting handle id");
            self.handle_failed(key);
            return;
        }
        self.set_handle_state(key, HandleState::Attached);
        debug!(target = "jamrtc::engine", handle = %key, handle_id, kind = ?kind, "attached");
        self.on_attached(key, kind).await;
    }

    async fn on_attached(&mut self, key: HandleKey, kind: HandleKind) {
        let Some((room, display)) = self.room.as_ref().map(|room| (room.id, room.display.clone())) else {
            warn!(target = "jamrtc::engine", handle = %key, "attached without a room");
            return;
        };
        let local_uuid = self.directory.lock().local_uuid().to_string();
        match kind {
            HandleKind::LocalMicWebcam => {
                let identity = ParticipantInfo {
                    uuid: Some(local_uuid),
                    display,
                    instrument: None,
                };
                self.send_message(key, PluginBody::publisher_join(room, identity.to_display_field()), None);
            }
            HandleKind::LocalInstrument => {
                let stereo = self
                    .instrument_request
                    .as_ref()
                    .is_some_and(|request| request.stereo);
                let mut spec = self.leg_spec(HandleKind::LocalInstrument, true, false);
                spec.stereo = stereo;
                if self.build_leg(key, spec).await.is_none() {
                    return;
                }
                if let Some(handle) = self.directory.lock().handle_mut(key) {
                    handle.audio = true;
                    handle.video = false;
                }
                self.set_handle_state(key, HandleState::NegotiationPending);
                self.render.post(RenderRequest::Preview {
                    video: false,
                    instrument: self.instrument_request.as_ref().map(|request| request.name.clone()),
                });
            }
            HandleKind::RemoteSubscribe => {
                let target = self
                    .directory
                    .lock()
                    .handle(key)
                    .map(|handle| (handle.user_id, handle.audio, handle.video));
                let Some((Some(feed), audio, video)) = target else {
                    warn!(target = "jamrtc::engine", handle = %key, "subscriber handle has no feed");
                    self.handle_failed(key);
                    return;
                };
                let spec = self.leg_spec(HandleKind::RemoteSubscribe, audio, video);
                if self.build_leg(key, spec).await.is_none() {
                    return;
                }
                let private_id = self.room.as_ref().and_then(|room| room.private_id);
                if self.send_message(key, PluginBody::subscriber_join(room, feed, private_id), None) {
                    self.set_handle_state(key, HandleState::SubscribeRequested);
                }
            }
        }
    }

    async fn on_event(&mut self, key: HandleKey, kind: HandleKind, inbound: Inbound) {
        if let Some(event) = inbound.plugin_event() {
            if let Some(error) = event.error() {
                self.fail(EngineError::Application {
                    code: error.code,
                    reason: error.reason,
                })
                .await;
                return;
            }
            if event.is_joined() {
                self.on_joined(key, kind, event).await;
            }
            self.apply_room_delta(event);
        }

        if let Some(jsep) = inbound.jsep() {
            match jsep {
                Ok(jsep) => self.on_remote_description(key, kind, jsep).await,
                Err(err) => {
                    warn!(target = "jamrtc::engine", handle = %key, error = %err, "unusable session description");
                    self.handle_failed(key);
                }
            }
        }

        if let Some(candidate) = inbound.candidate() {
            self.add_remote_candidate(key, candidate).await;
        }
    }

    async fn on_joined(&mut self, key: HandleKey, kind: HandleKind, event: &VideoRoomEvent) {
        if let Some(handle) = self.directory.lock().handle_mut(key) {
            handle.user_id = event.id;
        }
        match kind {
            HandleKind::LocalMicWebcam => {
                let Some(room) = self.room.as_mut() else {
                    return;
                };
                room.private_id = event.private_id;
                room.joined = true;
                let display = room.display.clone();
                info!(target = "jamrtc::engine", room = room.id, user_id = ?event.id, "joined room");
                self.emit(EngineEvent::JoinedRoom);
                self.render.post(RenderRequest::Local { display });
                if let Some(request) = self.pending_av.take() {
                    self.publish_av(request).await;
                }
            }
            HandleKind::LocalInstrument => {
                debug!(target = "jamrtc::engine", user_id = ?event.id, "instrument publisher joined");
            }
            HandleKind::RemoteSubscribe => {
                debug!(target = "jamrtc::engine", handle = %key, "unexpected joined on subscriber");
            }
        }
    }

    fn apply_room_delta(&mut self, event: &VideoRoomEvent) {
        let mut notifications = Vec::new();
        let mut released = Vec::new();
        let mut cleared_slots = Vec::new();
        let mut promoted = Vec::new();
        {
            let mut directory = self.directory.lock();
            let listed = event
                .publishers()
                .into_iter()
                .map(|record| (record, true))
                .chain(event.attendees().into_iter().map(|record| (record, false)))
                .chain(event.joining().into_iter().map(|record| (record, false)));
            for (record, publishing) in listed {
                match record {
                    Ok(record) => notifications.extend(directory.upsert(&record, publishing)),
                    Err(err) => debug!(target = "jamrtc::engine", error = %err, "skipping participant record"),
                }
            }
            for user_id in event.leaving().into_iter().chain(event.unpublished()) {
                let departure = directory.leave(user_id);
                notifications.extend(departure.events);
                released.extend(departure.released);
                cleared_slots.extend(departure.freed_slot);
                if let Some(uuid) = departure.promoted {
                    promoted.extend(promoted_tracks(&directory, &uuid));
                }
            }
        }
        for notification in notifications {
            self.emit(notification);
        }
        for (key, handle) in released {
            self.release(key, handle);
        }
        for slot in cleared_slots {
            self.render.post(RenderRequest::Clear { slot });
        }
        for request in promoted {
            self.render.post(request);
        }
    }

    /// Second half of handle destruction, after the directory let it go.
    fn release(&mut self, key: HandleKey, handle: Handle) {
        let handle_id = handle.handle_id();
        self.let_go(key, handle.leg, handle_id, true);
    }

    /// Handle-scoped failure. Local handles stay in `Error`; remote ones are
    /// recycled so the stream can be subscribed again.
    fn handle_failed(&mut self, key: HandleKey) {
        if !self.recycle(key, true) {
            self.set_handle_state(key, HandleState::Error);
        }
    }

    /// The server ended a leg. `detach` is false when the server already
    /// dropped the handle itself.
    fn handle_closed(&mut self, key: HandleKey, detach: bool) {
        if !self.recycle(key, detach) {
            self.set_handle_state(key, HandleState::Closed);
        }
    }

    fn recycle(&mut self, key: HandleKey, detach: bool) -> bool {
        let recycled = self.directory.lock().recycle(key);
        let Some(Recycled { leg, handle_id }) = recycled else {
            return false;
        };
        self.let_go(key, leg, handle_id, detach);
        true
    }

    fn let_go(&mut self, key: HandleKey, leg: Option<Arc<dyn MediaLeg>>, handle_id: Option<u64>, detach: bool) {
        if let Some(leg) = leg {
            leg.close();
        }
        let dropped = self.correlator.release(key);
        self.deferred.retain(|deferred| *deferred != key);
        if detach {
            if let (Some(session_id), Some(handle_id)) = (self.session_id(), handle_id) {
                self.send_uncorrelated(&Request::Detach {
                    session_id,
                    handle_id,
                });
            }
        }
        debug!(
            target = "jamrtc::engine",
            handle = %key,
            handle_id = ?handle_id,
            detach,
            dropped_transactions = dropped,
            "handle released"
        );
    }

    // ----- negotiation ------------------------------------------------------

    async fn on_remote_description(&mut self, key: HandleKey, kind: HandleKind, jsep: Jsep) {
        let leg = self.directory.lock().leg(key);
        let Some(leg) = leg else {
            warn!(target = "jamrtc::engine", handle = %key, "session description for handle without a media leg");
            self.handle_failed(key);
            return;
        };

        for candidate in inlined_candidates(&jsep.sdp) {
            trace!(target = "jamrtc::engine", handle = %key, candidate = %candidate.candidate, "replaying inlined candidate");
            if let Err(err) = leg.add_ice_candidate(candidate).await {
                debug!(target = "jamrtc::engine", handle = %key, error = %err, "inlined candidate rejected");
            }
        }

        let sdp_type = jsep.kind;
        if let Err(err) = leg.set_remote_description(jsep).await {
            warn!(target = "jamrtc::engine", handle = %key, error = %err, "failed to apply remote description");
            self.handle_failed(key);
            return;
        }

        match (kind, sdp_type) {
            (HandleKind::RemoteSubscribe, SdpType::Offer) => self.start_negotiation(key, leg, SdpType::Answer),
            (HandleKind::LocalMicWebcam | HandleKind::LocalInstrument, SdpType::Answer) => {
                info!(target = "jamrtc::engine", handle = %key, kind = ?kind, "publication accepted");
                self.set_handle_state(key, HandleState::Established);
            }
            (kind, sdp_type) => debug!(
                target = "jamrtc::engine",
                handle = %key,
                kind = ?kind,
                sdp_type = ?sdp_type,
                "unexpected session description"
            ),
        }
    }

    /// Produce an offer or answer off the scheduler; the result comes back as
    /// [`Command::DescriptionReady`].
    fn start_negotiation(&mut self, key: HandleKey, leg: Arc<dyn MediaLeg>, produce: SdpType) {
        if let Some(handle) = self.directory.lock().handle_mut(key) {
            handle.negotiating = true;
        }
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = match produce {
                SdpType::Offer => leg.create_offer().await,
                SdpType::Answer => leg.create_answer().await,
            };
            let _ = commands.send(Command::DescriptionReady { key, result });
        });
    }

    async fn on_description_ready(&mut self, key: HandleKey, result: Result<Jsep, MediaError>) {
        let snapshot = self.directory.lock().handle_mut(key).map(|handle| {
            handle.negotiating = false;
            (handle.kind, handle.audio, handle.video, handle.leg.clone())
        });
        let Some((kind, audio, video, Some(leg))) = snapshot else {
            debug!(target = "jamrtc::engine", handle = %key, "description ready for destroyed handle");
            return;
        };
        let local = match result {
            Ok(local) => local,
            Err(err) => {
                warn!(target = "jamrtc::engine", handle = %key, error = %err, "failed to create session description");
                self.handle_failed(key);
                return;
            }
        };
        let outbound = Jsep {
            kind: local.kind,
            sdp: fix_zero_audio_port(&local.sdp),
        };
        if let Err(err) = leg.set_local_description(local).await {
            warn!(target = "jamrtc::engine", handle = %key, error = %err, "failed to apply local description");
            self.handle_failed(key);
            return;
        }

        let Some((room, display)) = self.room.as_ref().map(|room| (room.id, room.display.clone())) else {
            return;
        };
        match kind {
            HandleKind::LocalMicWebcam => {
                if self.send_message(key, PluginBody::configure(audio, video), Some(outbound)) {
                    self.set_handle_state(key, HandleState::OfferSent);
                }
            }
            HandleKind::LocalInstrument => {
                let identity = ParticipantInfo {
                    uuid: Some(self.directory.lock().local_uuid().to_string()),
                    display,
                    instrument: self.instrument_request.as_ref().map(|request| request.name.clone()),
                };
                let body = PluginBody::publisher_join_and_configure(room, identity.to_display_field(), true, false);
                if self.send_message(key, body, Some(outbound)) {
                    self.set_handle_state(key, HandleState::OfferSent);
                }
            }
            HandleKind::RemoteSubscribe => {
                if self.send_message(key, PluginBody::start(room), Some(outbound)) {
                    self.set_handle_state(key, HandleState::AnswerPrepared);
                }
            }
        }
    }

    async fn add_remote_candidate(&mut self, key: HandleKey, candidate: TrickleCandidate) {
        let leg = self.directory.lock().leg(key);
        let Some(leg) = leg else {
            debug!(target = "jamrtc::engine", handle = %key, "candidate for handle without a media leg");
            return;
        };
        if let Err(err) = leg.add_ice_candidate(candidate).await {
            debug!(target = "jamrtc::engine", handle = %key, error = %err, "remote candidate rejected");
        }
    }

    async fn on_leg_event(&mut self, key: HandleKey, event: LegEvent) {
        match event {
            LegEvent::NegotiationNeeded => {
                let snapshot = self
                    .directory
                    .lock()
                    .handle(key)
                    .map(|handle| (handle.kind, handle.state, handle.negotiating, handle.leg.clone()));
                let Some((kind, state, negotiating, Some(leg))) = snapshot else {
                    return;
                };
                if !kind.is_local() || negotiating || state != HandleState::NegotiationPending {
                    trace!(target = "jamrtc::engine", handle = %key, state = ?state, "negotiation-needed ignored");
                    return;
                }
                debug!(target = "jamrtc::engine", handle = %key, kind = ?kind, "creating offer");
                self.start_negotiation(key, leg, SdpType::Offer);
            }
            LegEvent::LocalCandidate { mline_index, candidate } => {
                if mline_index != 0 {
                    trace!(target = "jamrtc::engine", handle = %key, mline_index, "not trickling bundled candidate");
                    return;
                }
                let handle_id = self.directory.lock().handle(key).and_then(Handle::handle_id);
                let (Some(session_id), Some(handle_id)) = (self.session_id(), handle_id) else {
                    return;
                };
                self.send_uncorrelated(&Request::Trickle {
                    session_id,
                    handle_id,
                    candidate: TrickleCandidate {
                        candidate,
                        sdp_mline_index: mline_index,
                    },
                });
            }
            LegEvent::TrackAdded { video } => {
                let target = self
                    .directory
                    .lock()
                    .owner_of(key)
                    .map(|participant| (participant.slot, participant.uuid.clone(), participant.display.clone()));
                let Some((slot, uuid, display)) = target else {
                    return;
                };
                let Some(slot) = slot else {
                    debug!(target = "jamrtc::engine", uuid = %uuid, "track for participant without a slot");
                    return;
                };
                self.render.post(RenderRequest::Remote {
                    slot,
                    uuid,
                    display,
                    video,
                });
            }
        }
    }

    // ----- teardown -----------------------------------------------------------

    async fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        info!(target = "jamrtc::engine", "shutting down");
        self.teardown(true).await;
        self.finish();
    }

    /// Fatal path: tear everything down and report the disconnect once.
    async fn fail(&mut self, err: EngineError) {
        if self.torn_down {
            return;
        }
        error!(target = "jamrtc::engine", error = %err, "fatal signaling error; tearing down");
        self.teardown(false).await;
        self.emit(EngineEvent::ServerDisconnected);
        self.finish();
    }

    async fn teardown(&mut self, say_goodbye: bool) {
        self.torn_down = true;
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if say_goodbye {
            if let Some(session_id) = self.session_id() {
                self.send_uncorrelated(&Request::Destroy { session_id });
            }
        }

        let handles = self.directory.lock().clear();
        for handle in &handles {
            if let Some(leg) = &handle.leg {
                leg.close();
            }
        }
        self.correlator.clear();
        self.deferred.clear();
        self.mic = None;
        self.instrument = None;
        self.room = None;
        self.pending_av = None;
        self.instrument_request = None;
        self.create_transaction = None;

        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
        if let Some(session) = self.session.take() {
            debug!(
                target = "jamrtc::engine",
                session_id = session.id,
                lifetime = ?session.created_at.elapsed(),
                handles = handles.len(),
                "session destroyed"
            );
        }
        self.set_state(SessionState::Disconnected);
    }

    fn finish(&self) {
        let _ = self.stopped.send_replace(true);
    }
}

/// Render requests for the subscribed tracks of a participant that just
/// moved into a slot.
fn promoted_tracks(directory: &Directory, uuid: &str) -> Vec<RenderRequest> {
    let Some(participant) = directory.participant(uuid) else {
        return Vec::new();
    };
    let Some(slot) = participant.slot else {
        return Vec::new();
    };
    let mut requests = Vec::new();
    for stream in [StreamKind::MicWebcam, StreamKind::Instrument] {
        let Some(handle) = participant.leg(stream).and_then(|key| directory.handle(key)) else {
            continue;
        };
        if handle.leg.is_none() {
            continue;
        }
        for (present, video) in [(handle.audio, false), (handle.video, true)] {
            if present {
                requests.push(RenderRequest::Remote {
                    slot,
                    uuid: participant.uuid.clone(),
                    display: participant.display.clone(),
                    video,
                });
            }
        }
    }
    requests
}
