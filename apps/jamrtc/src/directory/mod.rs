//! Participants and handles, indexed by UUID, numeric user id and UI slot.
//!
//! The directory owns every [`Handle`], local and remote, in a generational
//! arena; everything else refers to handles by [`HandleKey`]. Mutations return
//! the notifications they imply so the caller can emit them after releasing
//! the lock.

mod arena;

pub use arena::HandleKey;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use janus_proto::PeerRecord;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::SubscribeError;
use crate::event::EngineEvent;
use crate::media::MediaLeg;
use arena::Arena;

/// UI slots available to remote participants.
pub const REMOTE_SLOTS: std::ops::RangeInclusive<u8> = 2..=4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    LocalMicWebcam,
    LocalInstrument,
    RemoteSubscribe,
}

impl HandleKind {
    pub fn is_local(self) -> bool {
        !matches!(self, HandleKind::RemoteSubscribe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    AttachRequested,
    Attached,
    NegotiationPending,
    OfferSent,
    SubscribeRequested,
    AnswerPrepared,
    Established,
    Error,
    Closed,
}

/// Which of a participant's two legs a handle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    MicWebcam,
    Instrument,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::MicWebcam => "mic/webcam",
            StreamKind::Instrument => "instrument",
        }
    }
}

/// Back-reference from a remote handle to the participant that exposes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub uuid: String,
    pub stream: StreamKind,
}

pub struct Handle {
    pub kind: HandleKind,
    handle_id: Option<u64>,
    pub state: HandleState,
    pub user_id: Option<u64>,
    pub audio: bool,
    pub video: bool,
    /// Remote legs only: the peer is currently publishing this leg.
    pub published: bool,
    pub owner: Option<Owner>,
    pub leg: Option<Arc<dyn MediaLeg>>,
    /// An offer or answer is being produced for this leg.
    pub negotiating: bool,
}

impl Handle {
    fn new(kind: HandleKind, owner: Option<Owner>) -> Self {
        Self {
            kind,
            handle_id: None,
            state: HandleState::Idle,
            user_id: None,
            audio: false,
            video: false,
            published: false,
            owner,
            leg: None,
            negotiating: false,
        }
    }

    pub fn handle_id(&self) -> Option<u64> {
        self.handle_id
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.kind)
            .field("handle_id", &self.handle_id)
            .field("state", &self.state)
            .field("user_id", &self.user_id)
            .field("audio", &self.audio)
            .field("video", &self.video)
            .field("published", &self.published)
            .field("owner", &self.owner)
            .field("has_leg", &self.leg.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub uuid: String,
    pub display: String,
    pub slot: Option<u8>,
    pub instrument_name: Option<String>,
    mic: Option<HandleKey>,
    instrument: Option<HandleKey>,
}

impl Participant {
    pub fn leg(&self, stream: StreamKind) -> Option<HandleKey> {
        match stream {
            StreamKind::MicWebcam => self.mic,
            StreamKind::Instrument => self.instrument,
        }
    }

    fn leg_slot(&mut self, stream: StreamKind) -> &mut Option<HandleKey> {
        match stream {
            StreamKind::MicWebcam => &mut self.mic,
            StreamKind::Instrument => &mut self.instrument,
        }
    }

    pub fn leg_count(&self) -> usize {
        usize::from(self.mic.is_some()) + usize::from(self.instrument.is_some())
    }

    fn instrument_for(&self, stream: StreamKind) -> Option<String> {
        match stream {
            StreamKind::MicWebcam => None,
            StreamKind::Instrument => self.instrument_name.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("handle {0} no longer exists")]
    StaleHandle(HandleKey),
    #[error("handle already has id {current}; refusing {attempted}")]
    HandleIdAlreadySet { current: u64, attempted: u64 },
    #[error("handle id {0} is already bound to another handle")]
    HandleIdInUse(u64),
}

/// What a recycled remote handle gave up.
pub struct Recycled {
    pub leg: Option<Arc<dyn MediaLeg>>,
    pub handle_id: Option<u64>,
}

/// Result of the leave algorithm.
#[derive(Debug, Default)]
pub struct Departure {
    pub events: Vec<EngineEvent>,
    /// Handles removed from the directory; their legs still need closing.
    pub released: Vec<(HandleKey, Handle)>,
    pub freed_slot: Option<u8>,
    /// A participant that was waiting for a slot and now holds `freed_slot`.
    pub promoted: Option<String>,
}

pub struct Directory {
    local_uuid: String,
    handles: Arena<Handle>,
    participants: HashMap<String, Participant>,
    by_id: HashMap<u64, String>,
    by_slot: BTreeMap<u8, String>,
    by_handle_id: HashMap<u64, HandleKey>,
    /// Participants without a slot, in arrival order.
    waiting: VecDeque<String>,
}

impl Directory {
    pub fn new(local_uuid: impl Into<String>) -> Self {
        Self {
            local_uuid: local_uuid.into(),
            handles: Arena::default(),
            participants: HashMap::new(),
            by_id: HashMap::new(),
            by_slot: BTreeMap::new(),
            by_handle_id: HashMap::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn local_uuid(&self) -> &str {
        &self.local_uuid
    }

    pub fn insert_local(&mut self, kind: HandleKind) -> HandleKey {
        debug_assert!(kind.is_local());
        self.handles.insert(Handle::new(kind, None))
    }

    pub fn handle(&self, key: HandleKey) -> Option<&Handle> {
        self.handles.get(key)
    }

    pub fn handle_mut(&mut self, key: HandleKey) -> Option<&mut Handle> {
        self.handles.get_mut(key)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn set_state(&mut self, key: HandleKey, state: HandleState) -> Option<HandleState> {
        let handle = self.handles.get_mut(key)?;
        let previous = handle.state;
        handle.state = state;
        trace!(
            target = "jamrtc::directory",
            handle = %key,
            from = ?previous,
            to = ?state,
            "handle state"
        );
        Some(previous)
    }

    /// Bind the server-assigned handle id. Only ever succeeds once per handle.
    pub fn assign_handle_id(&mut self, key: HandleKey, id: u64) -> Result<(), DirectoryError> {
        if self.by_handle_id.get(&id).is_some_and(|owner| *owner != key) {
            return Err(DirectoryError::HandleIdInUse(id));
        }
        let handle = self
            .handles
            .get_mut(key)
            .ok_or(DirectoryError::StaleHandle(key))?;
        if let Some(current) = handle.handle_id {
            return Err(DirectoryError::HandleIdAlreadySet {
                current,
                attempted: id,
            });
        }
        handle.handle_id = Some(id);
        self.by_handle_id.insert(id, key);
        Ok(())
    }

    pub fn handle_by_id(&self, handle_id: u64) -> Option<HandleKey> {
        self.by_handle_id.get(&handle_id).copied()
    }

    pub fn leg(&self, key: HandleKey) -> Option<Arc<dyn MediaLeg>> {
        self.handles.get(key)?.leg.clone()
    }

    pub fn participant(&self, uuid: &str) -> Option<&Participant> {
        self.participants.get(uuid)
    }

    pub fn participant_by_id(&self, user_id: u64) -> Option<&Participant> {
        self.by_id
            .get(&user_id)
            .and_then(|uuid| self.participants.get(uuid))
    }

    pub fn participant_in_slot(&self, slot: u8) -> Option<&Participant> {
        self.by_slot
            .get(&slot)
            .and_then(|uuid| self.participants.get(uuid))
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Owner of a remote handle, for routing its tracks to a slot.
    pub fn owner_of(&self, key: HandleKey) -> Option<&Participant> {
        let owner = self.handles.get(key)?.owner.as_ref()?;
        self.participants.get(&owner.uuid)
    }

    /// Records naming ourselves never enter the directory.
    pub fn is_excluded(&self, uuid: Option<&str>, user_id: u64) -> bool {
        if uuid.is_some_and(|uuid| uuid.eq_ignore_ascii_case(&self.local_uuid)) {
            return true;
        }
        self.handles
            .iter()
            .any(|(_, handle)| handle.kind.is_local() && handle.user_id == Some(user_id))
    }

    fn resolve(&self, uuid: Option<&str>, user_id: u64) -> Option<String> {
        if let Some(uuid) = uuid {
            if self.participants.contains_key(uuid) {
                return Some(uuid.to_string());
            }
        }
        self.by_id.get(&user_id).cloned()
    }

    fn free_slot(&self) -> Option<u8> {
        REMOTE_SLOTS
            .clone()
            .find(|slot| !self.by_slot.contains_key(slot))
    }

    /// Join algorithm for one `joining`, `attendees` or `publishers` record.
    pub fn upsert(&mut self, record: &PeerRecord, publishing: bool) -> Vec<EngineEvent> {
        let info = record.identity();
        if self.is_excluded(info.uuid.as_deref(), record.id) {
            trace!(
                target = "jamrtc::directory",
                user_id = record.id,
                "ignoring our own record"
            );
            return Vec::new();
        }

        let mut events = Vec::new();
        let uuid = match self.resolve(info.uuid.as_deref(), record.id) {
            Some(uuid) => uuid,
            None => {
                let uuid = info
                    .uuid
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let slot = self.free_slot();
                match slot {
                    Some(slot) => {
                        self.by_slot.insert(slot, uuid.clone());
                    }
                    None => {
                        warn!(
                            target = "jamrtc::directory",
                            uuid = %uuid,
                            "no free slot; participant waits for one"
                        );
                        self.waiting.push_back(uuid.clone());
                    }
                }
                self.participants.insert(
                    uuid.clone(),
                    Participant {
                        uuid: uuid.clone(),
                        display: info.display.clone(),
                        slot,
                        instrument_name: None,
                        mic: None,
                        instrument: None,
                    },
                );
                debug!(
                    target = "jamrtc::directory",
                    uuid = %uuid,
                    display = %info.display,
                    slot = ?slot,
                    "participant joined"
                );
                events.push(EngineEvent::ParticipantJoined {
                    uuid: uuid.clone(),
                    display: info.display.clone(),
                });
                uuid
            }
        };

        let stream = if info.instrument.is_some() {
            StreamKind::Instrument
        } else {
            StreamKind::MicWebcam
        };
        let (audio, video) = if publishing {
            (record.has_audio(), record.has_video())
        } else {
            (false, false)
        };

        let Some(participant) = self.participants.get_mut(&uuid) else {
            return events;
        };
        if stream == StreamKind::Instrument {
            participant.instrument_name = info.instrument.clone();
        } else if participant.display != info.display {
            participant.display = info.display.clone();
        }

        let existing = participant
            .leg(stream)
            .filter(|key| self.handles.get(*key).is_some());
        let newly_published = match existing {
            Some(key) => {
                let Some(handle) = self.handles.get_mut(key) else {
                    return events;
                };
                if handle.user_id != Some(record.id) {
                    if let Some(previous) = handle.user_id.replace(record.id) {
                        self.by_id.remove(&previous);
                    }
                }
                let was_published = handle.published;
                if publishing {
                    handle.audio = audio;
                    handle.video = video;
                    handle.published = true;
                }
                publishing && !was_published
            }
            None => {
                let mut handle = Handle::new(
                    HandleKind::RemoteSubscribe,
                    Some(Owner {
                        uuid: uuid.clone(),
                        stream,
                    }),
                );
                handle.user_id = Some(record.id);
                handle.audio = audio;
                handle.video = video;
                handle.published = publishing;
                *participant.leg_slot(stream) = Some(self.handles.insert(handle));
                publishing
            }
        };
        if let Some(previous) = self.by_id.insert(record.id, uuid.clone()) {
            if previous != uuid {
                warn!(
                    target = "jamrtc::directory",
                    user_id = record.id,
                    previous = %previous,
                    now = %uuid,
                    "user id moved between participants"
                );
            }
        }

        if newly_published {
            events.push(EngineEvent::StreamStarted {
                uuid: uuid.clone(),
                display: participant.display.clone(),
                instrument: participant.instrument_for(stream),
                has_audio: audio,
                has_video: video,
            });
        }
        events
    }

    /// Leave algorithm for a numeric user id. Unknown ids are a no-op.
    pub fn leave(&mut self, user_id: u64) -> Departure {
        let mut departure = Departure::default();
        let Some(uuid) = self.by_id.remove(&user_id) else {
            trace!(target = "jamrtc::directory", user_id, "leave for unknown user id");
            return departure;
        };
        let Some(participant) = self.participants.get_mut(&uuid) else {
            return departure;
        };

        let stream = [StreamKind::MicWebcam, StreamKind::Instrument]
            .into_iter()
            .find(|stream| {
                participant
                    .leg(*stream)
                    .and_then(|key| self.handles.get(key))
                    .is_some_and(|handle| handle.user_id == Some(user_id))
            });
        if let Some(stream) = stream {
            if let Some(key) = participant.leg_slot(stream).take() {
                if let Some(handle) = self.handles.remove(key) {
                    if let Some(id) = handle.handle_id {
                        self.by_handle_id.remove(&id);
                    }
                    departure.released.push((key, handle));
                }
            }
            departure.events.push(EngineEvent::StreamStopped {
                uuid: uuid.clone(),
                display: participant.display.clone(),
                instrument: participant.instrument_for(stream),
            });
            if stream == StreamKind::Instrument {
                participant.instrument_name = None;
            }
        }

        if participant.leg_count() == 0 {
            departure.events.push(EngineEvent::ParticipantLeft {
                uuid: uuid.clone(),
                display: participant.display.clone(),
            });
            let freed = participant.slot;
            self.participants.remove(&uuid);
            self.by_id.retain(|_, owner| *owner != uuid);
            self.waiting.retain(|waiting| *waiting != uuid);
            debug!(target = "jamrtc::directory", uuid = %uuid, "participant left");
            if let Some(slot) = freed {
                self.by_slot.remove(&slot);
                departure.freed_slot = Some(slot);
                departure.promoted = self.promote(slot);
            }
        }
        departure
    }

    /// Hand a freed slot to the longest-waiting participant.
    fn promote(&mut self, slot: u8) -> Option<String> {
        while let Some(uuid) = self.waiting.pop_front() {
            let Some(participant) = self.participants.get_mut(&uuid) else {
                continue;
            };
            participant.slot = Some(slot);
            self.by_slot.insert(slot, uuid.clone());
            debug!(target = "jamrtc::directory", uuid = %uuid, slot, "participant moved into freed slot");
            return Some(uuid);
        }
        None
    }

    /// Validate a subscribe request and claim the handle for it.
    pub fn prepare_subscribe(
        &mut self,
        uuid: &str,
        want_instrument: bool,
    ) -> Result<HandleKey, SubscribeError> {
        let stream = if want_instrument {
            StreamKind::Instrument
        } else {
            StreamKind::MicWebcam
        };
        let participant = self
            .participants
            .get(uuid)
            .ok_or_else(|| SubscribeError::NoSuchParticipant(uuid.to_string()))?;
        let no_stream = || SubscribeError::NoSuchStream {
            uuid: uuid.to_string(),
            stream: stream.label(),
        };
        let key = participant.leg(stream).ok_or_else(no_stream)?;
        let handle = self.handles.get_mut(key).ok_or_else(no_stream)?;
        if !handle.published {
            return Err(no_stream());
        }
        if handle.state != HandleState::Idle {
            return Err(SubscribeError::AlreadySubscribed {
                uuid: uuid.to_string(),
                stream: stream.label(),
            });
        }
        handle.state = HandleState::AttachRequested;
        Ok(key)
    }

    /// Put a failed or hung-up remote handle back to `Idle` so its stream can
    /// be subscribed again. The server id is unbound and the leg handed back
    /// for closing. Local handles are not recyclable.
    pub fn recycle(&mut self, key: HandleKey) -> Option<Recycled> {
        let handle = self.handles.get_mut(key)?;
        if handle.kind.is_local() {
            return None;
        }
        let handle_id = handle.handle_id.take();
        if let Some(id) = handle_id {
            self.by_handle_id.remove(&id);
        }
        handle.state = HandleState::Idle;
        handle.negotiating = false;
        Some(Recycled {
            leg: handle.leg.take(),
            handle_id,
        })
    }

    /// Remove one handle from every index. Idempotent.
    pub fn destroy_handle(&mut self, key: HandleKey) -> Option<Handle> {
        let handle = self.handles.remove(key)?;
        if let Some(id) = handle.handle_id {
            self.by_handle_id.remove(&id);
        }
        if let Some(owner) = &handle.owner {
            if let Some(participant) = self.participants.get_mut(&owner.uuid) {
                let slot = participant.leg_slot(owner.stream);
                if *slot == Some(key) {
                    *slot = None;
                }
            }
        }
        Some(handle)
    }

    /// Drop every participant and handle, returning the handles.
    pub fn clear(&mut self) -> Vec<Handle> {
        self.participants.clear();
        self.by_id.clear();
        self.by_slot.clear();
        self.by_handle_id.clear();
        self.waiting.clear();
        self.handles.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "3F2504E0-4F89-11D3-9A0C-0305E82C3301";

    fn record(id: u64, display: &str, audio: bool, video: bool) -> PeerRecord {
        PeerRecord {
            id,
            display: Some(display.to_string()),
            audio_codec: audio.then(|| "opus".to_string()),
            video_codec: video.then(|| "vp8".to_string()),
        }
    }

    #[test]
    fn publisher_record_creates_participant_in_lowest_slot() {
        let mut directory = Directory::new(LOCAL);
        let events = directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, false), true);
        assert_eq!(
            events,
            vec![
                EngineEvent::ParticipantJoined {
                    uuid: "abc".into(),
                    display: "Bob".into()
                },
                EngineEvent::StreamStarted {
                    uuid: "abc".into(),
                    display: "Bob".into(),
                    instrument: None,
                    has_audio: true,
                    has_video: false
                },
            ]
        );
        assert_eq!(directory.participant("abc").and_then(|p| p.slot), Some(2));
        assert_eq!(directory.participant_by_id(11).map(|p| p.uuid.as_str()), Some("abc"));
    }

    #[test]
    fn repeated_records_are_idempotent() {
        let mut directory = Directory::new(LOCAL);
        let bob = record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, true);
        assert_eq!(directory.upsert(&bob, true).len(), 2);
        assert!(directory.upsert(&bob, true).is_empty());
        assert!(directory.upsert(&bob, false).is_empty());
        assert_eq!(directory.participants().count(), 1);
        assert_eq!(directory.handle_count(), 1);
    }

    #[test]
    fn instrument_leg_attaches_to_same_participant() {
        let mut directory = Directory::new(LOCAL);
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, true), true);
        let events = directory.upsert(
            &record(12, r#"{"uuid":"abc","display":"Bob","instrument":"bass"}"#, true, false),
            true,
        );
        assert_eq!(
            events,
            vec![EngineEvent::StreamStarted {
                uuid: "abc".into(),
                display: "Bob".into(),
                instrument: Some("bass".into()),
                has_audio: true,
                has_video: false
            }]
        );
        let bob = directory.participant("abc").expect("participant");
        assert_eq!(bob.leg_count(), 2);
        assert_eq!(directory.participant_by_id(12).map(|p| p.uuid.as_str()), Some("abc"));
    }

    #[test]
    fn slots_are_unique_and_exhaust_after_three() {
        let mut directory = Directory::new(LOCAL);
        for (id, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            let display = format!(r#"{{"uuid":"{name}","display":"{name}"}}"#);
            directory.upsert(&record(id, &display, true, false), true);
        }
        let slots: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|uuid| directory.participant(uuid).and_then(|p| p.slot))
            .collect();
        assert_eq!(slots, vec![Some(2), Some(3), Some(4), None]);

        directory.upsert(&record(5, r#"{"uuid":"e","display":"e"}"#, true, false), true);
        let departure = directory.leave(2);
        assert_eq!(departure.freed_slot, Some(3));
        assert_eq!(departure.promoted.as_deref(), Some("d"));
        assert_eq!(directory.participant("d").and_then(|p| p.slot), Some(3));
        assert_eq!(directory.participant_in_slot(3).map(|p| p.uuid.as_str()), Some("d"));
        assert_eq!(directory.participant("e").and_then(|p| p.slot), None);

        // A waiting participant that leaves first is never promoted.
        directory.leave(5);
        let departure = directory.leave(1);
        assert_eq!(departure.promoted, None);
        assert!(directory.participant_in_slot(2).is_none());
    }

    #[test]
    fn failed_remote_handle_can_be_subscribed_again() {
        let mut directory = Directory::new(LOCAL);
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, false), true);
        for failure in [HandleState::Error, HandleState::Closed] {
            let key = directory.prepare_subscribe("abc", false).expect("subscribe");
            directory.assign_handle_id(key, 8).expect("assign");
            directory.set_state(key, failure);
            assert!(matches!(
                directory.prepare_subscribe("abc", false),
                Err(SubscribeError::AlreadySubscribed { .. })
            ));

            let recycled = directory.recycle(key).expect("remote handle");
            assert_eq!(recycled.handle_id, Some(8));
            assert!(directory.handle_by_id(8).is_none());
            assert_eq!(directory.handle(key).map(|h| h.state), Some(HandleState::Idle));
            assert_eq!(directory.handle(key).and_then(Handle::handle_id), None);
        }
        assert!(directory.prepare_subscribe("abc", false).is_ok());

        let local = directory.insert_local(HandleKind::LocalMicWebcam);
        assert!(directory.recycle(local).is_none());
    }

    #[test]
    fn leave_last_leg_removes_participant() {
        let mut directory = Directory::new(LOCAL);
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, false), true);
        let departure = directory.leave(11);
        assert_eq!(
            departure.events,
            vec![
                EngineEvent::StreamStopped {
                    uuid: "abc".into(),
                    display: "Bob".into(),
                    instrument: None
                },
                EngineEvent::ParticipantLeft {
                    uuid: "abc".into(),
                    display: "Bob".into()
                },
            ]
        );
        assert_eq!(departure.released.len(), 1);
        assert_eq!(departure.freed_slot, Some(2));
        assert!(directory.participant("abc").is_none());
        assert!(directory.participant_in_slot(2).is_none());
        assert_eq!(directory.handle_count(), 0);
    }

    #[test]
    fn leave_one_of_two_legs_keeps_participant() {
        let mut directory = Directory::new(LOCAL);
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, false), true);
        directory.upsert(
            &record(12, r#"{"uuid":"abc","display":"Bob","instrument":"keys"}"#, true, false),
            true,
        );
        let departure = directory.leave(12);
        assert_eq!(
            departure.events,
            vec![EngineEvent::StreamStopped {
                uuid: "abc".into(),
                display: "Bob".into(),
                instrument: Some("keys".into())
            }]
        );
        assert_eq!(directory.participant("abc").map(Participant::leg_count), Some(1));
    }

    #[test]
    fn unknown_leave_is_noop() {
        let mut directory = Directory::new(LOCAL);
        let departure = directory.leave(404);
        assert!(departure.events.is_empty());
        assert!(departure.released.is_empty());
    }

    #[test]
    fn own_records_are_excluded() {
        let mut directory = Directory::new(LOCAL);
        let own = format!(r#"{{"uuid":"{}","display":"me"}}"#, LOCAL.to_lowercase());
        assert!(directory.upsert(&record(50, &own, true, true), true).is_empty());

        let mic = directory.insert_local(HandleKind::LocalMicWebcam);
        directory.handle_mut(mic).expect("handle").user_id = Some(99);
        assert!(directory.upsert(&record(99, "plain", true, true), true).is_empty());
        assert_eq!(directory.participants().count(), 0);
    }

    #[test]
    fn record_without_uuid_resolves_by_id() {
        let mut directory = Directory::new(LOCAL);
        let events = directory.upsert(&record(21, "Carol", false, false), false);
        assert_eq!(events.len(), 1);
        let uuid = directory.participant_by_id(21).expect("participant").uuid.clone();
        let events = directory.upsert(&record(21, "Carol", true, false), true);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::StreamStarted { uuid: started, .. }] if *started == uuid
        ));
    }

    #[test]
    fn handle_id_is_set_once() {
        let mut directory = Directory::new(LOCAL);
        let key = directory.insert_local(HandleKind::LocalMicWebcam);
        directory.assign_handle_id(key, 7).expect("first assignment");
        assert_eq!(
            directory.assign_handle_id(key, 8),
            Err(DirectoryError::HandleIdAlreadySet {
                current: 7,
                attempted: 8
            })
        );
        assert_eq!(directory.handle(key).and_then(Handle::handle_id), Some(7));
        assert_eq!(directory.handle_by_id(7), Some(key));

        let other = directory.insert_local(HandleKind::LocalInstrument);
        assert_eq!(
            directory.assign_handle_id(other, 7),
            Err(DirectoryError::HandleIdInUse(7))
        );
    }

    #[test]
    fn subscribe_validation() {
        let mut directory = Directory::new(LOCAL);
        assert!(matches!(
            directory.prepare_subscribe("nobody", false),
            Err(SubscribeError::NoSuchParticipant(_))
        ));
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, false), true);
        assert!(matches!(
            directory.prepare_subscribe("abc", true),
            Err(SubscribeError::NoSuchStream { .. })
        ));
        let key = directory.prepare_subscribe("abc", false).expect("subscribe");
        assert_eq!(
            directory.handle(key).map(|h| h.state),
            Some(HandleState::AttachRequested)
        );
        assert!(matches!(
            directory.prepare_subscribe("abc", false),
            Err(SubscribeError::AlreadySubscribed { .. })
        ));
    }

    #[test]
    fn attendee_is_not_subscribable_until_publishing() {
        let mut directory = Directory::new(LOCAL);
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, false, false), false);
        assert!(matches!(
            directory.prepare_subscribe("abc", false),
            Err(SubscribeError::NoSuchStream { .. })
        ));
    }

    #[test]
    fn destroy_and_clear_are_idempotent() {
        let mut directory = Directory::new(LOCAL);
        directory.upsert(&record(11, r#"{"uuid":"abc","display":"Bob"}"#, true, false), true);
        let key = directory
            .participant("abc")
            .and_then(|p| p.leg(StreamKind::MicWebcam))
            .expect("leg");
        assert!(directory.destroy_handle(key).is_some());
        assert!(directory.destroy_handle(key).is_none());
        assert_eq!(directory.participant("abc").map(Participant::leg_count), Some(0));
        assert!(directory.clear().is_empty());
        assert!(directory.clear().is_empty());
        assert_eq!(directory.participants().count(), 0);
    }
}
