use serde::Deserialize;
use serde_json::Value;

use crate::{ParticipantInfo, ProtocolError};
use crate::request::{Jsep, SdpType, TrickleCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Success,
    Event,
    Ack,
    WebrtcUp,
    Media,
    Hangup,
    Error,
    SlowLink,
    Trickle,
    Detached,
    Timeout,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IdData {
    #[serde(default)]
    id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawJsep {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    sdp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    candidate: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
    #[serde(default)]
    completed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct PluginData {
    #[serde(default)]
    data: Option<VideoRoomEvent>,
}

/// Top-level `error` object on a Janus core error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// One decoded server message.
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    pub janus: EventKind,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub session_id: Option<u64>,
    #[serde(default)]
    pub sender: Option<u64>,
    #[serde(default)]
    data: Option<IdData>,
    #[serde(default)]
    jsep: Option<RawJsep>,
    #[serde(default)]
    candidate: Option<RawCandidate>,
    #[serde(default)]
    plugindata: Option<PluginData>,
    #[serde(default)]
    pub error: Option<ApiError>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "type")]
    pub media_kind: Option<String>,
    #[serde(default)]
    pub receiving: Option<bool>,
}

impl Inbound {
    /// `data.id` of a create or attach response.
    pub fn created_id(&self) -> Result<u64, ProtocolError> {
        self.data
            .as_ref()
            .and_then(|data| data.id)
            .ok_or(ProtocolError::MissingField("data.id"))
    }

    /// Session description, if one is attached. `None` means no `jsep` key.
    pub fn jsep(&self) -> Option<Result<Jsep, ProtocolError>> {
        let raw = self.jsep.as_ref()?;
        Some(Self::typed_jsep(raw))
    }

    fn typed_jsep(raw: &RawJsep) -> Result<Jsep, ProtocolError> {
        let kind = raw
            .kind
            .as_deref()
            .ok_or(ProtocolError::MissingField("jsep.type"))?;
        let kind = SdpType::parse(kind).ok_or_else(|| ProtocolError::InvalidField {
            field: "jsep.type",
            reason: format!("unsupported sdp type {kind:?}"),
        })?;
        let sdp = raw
            .sdp
            .clone()
            .ok_or(ProtocolError::MissingField("jsep.sdp"))?;
        Ok(Jsep { kind, sdp })
    }

    /// Trickled remote candidate. End-of-candidates markers yield `None`.
    pub fn candidate(&self) -> Option<TrickleCandidate> {
        let raw = self.candidate.as_ref()?;
        if raw.completed.unwrap_or(false) {
            return None;
        }
        Some(TrickleCandidate {
            candidate: raw.candidate.clone()?,
            sdp_mline_index: raw.sdp_mline_index.unwrap_or(0),
        })
    }

    pub fn plugin_event(&self) -> Option<&VideoRoomEvent> {
        self.plugindata.as_ref()?.data.as_ref()
    }
}

/// Error reported by the VideoRoom plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginError {
    pub code: i64,
    pub reason: String,
}

/// `plugindata.data` of a VideoRoom event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoRoomEvent {
    #[serde(default)]
    pub videoroom: Option<String>,
    #[serde(default)]
    pub room: Option<u64>,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub private_id: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    joining: Option<Value>,
    #[serde(default)]
    attendees: Option<Vec<Value>>,
    #[serde(default)]
    publishers: Option<Vec<Value>>,
    #[serde(default)]
    leaving: Option<Value>,
    #[serde(default)]
    unpublished: Option<Value>,
}

impl VideoRoomEvent {
    pub fn is_joined(&self) -> bool {
        self.videoroom.as_deref() == Some("joined")
    }

    pub fn error(&self) -> Option<PluginError> {
        if self.error.is_none() && self.error_code.is_none() {
            return None;
        }
        Some(PluginError {
            code: self.error_code.unwrap_or_default(),
            reason: self.error.clone().unwrap_or_default(),
        })
    }

    pub fn joining(&self) -> Option<Result<PeerRecord, ProtocolError>> {
        self.joining.as_ref().map(PeerRecord::from_value)
    }

    pub fn attendees(&self) -> Vec<Result<PeerRecord, ProtocolError>> {
        Self::records(self.attendees.as_deref())
    }

    pub fn publishers(&self) -> Vec<Result<PeerRecord, ProtocolError>> {
        Self::records(self.publishers.as_deref())
    }

    /// User id of a departed participant. `"ok"` (our own leave) is not an id.
    pub fn leaving(&self) -> Option<u64> {
        self.leaving.as_ref().and_then(Value::as_u64)
    }

    /// User id of a stopped publication. `"ok"` (our own unpublish) is not an id.
    pub fn unpublished(&self) -> Option<u64> {
        self.unpublished.as_ref().and_then(Value::as_u64)
    }

    fn records(list: Option<&[Value]>) -> Vec<Result<PeerRecord, ProtocolError>> {
        list.unwrap_or_default()
            .iter()
            .map(PeerRecord::from_value)
            .collect()
    }
}

/// A participant entry from `joining`, `attendees` or `publishers`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerRecord {
    pub id: u64,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub video_codec: Option<String>,
}

impl PeerRecord {
    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        if value.get("id").is_none() {
            return Err(ProtocolError::MissingField("id"));
        }
        Ok(Self::deserialize(value)?)
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    /// Identity from the display field; the numeric id stands in for a missing display.
    pub fn identity(&self) -> ParticipantInfo {
        match self.display.as_deref() {
            Some(raw) => ParticipantInfo::parse(raw),
            None => ParticipantInfo {
                uuid: None,
                display: self.id.to_string(),
                instrument: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{decode, encode, EventKind, PluginBody, ProtocolError, Request};

    #[test]
    fn create_response_roundtrip() {
        let text = encode(&Request::Create, "tx-1").expect("encode");
        let sent: serde_json::Value = serde_json::from_str(&text).expect("json");
        let reply = format!(
            r#"{{"janus":"success","transaction":{},"data":{{"id":42}}}}"#,
            sent["transaction"]
        );
        let inbound = decode(&reply).expect("decode");
        assert_eq!(inbound.janus, EventKind::Success);
        assert_eq!(inbound.transaction.as_deref(), Some("tx-1"));
        assert_eq!(inbound.created_id().expect("id"), 42);
    }

    #[test]
    fn attach_response_exposes_session_and_handle() {
        let request = Request::Attach {
            session_id: 42,
            plugin: crate::VIDEOROOM_PLUGIN.into(),
        };
        encode(&request, "tx-2").expect("encode");
        let inbound = decode(
            r#"{"janus":"success","session_id":42,"transaction":"tx-2","data":{"id":7}}"#,
        )
        .expect("decode");
        assert_eq!(inbound.session_id, Some(42));
        assert_eq!(inbound.created_id().expect("id"), 7);
    }

    #[test]
    fn missing_data_id_is_reported() {
        let inbound = decode(r#"{"janus":"success","transaction":"x","data":{}}"#).expect("decode");
        assert!(matches!(
            inbound.created_id(),
            Err(ProtocolError::MissingField("data.id"))
        ));
    }

    #[test]
    fn missing_janus_key_fails() {
        assert!(matches!(decode(r#"{"transaction":"x"}"#), Err(ProtocolError::Json(_))));
        assert!(decode("not json").is_err());
    }

    #[test]
    fn jsep_requires_type() {
        let inbound = decode(r#"{"janus":"event","sender":5,"jsep":{"sdp":"v=0"}}"#).expect("decode");
        assert!(matches!(
            inbound.jsep(),
            Some(Err(ProtocolError::MissingField("jsep.type")))
        ));
        let inbound = decode(r#"{"janus":"event","sender":5}"#).expect("decode");
        assert!(inbound.jsep().is_none());
    }

    #[test]
    fn unknown_events_are_tolerated() {
        let inbound = decode(r#"{"janus":"something-new"}"#).expect("decode");
        assert_eq!(inbound.janus, EventKind::Other);
        let inbound = decode(r#"{"janus":"webrtcup","sender":3}"#).expect("decode");
        assert_eq!(inbound.janus, EventKind::WebrtcUp);
    }

    #[test]
    fn candidate_defaults_mline_and_skips_completed() {
        let inbound = decode(
            r#"{"janus":"trickle","sender":1,"candidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 9 typ host"}}"#,
        )
        .expect("decode");
        let candidate = inbound.candidate().expect("candidate");
        assert_eq!(candidate.sdp_mline_index, 0);

        let inbound =
            decode(r#"{"janus":"trickle","sender":1,"candidate":{"completed":true}}"#).expect("decode");
        assert!(inbound.candidate().is_none());
    }

    #[test]
    fn videoroom_publishers_parse_leniently() {
        let inbound = decode(
            r#"{"janus":"event","sender":9,"plugindata":{"plugin":"janus.plugin.videoroom","data":{
                "videoroom":"event","room":1234,
                "publishers":[
                    {"id":11,"display":"{\"uuid\":\"U-B\",\"display\":\"Bob\"}","audio_codec":"opus","video_codec":"vp8"},
                    {"display":"nobody"},
                    {"id":12,"audio_codec":"opus"}
                ]}}}"#,
        )
        .expect("decode");
        let event = inbound.plugin_event().expect("plugin data");
        let records = event.publishers();
        assert_eq!(records.len(), 3);
        let first = records[0].as_ref().expect("valid record");
        assert!(first.has_audio() && first.has_video());
        assert_eq!(first.identity().uuid.as_deref(), Some("U-B"));
        assert!(records[1].is_err());
        let third = records[2].as_ref().expect("valid record");
        assert_eq!(third.identity().display, "12");
        assert!(!third.has_video());
    }

    #[test]
    fn leaving_ok_is_not_an_id() {
        let inbound = decode(
            r#"{"janus":"event","sender":9,"plugindata":{"data":{"videoroom":"event","leaving":"ok"}}}"#,
        )
        .expect("decode");
        assert_eq!(inbound.plugin_event().expect("data").leaving(), None);
        let inbound = decode(
            r#"{"janus":"event","sender":9,"plugindata":{"data":{"videoroom":"event","unpublished":31}}}"#,
        )
        .expect("decode");
        assert_eq!(inbound.plugin_event().expect("data").unpublished(), Some(31));
    }

    #[test]
    fn plugin_error_is_surfaced() {
        let inbound = decode(
            r#"{"janus":"event","sender":9,"plugindata":{"data":{"videoroom":"event","error_code":426,"error":"No such room"}}}"#,
        )
        .expect("decode");
        let error = inbound.plugin_event().and_then(|event| event.error()).expect("error");
        assert_eq!(error.code, 426);
        assert_eq!(error.reason, "No such room");
    }

    #[test]
    fn start_body_is_room_scoped() {
        let value = serde_json::to_value(PluginBody::start(5)).expect("serialize");
        assert_eq!(value["request"], "start");
        assert_eq!(value["room"], 5);
    }
}
