use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Every request the client ever sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Create,
    Attach {
        session_id: u64,
        plugin: String,
    },
    Message {
        session_id: u64,
        handle_id: u64,
        body: PluginBody,
        jsep: Option<Jsep>,
    },
    Trickle {
        session_id: u64,
        handle_id: u64,
        candidate: TrickleCandidate,
    },
    KeepAlive {
        session_id: u64,
    },
    Detach {
        session_id: u64,
        handle_id: u64,
    },
    Destroy {
        session_id: u64,
    },
}

impl Request {
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Create => "create",
            Request::Attach { .. } => "attach",
            Request::Message { .. } => "message",
            Request::Trickle { .. } => "trickle",
            Request::KeepAlive { .. } => "keepalive",
            Request::Detach { .. } => "detach",
            Request::Destroy { .. } => "destroy",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    janus: &'static str,
    transaction: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a PluginBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jsep: Option<&'a Jsep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<&'a TrickleCandidate>,
}

/// Serialize `request` with the given transaction token.
pub fn encode(request: &Request, transaction: &str) -> Result<String, ProtocolError> {
    let mut envelope = Envelope {
        janus: request.verb(),
        transaction,
        session_id: None,
        handle_id: None,
        plugin: None,
        body: None,
        jsep: None,
        candidate: None,
    };
    match request {
        Request::Create => {}
        Request::Attach { session_id, plugin } => {
            envelope.session_id = Some(*session_id);
            envelope.plugin = Some(plugin.as_str());
        }
        Request::Message {
            session_id,
            handle_id,
            body,
            jsep,
        } => {
            envelope.session_id = Some(*session_id);
            envelope.handle_id = Some(*handle_id);
            envelope.body = Some(body);
            envelope.jsep = jsep.as_ref();
        }
        Request::Trickle {
            session_id,
            handle_id,
            candidate,
        } => {
            envelope.session_id = Some(*session_id);
            envelope.handle_id = Some(*handle_id);
            envelope.candidate = Some(candidate);
        }
        Request::KeepAlive { session_id } | Request::Destroy { session_id } => {
            envelope.session_id = Some(*session_id);
        }
        Request::Detach {
            session_id,
            handle_id,
        } => {
            envelope.session_id = Some(*session_id);
            envelope.handle_id = Some(*handle_id);
        }
    }
    Ok(serde_json::to_string(&envelope)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginRequest {
    Join,
    JoinAndConfigure,
    Configure,
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Publisher,
    Subscriber,
}

/// Body of a VideoRoom `message` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginBody {
    pub request: PluginRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptype: Option<ParticipantType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_id: Option<u64>,
}

impl PluginBody {
    fn bare(request: PluginRequest) -> Self {
        Self {
            request,
            ptype: None,
            room: None,
            display: None,
            audio: None,
            video: None,
            feed: None,
            private_id: None,
        }
    }

    /// Join as a publisher without sending media yet.
    pub fn publisher_join(room: u64, display: String) -> Self {
        Self {
            ptype: Some(ParticipantType::Publisher),
            room: Some(room),
            display: Some(display),
            ..Self::bare(PluginRequest::Join)
        }
    }

    /// Join and publish in one step; used by the instrument handle.
    pub fn publisher_join_and_configure(room: u64, display: String, audio: bool, video: bool) -> Self {
        Self {
            ptype: Some(ParticipantType::Publisher),
            room: Some(room),
            display: Some(display),
            audio: Some(audio),
            video: Some(video),
            ..Self::bare(PluginRequest::JoinAndConfigure)
        }
    }

    pub fn configure(audio: bool, video: bool) -> Self {
        Self {
            audio: Some(audio),
            video: Some(video),
            ..Self::bare(PluginRequest::Configure)
        }
    }

    pub fn subscriber_join(room: u64, feed: u64, private_id: Option<u64>) -> Self {
        Self {
            ptype: Some(ParticipantType::Subscriber),
            room: Some(room),
            feed: Some(feed),
            private_id,
            ..Self::bare(PluginRequest::Join)
        }
    }

    pub fn start(room: u64) -> Self {
        Self {
            room: Some(room),
            ..Self::bare(PluginRequest::Start)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "offer" => Some(SdpType::Offer),
            "answer" => Some(SdpType::Answer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickleCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).expect("valid json")
    }

    #[test]
    fn create_has_no_session() {
        let value = parse(&encode(&Request::Create, "abc").expect("encode"));
        assert_eq!(value["janus"], "create");
        assert_eq!(value["transaction"], "abc");
        assert!(value.get("session_id").is_none());
        assert!(value.get("handle_id").is_none());
    }

    #[test]
    fn attach_names_plugin() {
        let request = Request::Attach {
            session_id: 42,
            plugin: crate::VIDEOROOM_PLUGIN.to_string(),
        };
        let value = parse(&encode(&request, "t1").expect("encode"));
        assert_eq!(value["janus"], "attach");
        assert_eq!(value["session_id"], 42);
        assert_eq!(value["plugin"], "janus.plugin.videoroom");
    }

    #[test]
    fn configure_carries_jsep() {
        let request = Request::Message {
            session_id: 1,
            handle_id: 2,
            body: PluginBody::configure(true, false),
            jsep: Some(Jsep {
                kind: SdpType::Offer,
                sdp: "v=0\r\n".into(),
            }),
        };
        let value = parse(&encode(&request, "t2").expect("encode"));
        assert_eq!(value["janus"], "message");
        assert_eq!(value["handle_id"], 2);
        assert_eq!(value["body"]["request"], "configure");
        assert_eq!(value["body"]["audio"], true);
        assert_eq!(value["body"]["video"], false);
        assert!(value["body"].get("room").is_none());
        assert_eq!(value["jsep"]["type"], "offer");
        assert_eq!(value["jsep"]["sdp"], "v=0\r\n");
    }

    #[test]
    fn join_and_configure_is_one_word() {
        let body = PluginBody::publisher_join_and_configure(1234, "{}".into(), true, false);
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["request"], "joinandconfigure");
        assert_eq!(value["ptype"], "publisher");
        assert_eq!(value["room"], 1234);
    }

    #[test]
    fn subscriber_join_lists_feed_and_private_id() {
        let body = PluginBody::subscriber_join(1234, 77, Some(9));
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["ptype"], "subscriber");
        assert_eq!(value["feed"], 77);
        assert_eq!(value["private_id"], 9);
    }

    #[test]
    fn trickle_uses_mline_index_key() {
        let request = Request::Trickle {
            session_id: 1,
            handle_id: 2,
            candidate: TrickleCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mline_index: 0,
            },
        };
        let value = parse(&encode(&request, "t3").expect("encode"));
        assert_eq!(value["janus"], "trickle");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert!(value.get("body").is_none());
    }
}
