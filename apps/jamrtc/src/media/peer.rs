use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use janus_proto::{Jsep, SdpType, TrickleCandidate};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine as CodecRegistry};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LegEvent, LegEvents, LegSpec, MediaEngine, MediaError, MediaLeg};
use crate::config::IceServer;

const OPUS_CLOCK_RATE: u32 = 48_000;
const VP8_CLOCK_RATE: u32 = 90_000;

/// Media engine backed by the `webrtc` crate.
///
/// Legs expose local sample tracks for a capture pipeline to feed; capture
/// itself happens elsewhere. The jitter buffer setting is recorded on each
/// leg for the playout side.
pub struct WebRtcEngine {
    api: API,
    jitter_buffer_ms: u32,
}

impl WebRtcEngine {
    pub fn new(jitter_buffer_ms: u32) -> Result<Self, MediaError> {
        Ok(Self {
            api: build_api()?,
            jitter_buffer_ms,
        })
    }
}

fn build_api() -> Result<API, MediaError> {
    let mut codecs = CodecRegistry::default();
    codecs
        .register_default_codecs()
        .map_err(|err| MediaError::Setup(format!("registering codecs: {err}")))?;
    let registry = register_default_interceptors(Registry::new(), &mut codecs)
        .map_err(|err| MediaError::Setup(format!("registering interceptors: {err}")))?;
    Ok(APIBuilder::new()
        .with_media_engine(codecs)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: vec![server.url.clone()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_leg(
        &self,
        spec: LegSpec,
        events: LegEvents,
    ) -> Result<Arc<dyn MediaLeg>, MediaError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&spec.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|err| MediaError::Setup(format!("creating peer connection: {err}")))?,
        );
        wire_callbacks(&pc, events);

        if spec.kind.is_local() {
            let stream_id = Uuid::new_v4().to_string();
            if spec.audio {
                let channels = if spec.stereo { 2 } else { 1 };
                add_local_track(&pc, MIME_TYPE_OPUS, OPUS_CLOCK_RATE, channels, "audio", &stream_id).await?;
            }
            if spec.video {
                add_local_track(&pc, MIME_TYPE_VP8, VP8_CLOCK_RATE, 0, "video", &stream_id).await?;
            }
        } else {
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|err| MediaError::Setup(format!("adding {kind} transceiver: {err}")))?;
            }
        }

        debug!(
            target = "jamrtc::media",
            kind = ?spec.kind,
            audio = spec.audio,
            video = spec.video,
            stereo = spec.stereo,
            device = ?spec.device,
            jitter_buffer_ms = self.jitter_buffer_ms,
            "media leg created"
        );
        Ok(Arc::new(WebRtcLeg {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

async fn add_local_track(
    pc: &RTCPeerConnection,
    mime_type: &str,
    clock_rate: u32,
    channels: u16,
    id: &str,
    stream_id: &str,
) -> Result<(), MediaError> {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate,
            channels,
            ..Default::default()
        },
        id.to_owned(),
        stream_id.to_owned(),
    ));
    pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|err| MediaError::Setup(format!("adding {id} track: {err}")))?;
    Ok(())
}

fn wire_callbacks(pc: &RTCPeerConnection, events: LegEvents) {
    let negotiation = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        negotiation.emit(LegEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                trace!(target = "jamrtc::media", "local candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    candidates.emit(LegEvent::LocalCandidate {
                        mline_index: init.sdp_mline_index.unwrap_or(0),
                        candidate: init.candidate,
                    });
                }
                Err(err) => warn!(target = "jamrtc::media", error = %err, "unserializable local candidate"),
            }
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let video = track.kind() == RTPCodecType::Video;
        events.emit(LegEvent::TrackAdded { video });
        Box::pin(async {})
    }));
}

struct WebRtcLeg {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcLeg {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed);
        }
        Ok(())
    }
}

fn to_jsep(description: RTCSessionDescription) -> Result<Jsep, MediaError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(MediaError::Negotiation(format!("unexpected description type {other}")));
        }
    };
    Ok(Jsep {
        kind,
        sdp: description.sdp,
    })
}

fn from_jsep(description: Jsep) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| MediaError::Negotiation(format!("parsing description: {err}")))
}

#[async_trait]
impl MediaLeg for WebRtcLeg {
    async fn create_offer(&self) -> Result<Jsep, MediaError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| MediaError::Negotiation(format!("creating offer: {err}")))?;
        to_jsep(offer)
    }

    async fn create_answer(&self) -> Result<Jsep, MediaError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| MediaError::Negotiation(format!("creating answer: {err}")))?;
        to_jsep(answer)
    }

    async fn set_local_description(&self, description: Jsep) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(from_jsep(description)?)
            .await
            .map_err(|err| MediaError::Negotiation(format!("setting local description: {err}")))
    }

    async fn set_remote_description(&self, description: Jsep) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(from_jsep(description)?)
            .await
            .map_err(|err| MediaError::Negotiation(format!("setting remote description: {err}")))
    }

    async fn add_ice_candidate(&self, candidate: TrickleCandidate) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                ..Default::default()
            })
            .await
            .map_err(|err| MediaError::Negotiation(format!("adding candidate: {err}")))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target = "jamrtc::media", "closing media leg outside a runtime; connection leaks until drop");
            return;
        };
        let pc = Arc::clone(&self.pc);
        runtime.spawn(async move {
            if let Err(err) = pc.close().await {
                debug!(target = "jamrtc::media", error = %err, "error closing peer connection");
            }
        });
    }
}
