//! Capability surface of the media engine.
//!
//! The session engine never touches capture, codecs or ICE itself. It asks a
//! [`MediaEngine`] for one [`MediaLeg`] per handle and drives offer/answer
//! through it; the leg reports back through [`LegEvents`].

mod peer;

pub use peer::WebRtcEngine;

use std::sync::Arc;

use async_trait::async_trait;
use janus_proto::{Jsep, TrickleCandidate};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::directory::{HandleKey, HandleKind};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("media leg closed")]
    Closed,
}

/// Everything a media engine needs to build one leg.
#[derive(Debug, Clone)]
pub struct LegSpec {
    pub kind: HandleKind,
    pub audio: bool,
    pub video: bool,
    pub stereo: bool,
    /// Capture device for local video.
    pub device: Option<String>,
    pub ice_servers: Vec<IceServer>,
    pub jitter_buffer_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegEvent {
    NegotiationNeeded,
    LocalCandidate { mline_index: u16, candidate: String },
    TrackAdded { video: bool },
}

/// Sender side of a leg's callbacks into the engine scheduler.
#[derive(Debug, Clone)]
pub struct LegEvents {
    key: HandleKey,
    tx: mpsc::UnboundedSender<(HandleKey, LegEvent)>,
}

impl LegEvents {
    pub(crate) fn new(key: HandleKey, tx: mpsc::UnboundedSender<(HandleKey, LegEvent)>) -> Self {
        Self { key, tx }
    }

    /// Post an event. Returns false once the engine is gone.
    pub fn emit(&self, event: LegEvent) -> bool {
        self.tx.send((self.key, event)).is_ok()
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_leg(&self, spec: LegSpec, events: LegEvents)
    -> Result<Arc<dyn MediaLeg>, MediaError>;
}

#[async_trait]
pub trait MediaLeg: Send + Sync {
    async fn create_offer(&self) -> Result<Jsep, MediaError>;
    async fn create_answer(&self) -> Result<Jsep, MediaError>;
    async fn set_local_description(&self, description: Jsep) -> Result<(), MediaError>;
    async fn set_remote_description(&self, description: Jsep) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: TrickleCandidate) -> Result<(), MediaError>;
    /// Stop the leg immediately. Idempotent.
    fn close(&self);
}

/// Which media engine `init` should use.
#[derive(Clone, Default)]
pub enum MediaBackend {
    #[default]
    WebRtc,
    Custom(Arc<dyn MediaEngine>),
}

impl std::fmt::Debug for MediaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaBackend::WebRtc => f.write_str("WebRtc"),
            MediaBackend::Custom(_) => f.write_str("Custom"),
        }
    }
}
