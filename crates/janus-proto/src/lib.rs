//! Wire types for the Janus WebSocket API as used against the VideoRoom plugin.
//!
//! Outbound requests are closed variants serialized in one place
//! ([`encode`]); inbound documents decode into [`Inbound`], whose accessors
//! report absent required fields as [`ProtocolError`] instead of defaulting.

mod display;
mod inbound;
mod request;

pub use display::ParticipantInfo;
pub use inbound::{ApiError, EventKind, Inbound, PeerRecord, PluginError, VideoRoomEvent};
pub use request::{encode, Jsep, ParticipantType, PluginBody, PluginRequest, Request, SdpType, TrickleCandidate};

use thiserror::Error;

/// Subprotocol negotiated on the WebSocket upgrade.
pub const SUBPROTOCOL: &str = "janus-protocol";

/// Plugin every handle attaches to.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Parse one complete inbound text message.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
