use janus_proto::ProtocolError;
use thiserror::Error;

use crate::media::MediaError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server rejected request ({code}): {reason}")]
    Application { code: i64, reason: String },
    #[error("session expired on the server")]
    SessionExpired,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("engine stopped")]
    Stopped,
}

/// Negative result of a `subscribe` call. Never tears anything down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("no participant with uuid {0}")]
    NoSuchParticipant(String),
    #[error("participant {uuid} has no {stream} stream")]
    NoSuchStream { uuid: String, stream: &'static str },
    #[error("already subscribed to {stream} stream of {uuid}")]
    AlreadySubscribed { uuid: String, stream: &'static str },
}
