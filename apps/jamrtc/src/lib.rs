//! Signaling and session engine for JamRTC jam sessions over a Janus
//! VideoRoom relay.

pub mod config;
pub mod correlator;
pub mod directory;
pub mod engine;
pub mod error;
pub mod event;
pub mod media;
pub mod render;
pub mod telemetry;
pub mod transport;

pub use config::{EngineConfig, IceServer};
pub use engine::{Engine, SessionState, init, init_with_render};
pub use error::{EngineError, SubscribeError};
pub use event::EngineEvent;
pub use media::{MediaBackend, MediaEngine, MediaLeg};
pub use render::RenderRequest;
pub use transport::SignalingBackend;
