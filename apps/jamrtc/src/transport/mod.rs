//! Signaling transport: one WebSocket connection carrying Janus JSON.
//!
//! The transport only delivers. Inbound text is reassembled and handed to the
//! engine as [`TransportEvent`]s; outbound documents go through a single FIFO
//! [`OutboundQueue`] drained by a writer task.

mod assembler;
mod queue;
mod websocket;

pub use assembler::Assembler;
pub use queue::{Fragment, OutboundQueue};
pub use websocket::{Transport, WebSocketDialer};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
const MIN_FRAGMENT_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("websocket i/o failed: {0}")]
    Io(String),
    #[error("connection closed")]
    Closed,
    #[error("inbound message exceeds max size: {0} bytes")]
    MessageTooLarge(usize),
    #[error("inbound message is not valid utf-8")]
    Encoding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_fragment_bytes: usize,
    pub max_message_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_fragment_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            max_fragment_bytes: parse_usize_env(
                "JAMRTC_WS_MAX_FRAGMENT_BYTES",
                DEFAULT_MAX_FRAGMENT_BYTES,
                MIN_FRAGMENT_BYTES,
            ),
            max_message_bytes: parse_usize_env(
                "JAMRTC_WS_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
                MIN_FRAGMENT_BYTES,
            ),
        }
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "jamrtc::transport",
                    var, parsed, min, default, "transport config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "jamrtc::transport",
                    var,
                    error = %err,
                    default,
                    "failed to parse transport config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// What the transport hands to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound document.
    Message(String),
    /// The connection ended without being asked to. Fires at most once.
    Disconnected(Option<TransportError>),
}

/// Opens the signaling connection and starts its reader and writer tasks.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        endpoint: &Url,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Transport, TransportError>;
}

#[derive(Clone, Default)]
pub enum SignalingBackend {
    #[default]
    WebSocket,
    Custom(Arc<dyn Dialer>),
}

impl SignalingBackend {
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        match self {
            SignalingBackend::WebSocket => Arc::new(WebSocketDialer),
            SignalingBackend::Custom(dialer) => Arc::clone(dialer),
        }
    }
}

impl std::fmt::Debug for SignalingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingBackend::WebSocket => f.write_str("WebSocket"),
            SignalingBackend::Custom(_) => f.write_str("Custom"),
        }
    }
}
