//! Requests posted to the UI scheduler. The engine never draws anything.

use tokio::sync::mpsc;
use tracing::trace;

/// Slot reserved for the local participant.
pub const LOCAL_SLOT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderRequest {
    /// Show the local participant in slot 1.
    Local { display: String },
    /// Show the local capture preview for a published leg.
    Preview { video: bool, instrument: Option<String> },
    /// Show a remote track in the participant's slot.
    Remote {
        slot: u8,
        uuid: String,
        display: String,
        video: bool,
    },
    /// Clear a slot after its participant left.
    Clear { slot: u8 },
}

/// Optional sink for render requests. Dropped requests are not an error.
#[derive(Debug, Clone, Default)]
pub struct RenderQueue {
    tx: Option<mpsc::UnboundedSender<RenderRequest>>,
}

impl RenderQueue {
    pub fn new(tx: Option<mpsc::UnboundedSender<RenderRequest>>) -> Self {
        Self { tx }
    }

    pub fn post(&self, request: RenderRequest) {
        let Some(tx) = &self.tx else {
            return;
        };
        trace!(target = "jamrtc::render", request = ?request, "posting render request");
        let _ = tx.send(request);
    }
}
