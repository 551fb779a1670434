//! Progress and completion events pushed to clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Event emitted to the external broadcast collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscodeEvent {
    Progress {
        job_id: String,
        audio_file_id: String,
        percent: u8,
    },
    Completed {
        job_id: String,
        audio_file_id: String,
    },
    Failed {
        job_id: String,
        audio_file_id: String,
        reason: String,
    },
}

/// Receives transcode events; delivery is fire-and-forget.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TranscodeEvent);
}

/// Sink backed by a tokio broadcast channel.
///
/// Events sent while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<TranscodeEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscodeEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: TranscodeEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}
