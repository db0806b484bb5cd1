//! Notifications flowing from trackers and pollers to the pipeline supervisor.

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{AttachState, DeviceId, ProcessKey, StreamId, StreamTarget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// First sighting of a process on a connection.
    ProcessStarted {
        process: ProcessKey,
        name: String,
        attach: AttachState,
    },
    ProcessDied {
        process: ProcessKey,
    },
    /// Persistent connectivity loss or explicit disconnect of one connection.
    DeviceLost {
        device_id: DeviceId,
        stream_id: StreamId,
        reason: String,
    },
    /// Storage reported itself unusable.
    StorageFailed {
        error: String,
    },
    /// A configured device should be connected (again).
    ReconnectRequested {
        device_id: DeviceId,
    },
}

/// Cheap, cloneable sending side. Sending never blocks, so it is usable from poll threads.
#[derive(Debug, Clone)]
pub struct LifecycleSender {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

pub type LifecycleReceiver = mpsc::UnboundedReceiver<LifecycleEvent>;

pub fn channel() -> (LifecycleSender, LifecycleReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LifecycleSender { tx }, rx)
}

impl LifecycleSender {
    pub fn send(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            debug!("lifecycle receiver dropped; event discarded");
        }
    }

    pub fn device_lost(&self, connection: &StreamTarget, reason: impl Into<String>) {
        self.send(LifecycleEvent::DeviceLost {
            device_id: connection.device_id.clone(),
            stream_id: connection.stream_id,
            reason: reason.into(),
        });
    }

    pub fn storage_failed(&self, error: impl Into<String>) {
        self.send(LifecycleEvent::StorageFailed {
            error: error.into(),
        });
    }
}
