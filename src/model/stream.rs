//! Generic device-scoped event stream.

use serde::{Deserialize, Serialize};

use crate::storage::{Entity, EntityKind};

/// An event from the unified stream. `event_id` is assigned by the remote agent and breaks
/// ties between events sharing a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: i64,
    pub kind: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub group_id: i64,
    pub timestamp_ns: i64,
    #[serde(default)]
    pub is_ended: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Entity for StreamEvent {
    const KIND: EntityKind = EntityKind::StreamEvent;

    fn id(&self) -> String {
        self.event_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}
