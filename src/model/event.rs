//! UI lifecycle activities and system input events.

use serde::{Deserialize, Serialize};

use crate::storage::{Entity, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Created,
    Started,
    Resumed,
    Paused,
    Stopped,
    Destroyed,
    Added,
    Attached,
    Detached,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityStateChange {
    pub state: ActivityState,
    pub timestamp_ns: i64,
}

/// An activity (or fragment) and every lifecycle transition seen so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityData {
    pub hash: i64,
    pub name: String,
    #[serde(default)]
    pub fragment: bool,
    pub states: Vec<ActivityStateChange>,
}

impl Entity for ActivityData {
    const KIND: EntityKind = EntityKind::Activity;

    fn id(&self) -> String {
        self.hash.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.states
            .iter()
            .map(|s| s.timestamp_ns)
            .min()
            .unwrap_or(0)
    }

    fn watermark_ns(&self) -> i64 {
        self.states
            .iter()
            .map(|s| s.timestamp_ns)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    Touch,
    Key,
    Rotation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub event_id: i64,
    pub kind: SystemEventKind,
    pub start_timestamp_ns: i64,
    #[serde(default)]
    pub end_timestamp_ns: i64,
    #[serde(default)]
    pub detail: String,
}

impl Entity for SystemEvent {
    const KIND: EntityKind = EntityKind::SystemEvent;

    fn id(&self) -> String {
        self.event_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }

    fn watermark_ns(&self) -> i64 {
        self.start_timestamp_ns.max(self.end_timestamp_ns)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub activities: Vec<ActivityData>,
    #[serde(default)]
    pub system_events: Vec<SystemEvent>,
}
