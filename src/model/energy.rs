use serde::{Deserialize, Serialize};

use crate::storage::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergySample {
    pub timestamp_ns: i64,
    pub cpu_usage: i32,
    pub network_usage: i32,
    pub location_usage: i32,
}

impl Entity for EnergySample {
    const KIND: EntityKind = EntityKind::EnergySample;

    fn id(&self) -> String {
        self.timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyEventKind {
    WakeLockAcquired,
    WakeLockReleased,
    AlarmSet,
    AlarmCancelled,
    AlarmFired,
    JobScheduled,
    JobStarted,
    JobFinished,
    LocationUpdateRequested,
    LocationChanged,
    LocationUpdateRemoved,
}

/// One transition of an energy-relevant system call. Events sharing an id form a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyEvent {
    pub event_id: i64,
    pub timestamp_ns: i64,
    pub kind: EnergyEventKind,
    #[serde(default)]
    pub is_terminal: bool,
}

impl Entity for EnergyEvent {
    const KIND: EntityKind = EntityKind::EnergyEvent;

    fn id(&self) -> String {
        format!("{}:{}", self.event_id, self.timestamp_ns)
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyData {
    #[serde(default)]
    pub samples: Vec<EnergySample>,
    #[serde(default)]
    pub events: Vec<EnergyEvent>,
}
