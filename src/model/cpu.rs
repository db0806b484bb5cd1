//! CPU usage samples and per-thread state activity.

use serde::{Deserialize, Serialize};

use crate::storage::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuUsageSample {
    pub timestamp_ns: i64,
    pub elapsed_time_ns: i64,
    pub process_cpu_time_ns: i64,
    pub system_cpu_time_ns: i64,
}

impl Entity for CpuUsageSample {
    const KIND: EntityKind = EntityKind::CpuUsage;

    fn id(&self) -> String {
        self.timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Running,
    Sleeping,
    Waiting,
    Dead,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadStateChange {
    pub timestamp_ns: i64,
    pub state: ThreadState,
}

/// All known state transitions of one thread. Merged by set union across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadActivity {
    pub thread_id: i32,
    pub name: String,
    pub states: Vec<ThreadStateChange>,
}

impl ThreadActivity {
    pub fn last_timestamp_ns(&self) -> Option<i64> {
        self.states.iter().map(|s| s.timestamp_ns).max()
    }
}

impl Entity for ThreadActivity {
    const KIND: EntityKind = EntityKind::ThreadActivity;

    fn id(&self) -> String {
        self.thread_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.states
            .iter()
            .map(|s| s.timestamp_ns)
            .min()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuData {
    #[serde(default)]
    pub usage: Vec<CpuUsageSample>,
    #[serde(default)]
    pub threads: Vec<ThreadActivity>,
}
