//! Mirrored entities: devices, processes, attach state, watermarks and the per-domain records.

pub mod cpu;
pub mod energy;
pub mod event;
pub mod memory;
pub mod network;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::storage::{Entity, EntityKind};

/// Opaque device identity as reported by the transport (e.g. a serial number).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one connection to a device. A reconnect gets a fresh stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl StreamId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A process as seen through one connection to its device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub pid: i32,
}

impl ProcessKey {
    pub fn new(device_id: DeviceId, stream_id: StreamId, pid: i32) -> Self {
        Self {
            device_id,
            stream_id,
            pid,
        }
    }

    /// Storage id of the process within its device.
    pub fn local_id(&self) -> String {
        format!("{}:{}", self.stream_id, self.pid)
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device_id, self.stream_id, self.pid)
    }
}

/// Device-scoped target for pollers that are not bound to a single process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamTarget {
    pub device_id: DeviceId,
    pub stream_id: StreamId,
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.stream_id)
    }
}

/// Per-poller cursor: the timestamp from which the next fetch starts (inclusive).
/// Boundary records are fetched again and absorbed by insert-or-replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(i64);

impl Watermark {
    pub const BEGINNING: Watermark = Watermark(i64::MIN);

    pub fn at(ts: i64) -> Self {
        Self(ts)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// `max(current, ts)`.
    pub fn advance(&mut self, ts: i64) {
        self.0 = self.0.max(ts);
    }

    /// `max(current, ts + 1)`, for ranges whose boundary record must not be re-fetched.
    pub fn advance_past(&mut self, ts: i64) {
        self.0 = self.0.max(ts.saturating_add(1));
    }

    /// Range `[watermark, +inf)`.
    pub fn range(self) -> FetchRange {
        FetchRange::since(self.0)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::BEGINNING
    }
}

/// Requested time range in nanoseconds. `end_ns == i64::MAX` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRange {
    pub start_ns: i64,
    pub end_ns: i64,
}

impl FetchRange {
    pub const UNBOUNDED: i64 = i64::MAX;

    pub fn since(start_ns: i64) -> Self {
        Self {
            start_ns,
            end_ns: Self::UNBOUNDED,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.end_ns == Self::UNBOUNDED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub api_level: u32,
    pub state: DeviceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Entity for Device {
    const KIND: EntityKind = EntityKind::Device;

    fn id(&self) -> String {
        self.id.0.clone()
    }

    fn timestamp_ns(&self) -> i64 {
        self.last_seen
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(0)
    }
}

/// Storage target under which all device records live.
pub const DEVICES_TARGET: &str = "devices";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Alive,
    Dead,
}

/// Process entry as listed by the remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    #[serde(default)]
    pub start_timestamp_ns: i64,
    #[serde(default)]
    pub abi: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub key: ProcessKey,
    pub name: String,
    pub start_timestamp_ns: i64,
    #[serde(default)]
    pub abi: String,
    pub state: ProcessState,
}

impl Process {
    pub fn alive(key: ProcessKey, info: &ProcessInfo) -> Self {
        Self {
            key,
            name: info.name.clone(),
            start_timestamp_ns: info.start_timestamp_ns,
            abi: info.abi.clone(),
            state: ProcessState::Alive,
        }
    }
}

impl Entity for Process {
    const KIND: EntityKind = EntityKind::Process;

    fn id(&self) -> String {
        self.key.local_id()
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachState {
    #[default]
    Unspecified,
    Attached,
    Unattachable,
}

/// Cached agent attach status for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAttachRecord {
    pub key: ProcessKey,
    pub state: AttachState,
}

impl Entity for AgentAttachRecord {
    const KIND: EntityKind = EntityKind::AgentAttach;

    fn id(&self) -> String {
        self.key.local_id()
    }

    fn timestamp_ns(&self) -> i64 {
        0
    }
}

/// Open end-time marker for recordings still in progress.
pub const OPEN_END: i64 = i64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_never_moves_backwards() {
        let mut w = Watermark::at(1500);
        w.advance(1000);
        assert_eq!(w.get(), 1500);
        w.advance(2000);
        assert_eq!(w.get(), 2000);
    }

    #[test]
    fn advance_past_skips_boundary_and_saturates() {
        let mut w = Watermark::BEGINNING;
        w.advance_past(10);
        assert_eq!(w.get(), 11);
        w.advance_past(5);
        assert_eq!(w.get(), 11);
        w.advance_past(i64::MAX);
        assert_eq!(w.get(), i64::MAX);
    }

    #[test]
    fn range_starts_at_watermark() {
        let r = Watermark::at(1500).range();
        assert_eq!(r.start_ns, 1500);
        assert!(r.is_unbounded());
    }
}
