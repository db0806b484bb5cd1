//! Memory domain records: samples, recording sessions (heap dumps, allocation tracking),
//! dump payloads and allocation metadata.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::OPEN_END;
use crate::storage::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp_ns: i64,
    pub java_kb: i64,
    pub native_kb: i64,
    pub stack_kb: i64,
    pub graphics_kb: i64,
    pub code_kb: i64,
    pub others_kb: i64,
    pub total_kb: i64,
}

impl Entity for MemorySample {
    const KIND: EntityKind = EntityKind::MemorySample;

    fn id(&self) -> String {
        self.timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocStatsSample {
    pub timestamp_ns: i64,
    pub java_allocation_count: i64,
    pub java_free_count: i64,
}

impl Entity for AllocStatsSample {
    const KIND: EntityKind = EntityKind::AllocStats;

    fn id(&self) -> String {
        self.timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcEvent {
    pub start_timestamp_ns: i64,
    pub end_timestamp_ns: i64,
}

impl Entity for GcEvent {
    const KIND: EntityKind = EntityKind::GcEvent;

    fn id(&self) -> String {
        self.start_timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }

    fn watermark_ns(&self) -> i64 {
        self.end_timestamp_ns
    }
}

/// A recording that may span several poll cycles. While in progress its end is [`OPEN_END`].
pub trait RecordingSession: Entity + Clone {
    fn start_ns(&self) -> i64;
    fn end_ns(&self) -> i64;

    fn is_open(&self) -> bool {
        self.end_ns() == OPEN_END
    }

    /// Closes the session as failed at `start + 1`.
    fn force_failed_close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDumpInfo {
    pub start_timestamp_ns: i64,
    pub end_timestamp_ns: i64,
    #[serde(default)]
    pub success: bool,
}

impl Entity for HeapDumpInfo {
    const KIND: EntityKind = EntityKind::HeapDump;

    fn id(&self) -> String {
        self.start_timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }

    fn watermark_ns(&self) -> i64 {
        if self.is_open() {
            self.start_timestamp_ns
        } else {
            self.end_timestamp_ns
        }
    }
}

impl RecordingSession for HeapDumpInfo {
    fn start_ns(&self) -> i64 {
        self.start_timestamp_ns
    }

    fn end_ns(&self) -> i64 {
        self.end_timestamp_ns
    }

    fn force_failed_close(&mut self) {
        self.end_timestamp_ns = self.start_timestamp_ns.saturating_add(1);
        self.success = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationsInfo {
    pub start_timestamp_ns: i64,
    pub end_timestamp_ns: i64,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default)]
    pub success: bool,
}

impl Entity for AllocationsInfo {
    const KIND: EntityKind = EntityKind::AllocationsInfo;

    fn id(&self) -> String {
        self.start_timestamp_ns.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }

    fn watermark_ns(&self) -> i64 {
        if self.is_open() {
            self.start_timestamp_ns
        } else {
            self.end_timestamp_ns
        }
    }
}

impl RecordingSession for AllocationsInfo {
    fn start_ns(&self) -> i64 {
        self.start_timestamp_ns
    }

    fn end_ns(&self) -> i64 {
        self.end_timestamp_ns
    }

    fn force_failed_close(&mut self) {
        self.end_timestamp_ns = self.start_timestamp_ns.saturating_add(1);
        self.success = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryData {
    #[serde(default)]
    pub samples: Vec<MemorySample>,
    #[serde(default)]
    pub alloc_stats: Vec<AllocStatsSample>,
    #[serde(default)]
    pub gc_events: Vec<GcEvent>,
    #[serde(default)]
    pub heap_dumps: Vec<HeapDumpInfo>,
    #[serde(default)]
    pub allocations: Vec<AllocationsInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpKind {
    HeapDump,
    Allocations,
}

impl DumpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DumpKind::HeapDump => "heap_dump",
            DumpKind::Allocations => "allocations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpStatus {
    Success,
    NotReady,
    NotFound,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpResponse {
    pub status: DumpStatus,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Heavyweight payload of a closed recording session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpPayload {
    pub kind: DumpKind,
    pub start_timestamp_ns: i64,
    pub status: DumpStatus,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl DumpPayload {
    /// Zero-length placeholder written when the real payload can never be retrieved.
    pub fn placeholder(kind: DumpKind, start_timestamp_ns: i64) -> Self {
        Self {
            kind,
            start_timestamp_ns,
            status: DumpStatus::Failure,
            data: Vec::new(),
        }
    }
}

impl Entity for DumpPayload {
    const KIND: EntityKind = EntityKind::DumpPayload;

    fn id(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.start_timestamp_ns)
    }

    fn timestamp_ns(&self) -> i64 {
        self.start_timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedClass {
    pub class_id: i32,
    pub name: String,
    #[serde(default)]
    pub alloc_timestamp_ns: i64,
}

impl Entity for AllocatedClass {
    const KIND: EntityKind = EntityKind::AllocatedClass;

    fn id(&self) -> String {
        self.class_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.alloc_timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    #[serde(default)]
    pub line_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStack {
    pub stack_id: i32,
    #[serde(default)]
    pub timestamp_ns: i64,
    pub frames: Vec<StackFrame>,
}

impl Entity for AllocationStack {
    const KIND: EntityKind = EntityKind::AllocationStack;

    fn id(&self) -> String {
        self.stack_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: i32,
    pub name: String,
    #[serde(default)]
    pub timestamp_ns: i64,
}

impl Entity for ThreadInfo {
    const KIND: EntityKind = EntityKind::AllocationThread;

    fn id(&self) -> String {
        self.thread_id.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

/// One tracked object. `free_timestamp_ns` stays [`OPEN_END`] until a free event arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub tag: i32,
    pub class_id: i32,
    pub alloc_timestamp_ns: i64,
    pub free_timestamp_ns: i64,
    pub size: i64,
    pub thread_id: i32,
    pub stack_id: i32,
}

impl Entity for Allocation {
    const KIND: EntityKind = EntityKind::Allocation;

    fn id(&self) -> String {
        self.tag.to_string()
    }

    fn timestamp_ns(&self) -> i64 {
        self.alloc_timestamp_ns
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationEvent {
    Alloc(Allocation),
    Free { tag: i32, timestamp_ns: i64 },
}

impl AllocationEvent {
    pub fn timestamp_ns(&self) -> i64 {
        match self {
            AllocationEvent::Alloc(a) => a.alloc_timestamp_ns,
            AllocationEvent::Free { timestamp_ns, .. } => *timestamp_ns,
        }
    }
}

/// Incremental output of live allocation tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveAllocationBatch {
    pub timestamp_ns: i64,
    #[serde(default)]
    pub classes: Vec<AllocatedClass>,
    #[serde(default)]
    pub stacks: Vec<AllocationStack>,
    #[serde(default)]
    pub threads: Vec<ThreadInfo>,
    #[serde(default)]
    pub events: Vec<AllocationEvent>,
}

/// Class and stack metadata referenced by a legacy allocation dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationContexts {
    #[serde(default)]
    pub classes: Vec<AllocatedClass>,
    #[serde(default)]
    pub stacks: Vec<AllocationStack>,
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
