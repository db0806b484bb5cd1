//! Local mirror storage: a keyed insert-or-replace contract plus the SQLite implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StorageResult;

/// Table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Device,
    Process,
    AgentAttach,
    CpuUsage,
    ThreadActivity,
    MemorySample,
    AllocStats,
    GcEvent,
    HeapDump,
    AllocationsInfo,
    DumpPayload,
    AllocatedClass,
    AllocationStack,
    AllocationThread,
    Allocation,
    NetworkTraffic,
    ConnectionCount,
    HttpConnection,
    HttpDetail,
    Activity,
    SystemEvent,
    EnergySample,
    EnergyEvent,
    StreamEvent,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Device => "device",
            EntityKind::Process => "process",
            EntityKind::AgentAttach => "agent_attach",
            EntityKind::CpuUsage => "cpu_usage",
            EntityKind::ThreadActivity => "thread_activity",
            EntityKind::MemorySample => "memory_sample",
            EntityKind::AllocStats => "alloc_stats",
            EntityKind::GcEvent => "gc_event",
            EntityKind::HeapDump => "heap_dump",
            EntityKind::AllocationsInfo => "allocations_info",
            EntityKind::DumpPayload => "dump_payload",
            EntityKind::AllocatedClass => "allocated_class",
            EntityKind::AllocationStack => "allocation_stack",
            EntityKind::AllocationThread => "allocation_thread",
            EntityKind::Allocation => "allocation",
            EntityKind::NetworkTraffic => "network_traffic",
            EntityKind::ConnectionCount => "connection_count",
            EntityKind::HttpConnection => "http_connection",
            EntityKind::HttpDetail => "http_detail",
            EntityKind::Activity => "activity",
            EntityKind::SystemEvent => "system_event",
            EntityKind::EnergySample => "energy_sample",
            EntityKind::EnergyEvent => "energy_event",
            EntityKind::StreamEvent => "stream_event",
        }
    }
}

/// Identity of a stored record is `(kind, target, id)`; `timestamp_ns` only drives range queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub target: String,
    pub id: String,
    pub timestamp_ns: i64,
}

impl RecordKey {
    pub fn new(target: impl Into<String>, id: impl Into<String>, timestamp_ns: i64) -> Self {
        Self {
            target: target.into(),
            id: id.into(),
            timestamp_ns,
        }
    }
}

/// Storage contract used by the pipeline. Implementations must accept concurrent callers.
pub trait Storage: Send + Sync {
    fn upsert(&self, kind: EntityKind, key: &RecordKey, value: &Value) -> StorageResult<()>;

    fn query(&self, kind: EntityKind, target: &str, id: &str) -> StorageResult<Option<Value>>;

    /// Records of `kind` under `target` with `from <= timestamp < to`, ordered by timestamp.
    fn query_range(
        &self,
        kind: EntityKind,
        target: &str,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<Value>>;
}

/// A record type with a natural identity.
pub trait Entity: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn id(&self) -> String;

    fn timestamp_ns(&self) -> i64;

    /// Timestamp the owning poller's watermark advances to once this record is merged.
    fn watermark_ns(&self) -> i64 {
        self.timestamp_ns()
    }
}

/// Typed helpers over any [`Storage`].
pub trait StorageExt {
    fn put<T: Entity>(&self, target: &str, record: &T) -> StorageResult<()>;

    fn get<T: Entity>(&self, target: &str, id: &str) -> StorageResult<Option<T>>;

    fn range<T: Entity>(&self, target: &str, from: i64, to: i64) -> StorageResult<Vec<T>>;
}

impl<S: Storage + ?Sized> StorageExt for S {
    fn put<T: Entity>(&self, target: &str, record: &T) -> StorageResult<()> {
        let value = serde_json::to_value(record)?;
        let key = RecordKey::new(target, record.id(), record.timestamp_ns());
        self.upsert(T::KIND, &key, &value)
    }

    fn get<T: Entity>(&self, target: &str, id: &str) -> StorageResult<Option<T>> {
        match self.query(T::KIND, target, id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn range<T: Entity>(&self, target: &str, from: i64, to: i64) -> StorageResult<Vec<T>> {
        self.query_range(T::KIND, target, from, to)?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }
}
