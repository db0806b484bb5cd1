//! Shared fakes: a scripted agent, a transport handing it out, and instrumented stores.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use devmirror_agent::connection::Transport;
use devmirror_agent::error::{RemoteError, RemoteResult, StorageError, StorageResult, TransportError};
use devmirror_agent::lifecycle::{self, LifecycleReceiver};
use devmirror_agent::model::cpu::CpuData;
use devmirror_agent::model::energy::EnergyData;
use devmirror_agent::model::event::EventData;
use devmirror_agent::model::memory::{
    AllocationContexts, DumpKind, DumpResponse, DumpStatus, LiveAllocationBatch, MemoryData,
};
use devmirror_agent::model::network::{DetailKind, HttpConnection, HttpDetail, NetworkData};
use devmirror_agent::model::stream::StreamEvent;
use devmirror_agent::model::{
    AttachState, Device, DeviceId, DeviceState, FetchRange, ProcessInfo, ProcessKey, StreamId,
};
use devmirror_agent::pollers::PollerContext;
use devmirror_agent::remote::AgentService;
use devmirror_agent::storage::{EntityKind, RecordKey, SqliteStore, Storage};

/// Scripted responses are consumed in order; an empty script answers with empty data.
#[derive(Default)]
pub struct FakeAgent {
    pub devices: Mutex<Vec<Device>>,
    pub processes: Mutex<Vec<ProcessInfo>>,
    pub attach: Mutex<HashMap<i32, AttachState>>,
    pub attach_calls: AtomicUsize,
    pub cpu: Mutex<VecDeque<RemoteResult<CpuData>>>,
    pub memory: Mutex<VecDeque<RemoteResult<MemoryData>>>,
    pub live: Mutex<VecDeque<RemoteResult<Vec<LiveAllocationBatch>>>>,
    pub contexts: Mutex<AllocationContexts>,
    pub dumps: Mutex<VecDeque<RemoteResult<DumpResponse>>>,
    pub network: Mutex<VecDeque<RemoteResult<NetworkData>>>,
    pub http: Mutex<VecDeque<RemoteResult<Vec<HttpConnection>>>>,
    pub events: Mutex<VecDeque<RemoteResult<EventData>>>,
    pub energy: Mutex<VecDeque<RemoteResult<EnergyData>>>,
    pub stream: Mutex<VecDeque<RemoteResult<Vec<StreamEvent>>>>,
    /// Every range requested, tagged with the call name.
    pub ranges: Mutex<Vec<(&'static str, FetchRange)>>,
    pub detail_calls: Mutex<Vec<(i64, DetailKind)>>,
    /// When set, every call fails with this error.
    pub fail_all: Mutex<Option<RemoteError>>,
}

fn next<T: Default>(script: &Mutex<VecDeque<RemoteResult<T>>>) -> RemoteResult<T> {
    script.lock().pop_front().unwrap_or_else(|| Ok(T::default()))
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_device(id: &str, api_level: u32) -> Arc<Self> {
        let agent = Self::default();
        *agent.devices.lock() = vec![device(id, api_level)];
        Arc::new(agent)
    }

    pub fn set_processes(&self, pids: &[i32]) {
        *self.processes.lock() = pids
            .iter()
            .map(|&pid| ProcessInfo {
                pid,
                name: format!("proc{}", pid),
                start_timestamp_ns: pid as i64 * 1_000,
                abi: "arm64-v8a".to_string(),
            })
            .collect();
    }

    pub fn fail_with(&self, error: Option<RemoteError>) {
        *self.fail_all.lock() = error;
    }

    pub fn ranges_of(&self, call: &str) -> Vec<FetchRange> {
        self.ranges
            .lock()
            .iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, r)| *r)
            .collect()
    }

    fn check(&self) -> RemoteResult<()> {
        match self.fail_all.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record(&self, call: &'static str, range: FetchRange) -> RemoteResult<()> {
        self.check()?;
        self.ranges.lock().push((call, range));
        Ok(())
    }
}

impl AgentService for FakeAgent {
    fn list_devices(&self) -> RemoteResult<Vec<Device>> {
        self.check()?;
        Ok(self.devices.lock().clone())
    }

    fn list_processes(&self, _device: &DeviceId) -> RemoteResult<Vec<ProcessInfo>> {
        self.check()?;
        Ok(self.processes.lock().clone())
    }

    fn get_attach_status(&self, _device: &DeviceId, pid: i32) -> RemoteResult<AttachState> {
        self.check()?;
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .attach
            .lock()
            .get(&pid)
            .copied()
            .unwrap_or(AttachState::Attached))
    }

    fn fetch_cpu(&self, _process: &ProcessKey, range: FetchRange) -> RemoteResult<CpuData> {
        self.record("cpu", range)?;
        next(&self.cpu)
    }

    fn fetch_memory(&self, _process: &ProcessKey, range: FetchRange) -> RemoteResult<MemoryData> {
        self.record("memory", range)?;
        next(&self.memory)
    }

    fn fetch_live_allocations(
        &self,
        _process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<LiveAllocationBatch>> {
        self.record("live", range)?;
        next(&self.live)
    }

    fn fetch_allocation_contexts(
        &self,
        _process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<AllocationContexts> {
        self.record("contexts", range)?;
        Ok(self.contexts.lock().clone())
    }

    fn fetch_dump(
        &self,
        _process: &ProcessKey,
        _kind: DumpKind,
        _start_timestamp_ns: i64,
    ) -> RemoteResult<DumpResponse> {
        self.check()?;
        self.dumps.lock().pop_front().unwrap_or_else(|| {
            Ok(DumpResponse {
                status: DumpStatus::Success,
                data: b"dump".to_vec(),
            })
        })
    }

    fn fetch_network(&self, _process: &ProcessKey, range: FetchRange) -> RemoteResult<NetworkData> {
        self.record("network", range)?;
        next(&self.network)
    }

    fn fetch_http_range(
        &self,
        _process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<HttpConnection>> {
        self.record("http", range)?;
        next(&self.http)
    }

    fn fetch_detail(
        &self,
        _process: &ProcessKey,
        connection_id: i64,
        kind: DetailKind,
    ) -> RemoteResult<HttpDetail> {
        self.check()?;
        self.detail_calls.lock().push((connection_id, kind));
        Ok(HttpDetail {
            connection_id,
            kind,
            content: serde_json::json!({ "kind": kind.as_str() }),
            timestamp_ns: 0,
        })
    }

    fn fetch_events(&self, _process: &ProcessKey, range: FetchRange) -> RemoteResult<EventData> {
        self.record("events", range)?;
        next(&self.events)
    }

    fn fetch_energy(&self, _process: &ProcessKey, range: FetchRange) -> RemoteResult<EnergyData> {
        self.record("energy", range)?;
        next(&self.energy)
    }

    fn fetch_event_stream(
        &self,
        _device: &DeviceId,
        range: FetchRange,
    ) -> RemoteResult<Vec<StreamEvent>> {
        self.record("stream", range)?;
        next(&self.stream)
    }
}

/// Hands out the same fake agent for every connection.
pub struct FakeTransport {
    pub agent: Arc<FakeAgent>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub refuse: AtomicBool,
}

impl FakeTransport {
    pub fn new(agent: Arc<FakeAgent>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        device: &DeviceId,
        _local_port: u16,
    ) -> Result<Arc<dyn AgentService>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Forward {
                device: device.to_string(),
                reason: "refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.agent) as Arc<dyn AgentService>)
    }

    fn disconnect(&self, _device: &DeviceId, _local_port: u16) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory SQLite that records every upsert.
pub struct CountingStore {
    pub inner: SqliteStore,
    pub upserts: Mutex<Vec<(EntityKind, String)>>,
    fail_next: Mutex<Option<EntityKind>>,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            upserts: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        })
    }

    /// The next write of `kind` fails with a transient error.
    pub fn fail_next(&self, kind: EntityKind) {
        *self.fail_next.lock() = Some(kind);
    }

    pub fn upserts_of(&self, kind: EntityKind) -> usize {
        self.upserts.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    /// Position of the first upsert of `kind`.
    pub fn first_upsert(&self, kind: EntityKind) -> Option<usize> {
        self.upserts.lock().iter().position(|(k, _)| *k == kind)
    }
}

impl Storage for CountingStore {
    fn upsert(&self, kind: EntityKind, key: &RecordKey, value: &Value) -> StorageResult<()> {
        {
            let mut fail = self.fail_next.lock();
            if *fail == Some(kind) {
                *fail = None;
                let err = serde_json::from_str::<Value>("{").unwrap_err();
                return Err(StorageError::Serialization(err));
            }
        }
        self.inner.upsert(kind, key, value)?;
        self.upserts.lock().push((kind, key.id.clone()));
        Ok(())
    }

    fn query(&self, kind: EntityKind, target: &str, id: &str) -> StorageResult<Option<Value>> {
        self.inner.query(kind, target, id)
    }

    fn query_range(
        &self,
        kind: EntityKind,
        target: &str,
        from: i64,
        to: i64,
    ) -> StorageResult<Vec<Value>> {
        self.inner.query_range(kind, target, from, to)
    }
}

/// Reads see nothing, writes report the store as unusable.
pub struct FailingStore;

impl Storage for FailingStore {
    fn upsert(&self, _kind: EntityKind, _key: &RecordKey, _value: &Value) -> StorageResult<()> {
        Err(StorageError::Unusable("disk gone".to_string()))
    }

    fn query(&self, _kind: EntityKind, _target: &str, _id: &str) -> StorageResult<Option<Value>> {
        Ok(None)
    }

    fn query_range(
        &self,
        _kind: EntityKind,
        _target: &str,
        _from: i64,
        _to: i64,
    ) -> StorageResult<Vec<Value>> {
        Ok(Vec::new())
    }
}

pub fn device(id: &str, api_level: u32) -> Device {
    Device {
        id: DeviceId::new(id),
        model: "Pixel".to_string(),
        manufacturer: "Google".to_string(),
        api_level,
        state: DeviceState::Online,
        last_seen: None,
    }
}

pub fn process_key(pid: i32) -> ProcessKey {
    ProcessKey::new(DeviceId::new("emulator-5554"), StreamId::generate(), pid)
}

pub fn context(
    agent: Arc<FakeAgent>,
    storage: Arc<dyn Storage>,
) -> (PollerContext, LifecycleReceiver) {
    let (events, receiver) = lifecycle::channel();
    let ctx = PollerContext {
        process: process_key(42),
        client: agent,
        storage,
        events,
    };
    (ctx, receiver)
}
