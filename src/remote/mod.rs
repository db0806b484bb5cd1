//! Remote agent service contract. Calls are blocking round-trips; pollers issue them from
//! their own thread of control.

mod http;

pub use http::HttpAgentClient;

use crate::error::RemoteResult;
use crate::model::cpu::CpuData;
use crate::model::energy::EnergyData;
use crate::model::event::EventData;
use crate::model::memory::{
    AllocationContexts, DumpKind, DumpResponse, LiveAllocationBatch, MemoryData,
};
use crate::model::network::{DetailKind, HttpConnection, HttpDetail, NetworkData};
use crate::model::stream::StreamEvent;
use crate::model::{AttachState, Device, DeviceId, FetchRange, ProcessInfo, ProcessKey};

pub trait AgentService: Send + Sync {
    fn list_devices(&self) -> RemoteResult<Vec<Device>>;

    fn list_processes(&self, device: &DeviceId) -> RemoteResult<Vec<ProcessInfo>>;

    fn get_attach_status(&self, device: &DeviceId, pid: i32) -> RemoteResult<AttachState>;

    fn fetch_cpu(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<CpuData>;

    fn fetch_memory(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<MemoryData>;

    fn fetch_live_allocations(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<LiveAllocationBatch>>;

    fn fetch_allocation_contexts(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<AllocationContexts>;

    fn fetch_dump(
        &self,
        process: &ProcessKey,
        kind: DumpKind,
        start_timestamp_ns: i64,
    ) -> RemoteResult<DumpResponse>;

    fn fetch_network(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<NetworkData>;

    /// Connections overlapping `range`: still open, or ended at or after `range.start_ns`.
    fn fetch_http_range(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<HttpConnection>>;

    fn fetch_detail(
        &self,
        process: &ProcessKey,
        connection_id: i64,
        kind: DetailKind,
    ) -> RemoteResult<HttpDetail>;

    fn fetch_events(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<EventData>;

    fn fetch_energy(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<EnergyData>;

    fn fetch_event_stream(
        &self,
        device: &DeviceId,
        range: FetchRange,
    ) -> RemoteResult<Vec<StreamEvent>>;
}
