//! JSON-over-HTTP client for the device agent, reached through the forwarded local port.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::AgentService;
use crate::config::TransportConfig;
use crate::error::{RemoteError, RemoteResult, TransportError};
use crate::model::cpu::CpuData;
use crate::model::energy::EnergyData;
use crate::model::event::EventData;
use crate::model::memory::{
    AllocationContexts, DumpKind, DumpResponse, LiveAllocationBatch, MemoryData,
};
use crate::model::network::{DetailKind, HttpConnection, HttpDetail, NetworkData};
use crate::model::stream::StreamEvent;
use crate::model::{AttachState, Device, DeviceId, FetchRange, ProcessInfo, ProcessKey};

#[derive(Serialize)]
struct ProcessRequest<'a> {
    device_id: &'a str,
    pid: i32,
}

#[derive(Serialize)]
struct RangeRequest<'a> {
    device_id: &'a str,
    pid: i32,
    start_ns: i64,
    end_ns: i64,
}

impl<'a> RangeRequest<'a> {
    fn new(process: &'a ProcessKey, range: FetchRange) -> Self {
        Self {
            device_id: process.device_id.as_str(),
            pid: process.pid,
            start_ns: range.start_ns,
            end_ns: range.end_ns,
        }
    }
}

#[derive(Serialize)]
struct DumpRequest<'a> {
    device_id: &'a str,
    pid: i32,
    kind: DumpKind,
    start_ns: i64,
}

#[derive(Serialize)]
struct DetailRequest<'a> {
    device_id: &'a str,
    pid: i32,
    connection_id: i64,
    kind: DetailKind,
}

#[derive(Serialize)]
struct DeviceRequest<'a> {
    device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_ns: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_ns: Option<i64>,
}

pub struct HttpAgentClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpAgentClient {
    pub fn new(host: &str, port: u16, config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, port),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn call<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> RemoteResult<R> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "agent call");
        let res = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| RemoteError::transient(e.to_string()))?;
        let status = res.status();
        if status == reqwest::StatusCode::GONE {
            return Err(RemoteError::disconnected(format!("{} {}", path, status)));
        }
        if !status.is_success() {
            let text = res.text().unwrap_or_default();
            return Err(RemoteError::transient(format!("{} {} {}", path, status, text)));
        }
        res.json::<R>()
            .map_err(|e| RemoteError::transient(format!("{}: {}", path, e)))
    }
}

impl AgentService for HttpAgentClient {
    fn list_devices(&self) -> RemoteResult<Vec<Device>> {
        self.call("/v1/devices", &serde_json::json!({}))
    }

    fn list_processes(&self, device: &DeviceId) -> RemoteResult<Vec<ProcessInfo>> {
        let req = DeviceRequest {
            device_id: device.as_str(),
            start_ns: None,
            end_ns: None,
        };
        self.call("/v1/processes", &req)
    }

    fn get_attach_status(&self, device: &DeviceId, pid: i32) -> RemoteResult<AttachState> {
        let req = ProcessRequest {
            device_id: device.as_str(),
            pid,
        };
        self.call("/v1/agent/status", &req)
    }

    fn fetch_cpu(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<CpuData> {
        self.call("/v1/cpu/data", &RangeRequest::new(process, range))
    }

    fn fetch_memory(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<MemoryData> {
        self.call("/v1/memory/data", &RangeRequest::new(process, range))
    }

    fn fetch_live_allocations(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<LiveAllocationBatch>> {
        self.call("/v1/memory/allocations/live", &RangeRequest::new(process, range))
    }

    fn fetch_allocation_contexts(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<AllocationContexts> {
        self.call("/v1/memory/allocations/contexts", &RangeRequest::new(process, range))
    }

    fn fetch_dump(
        &self,
        process: &ProcessKey,
        kind: DumpKind,
        start_timestamp_ns: i64,
    ) -> RemoteResult<DumpResponse> {
        let req = DumpRequest {
            device_id: process.device_id.as_str(),
            pid: process.pid,
            kind,
            start_ns: start_timestamp_ns,
        };
        self.call("/v1/memory/dump", &req)
    }

    fn fetch_network(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<NetworkData> {
        self.call("/v1/network/data", &RangeRequest::new(process, range))
    }

    fn fetch_http_range(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<HttpConnection>> {
        self.call("/v1/network/http", &RangeRequest::new(process, range))
    }

    fn fetch_detail(
        &self,
        process: &ProcessKey,
        connection_id: i64,
        kind: DetailKind,
    ) -> RemoteResult<HttpDetail> {
        let req = DetailRequest {
            device_id: process.device_id.as_str(),
            pid: process.pid,
            connection_id,
            kind,
        };
        self.call("/v1/network/http/detail", &req)
    }

    fn fetch_events(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<EventData> {
        self.call("/v1/events/data", &RangeRequest::new(process, range))
    }

    fn fetch_energy(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<EnergyData> {
        self.call("/v1/energy/data", &RangeRequest::new(process, range))
    }

    fn fetch_event_stream(
        &self,
        device: &DeviceId,
        range: FetchRange,
    ) -> RemoteResult<Vec<StreamEvent>> {
        let req = DeviceRequest {
            device_id: device.as_str(),
            start_ns: Some(range.start_ns),
            end_ns: Some(range.end_ns),
        };
        self.call("/v1/events/stream", &req)
    }
}
