//! Device connections: local endpoint allocation, port forwarding, the per-device proxy and
//! the registry other components look clients up in.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

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
use crate::model::{
    AttachState, Device, DeviceId, FetchRange, ProcessInfo, ProcessKey, StreamId, StreamTarget,
};
use crate::remote::{AgentService, HttpAgentClient};

/// Establishes and tears down the forwarding path to a device's agent.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        device: &DeviceId,
        local_port: u16,
    ) -> Result<Arc<dyn AgentService>, TransportError>;

    fn disconnect(&self, device: &DeviceId, local_port: u16);
}

/// Forwards a local TCP port to the agent socket with an external program (adb-style) and
/// talks JSON over HTTP through it.
pub struct ForwardingTransport {
    config: TransportConfig,
}

impl ForwardingTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    fn expand(&self, args: &[String], device: &DeviceId, port: u16) -> Vec<String> {
        args.iter()
            .map(|a| {
                a.replace("{device}", device.as_str())
                    .replace("{port}", &port.to_string())
                    .replace("{socket}", &self.config.device_socket)
            })
            .collect()
    }

    fn run(&self, args: &[String], device: &DeviceId, port: u16) -> Result<(), TransportError> {
        if self.config.forward_program.is_empty() {
            return Ok(());
        }
        let args = self.expand(args, device, port);
        debug!(program = %self.config.forward_program, ?args, "running forward command");
        let output = Command::new(&self.config.forward_program)
            .args(&args)
            .output()
            .map_err(|e| TransportError::Forward {
                device: device.to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(TransportError::Forward {
                device: device.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Transport for ForwardingTransport {
    fn connect(
        &self,
        device: &DeviceId,
        local_port: u16,
    ) -> Result<Arc<dyn AgentService>, TransportError> {
        self.run(&self.config.forward_args, device, local_port)?;
        info!(device_id = %device, local_port, "port forwarding created");
        let client = HttpAgentClient::new(&self.config.host, local_port, &self.config)?;
        Ok(Arc::new(client))
    }

    fn disconnect(&self, device: &DeviceId, local_port: u16) {
        if let Err(e) = self.run(&self.config.remove_args, device, local_port) {
            warn!(device_id = %device, local_port, error = %e, "removing port forward failed");
        }
    }
}

/// Bind an ephemeral loopback port and release it for the forward to claim.
pub fn allocate_local_port() -> Result<u16, TransportError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(TransportError::NoLocalPort)?;
    let port = listener
        .local_addr()
        .map_err(TransportError::NoLocalPort)?
        .port();
    Ok(port)
}

/// Client wrapper shared by every poller of one device. Counts consecutive transient
/// failures; the call that reaches the threshold is reported as a disconnect.
pub struct DeviceProxy {
    device_id: DeviceId,
    inner: Arc<dyn AgentService>,
    failures: AtomicU32,
    threshold: u32,
    closed: AtomicBool,
}

impl DeviceProxy {
    pub fn new(device_id: DeviceId, inner: Arc<dyn AgentService>, threshold: u32) -> Self {
        Self {
            device_id,
            inner,
            failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn call<T>(&self, f: impl FnOnce(&dyn AgentService) -> RemoteResult<T>) -> RemoteResult<T> {
        if self.is_closed() {
            return Err(RemoteError::disconnected(format!(
                "connection to {} closed",
                self.device_id
            )));
        }
        match f(self.inner.as_ref()) {
            Ok(v) => {
                self.failures.store(0, Ordering::SeqCst);
                Ok(v)
            }
            Err(RemoteError::Transient(msg)) => {
                let n = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= self.threshold {
                    Err(RemoteError::disconnected(format!(
                        "{} consecutive failures on {}, last: {}",
                        n, self.device_id, msg
                    )))
                } else {
                    Err(RemoteError::Transient(msg))
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl AgentService for DeviceProxy {
    fn list_devices(&self) -> RemoteResult<Vec<Device>> {
        self.call(|c| c.list_devices())
    }

    fn list_processes(&self, device: &DeviceId) -> RemoteResult<Vec<ProcessInfo>> {
        self.call(|c| c.list_processes(device))
    }

    fn get_attach_status(&self, device: &DeviceId, pid: i32) -> RemoteResult<AttachState> {
        self.call(|c| c.get_attach_status(device, pid))
    }

    fn fetch_cpu(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<CpuData> {
        self.call(|c| c.fetch_cpu(process, range))
    }

    fn fetch_memory(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<MemoryData> {
        self.call(|c| c.fetch_memory(process, range))
    }

    fn fetch_live_allocations(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<LiveAllocationBatch>> {
        self.call(|c| c.fetch_live_allocations(process, range))
    }

    fn fetch_allocation_contexts(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<AllocationContexts> {
        self.call(|c| c.fetch_allocation_contexts(process, range))
    }

    fn fetch_dump(
        &self,
        process: &ProcessKey,
        kind: DumpKind,
        start_timestamp_ns: i64,
    ) -> RemoteResult<DumpResponse> {
        self.call(|c| c.fetch_dump(process, kind, start_timestamp_ns))
    }

    fn fetch_network(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<NetworkData> {
        self.call(|c| c.fetch_network(process, range))
    }

    fn fetch_http_range(
        &self,
        process: &ProcessKey,
        range: FetchRange,
    ) -> RemoteResult<Vec<HttpConnection>> {
        self.call(|c| c.fetch_http_range(process, range))
    }

    fn fetch_detail(
        &self,
        process: &ProcessKey,
        connection_id: i64,
        kind: DetailKind,
    ) -> RemoteResult<HttpDetail> {
        self.call(|c| c.fetch_detail(process, connection_id, kind))
    }

    fn fetch_events(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<EventData> {
        self.call(|c| c.fetch_events(process, range))
    }

    fn fetch_energy(&self, process: &ProcessKey, range: FetchRange) -> RemoteResult<EnergyData> {
        self.call(|c| c.fetch_energy(process, range))
    }

    fn fetch_event_stream(
        &self,
        device: &DeviceId,
        range: FetchRange,
    ) -> RemoteResult<Vec<StreamEvent>> {
        self.call(|c| c.fetch_event_stream(device, range))
    }
}

/// A live, registered connection to one device.
pub struct DeviceConnection {
    pub device_id: DeviceId,
    pub stream_id: StreamId,
    pub local_port: u16,
    proxy: Arc<DeviceProxy>,
}

impl DeviceConnection {
    pub fn client(&self) -> Arc<dyn AgentService> {
        Arc::clone(&self.proxy) as Arc<dyn AgentService>
    }

    pub fn proxy(&self) -> &DeviceProxy {
        &self.proxy
    }

    pub fn target(&self) -> StreamTarget {
        StreamTarget {
            device_id: self.device_id.clone(),
            stream_id: self.stream_id,
        }
    }

    pub fn process_key(&self, pid: i32) -> ProcessKey {
        ProcessKey::new(self.device_id.clone(), self.stream_id, pid)
    }
}

/// Registered connections by device. Read by the tracker and pollers, written by the manager.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<DeviceId, Arc<DeviceConnection>>>,
}

impl ConnectionRegistry {
    pub fn get(&self, device: &DeviceId) -> Option<Arc<DeviceConnection>> {
        self.connections.read().get(device).cloned()
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.connections.read().contains_key(device)
    }

    /// Snapshot ordered by device id.
    pub fn connections(&self) -> Vec<Arc<DeviceConnection>> {
        let mut all: Vec<_> = self.connections.read().values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    fn insert_if_absent(
        &self,
        conn: Arc<DeviceConnection>,
    ) -> Result<(), Arc<DeviceConnection>> {
        let mut map = self.connections.write();
        if let Some(existing) = map.get(&conn.device_id) {
            return Err(Arc::clone(existing));
        }
        map.insert(conn.device_id.clone(), conn);
        Ok(())
    }

    fn remove(&self, device: &DeviceId) -> Option<Arc<DeviceConnection>> {
        self.connections.write().remove(device)
    }
}

/// Owns device connections. Connecting a connected device and disconnecting a
/// disconnected one are no-ops.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    failure_threshold: u32,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, failure_threshold: u32) -> Self {
        Self {
            transport,
            registry: Arc::new(ConnectionRegistry::default()),
            failure_threshold,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Blocking: allocates a port and runs the forward.
    pub fn connect(&self, device: &DeviceId) -> Result<Arc<DeviceConnection>, TransportError> {
        if let Some(existing) = self.registry.get(device) {
            debug!(device_id = %device, "already connected");
            return Ok(existing);
        }

        let local_port = allocate_local_port()?;
        let client = self.transport.connect(device, local_port)?;
        let conn = Arc::new(DeviceConnection {
            device_id: device.clone(),
            stream_id: StreamId::generate(),
            local_port,
            proxy: Arc::new(DeviceProxy::new(
                device.clone(),
                client,
                self.failure_threshold,
            )),
        });

        match self.registry.insert_if_absent(Arc::clone(&conn)) {
            Ok(()) => {
                info!(
                    device_id = %device,
                    stream_id = %conn.stream_id,
                    local_port,
                    "device connected"
                );
                Ok(conn)
            }
            Err(existing) => {
                // Lost a race with a concurrent connect.
                self.transport.disconnect(device, local_port);
                Ok(existing)
            }
        }
    }

    /// Returns the removed connection, or `None` when the device was not connected.
    pub fn disconnect(&self, device: &DeviceId) -> Option<Arc<DeviceConnection>> {
        let conn = self.registry.remove(device)?;
        conn.proxy.close();
        self.transport.disconnect(device, conn.local_port);
        info!(device_id = %device, stream_id = %conn.stream_id, "device disconnected");
        Some(conn)
    }

    pub fn disconnect_all(&self) -> Vec<Arc<DeviceConnection>> {
        self.registry
            .connections()
            .into_iter()
            .filter_map(|c| self.disconnect(&c.device_id))
            .collect()
    }
}
