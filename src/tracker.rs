//! Device and process discovery with set-difference death detection.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionRegistry, DeviceConnection};
use crate::error::{PollError, RemoteError, StorageResult};
use crate::lifecycle::{LifecycleEvent, LifecycleSender};
use crate::model::{
    AgentAttachRecord, AttachState, Device, DeviceId, DeviceState, Process, ProcessInfo,
    ProcessKey, ProcessState, StreamTarget, DEVICES_TARGET,
};
use crate::remote::AgentService;
use crate::runner::Poll;
use crate::storage::{Storage, StorageExt};

pub type LiveSet = BTreeSet<ProcessKey>;

/// Processes present in `prev` but absent from `cur`.
pub fn dead_processes(prev: &LiveSet, cur: &LiveSet) -> LiveSet {
    prev.difference(cur).cloned().collect()
}

pub struct DeviceProcessTracker {
    registry: Arc<ConnectionRegistry>,
    storage: Arc<dyn Storage>,
    events: LifecycleSender,
    live: Mutex<HashMap<StreamTarget, LiveSet>>,
}

impl DeviceProcessTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        storage: Arc<dyn Storage>,
        events: LifecycleSender,
    ) -> Self {
        Self {
            registry,
            storage,
            events,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Last known live set of a device across its connections (empty if never seen or lost).
    pub fn live_processes(&self, device: &DeviceId) -> LiveSet {
        self.live
            .lock()
            .iter()
            .filter(|(conn, _)| &conn.device_id == device)
            .flat_map(|(_, set)| set.iter().cloned())
            .collect()
    }

    /// Total loss of one connection: every process known live on it becomes DEAD, and the
    /// device DISCONNECTED unless a newer connection to it is registered. A process is
    /// forgotten only once it is stored DEAD, so a failed write is retried by the next call.
    pub fn mark_device_lost(&self, connection: &StreamTarget) -> StorageResult<()> {
        let prev = self.live.lock().get(connection).cloned().unwrap_or_default();
        let dead = dead_processes(&prev, &LiveSet::new());
        for key in &dead {
            self.mark_dead(key)?;
            if let Some(set) = self.live.lock().get_mut(connection) {
                set.remove(key);
            }
        }
        self.live.lock().remove(connection);

        let device_id = &connection.device_id;
        let superseded = self
            .registry
            .get(device_id)
            .is_some_and(|current| current.stream_id != connection.stream_id);
        if superseded {
            debug!(connection = %connection, dead = dead.len(), "lost connection already replaced");
            return Ok(());
        }

        let mut device = self
            .storage
            .get::<Device>(DEVICES_TARGET, device_id.as_str())?
            .unwrap_or_else(|| Device {
                id: device_id.clone(),
                model: String::new(),
                manufacturer: String::new(),
                api_level: 0,
                state: DeviceState::Disconnected,
                last_seen: None,
            });
        device.state = DeviceState::Disconnected;
        self.storage.put(DEVICES_TARGET, &device)?;
        warn!(device_id = %device_id, dead = dead.len(), "device marked disconnected");
        Ok(())
    }

    fn poll_connection(&self, conn: &DeviceConnection) -> Result<(), PollError> {
        let client = conn.client();
        let devices = client.list_devices()?;
        for mut device in devices.into_iter().filter(|d| d.id == conn.device_id) {
            device.state = DeviceState::Online;
            device.last_seen = Some(Utc::now());
            self.storage.put(DEVICES_TARGET, &device)?;

            let processes = client.list_processes(&device.id)?;
            let target = conn.target();
            let prev = self.live.lock().entry(target.clone()).or_default().clone();

            let mut cur = LiveSet::new();
            for info in &processes {
                let key = ProcessKey::new(device.id.clone(), conn.stream_id, info.pid);
                if self.record_alive(client.as_ref(), &key, info, prev.contains(&key))? {
                    cur.insert(key);
                }
            }

            let dead = dead_processes(&prev, &cur);
            for key in &dead {
                self.mark_dead(key)?;
            }
            debug!(
                device_id = %device.id,
                alive = cur.len(),
                dead = dead.len(),
                "process scan complete"
            );
            self.live.lock().insert(target, cur);
        }
        Ok(())
    }

    /// Upserts the process as ALIVE. Returns false for a process already stored DEAD.
    fn record_alive(
        &self,
        client: &dyn AgentService,
        key: &ProcessKey,
        info: &ProcessInfo,
        known: bool,
    ) -> Result<bool, PollError> {
        let target = key.device_id.as_str();
        if let Some(stored) = self.storage.get::<Process>(target, &key.local_id())? {
            if stored.state == ProcessState::Dead {
                debug!(process = %key, "ignoring listing of dead process");
                return Ok(false);
            }
        }
        self.storage.put(target, &Process::alive(key.clone(), info))?;

        let attach = self.attach_state(client, key)?;
        if !known {
            info!(process = %key, name = %info.name, ?attach, "process started");
            self.events.send(LifecycleEvent::ProcessStarted {
                process: key.clone(),
                name: info.name.clone(),
                attach,
            });
        }
        Ok(true)
    }

    /// Cached attach state; the remote is asked only while it is unspecified.
    fn attach_state(
        &self,
        client: &dyn AgentService,
        key: &ProcessKey,
    ) -> Result<AttachState, PollError> {
        let target = key.device_id.as_str();
        let cached = self
            .storage
            .get::<AgentAttachRecord>(target, &key.local_id())?
            .map(|r| r.state)
            .unwrap_or_default();
        if cached != AttachState::Unspecified {
            return Ok(cached);
        }

        match client.get_attach_status(&key.device_id, key.pid) {
            Ok(state) => {
                self.storage.put(
                    target,
                    &AgentAttachRecord {
                        key: key.clone(),
                        state,
                    },
                )?;
                Ok(state)
            }
            Err(RemoteError::Transient(msg)) => {
                warn!(process = %key, error = %msg, "attach status check failed");
                Ok(AttachState::Unspecified)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_dead(&self, key: &ProcessKey) -> StorageResult<()> {
        let target = key.device_id.as_str();
        let mut process = self
            .storage
            .get::<Process>(target, &key.local_id())?
            .unwrap_or_else(|| Process {
                key: key.clone(),
                name: String::new(),
                start_timestamp_ns: 0,
                abi: String::new(),
                state: ProcessState::Dead,
            });
        process.state = ProcessState::Dead;
        self.storage.put(target, &process)?;
        self.storage.put(
            target,
            &AgentAttachRecord {
                key: key.clone(),
                state: AttachState::Unattachable,
            },
        )?;
        info!(process = %key, "process died");
        self.events.send(LifecycleEvent::ProcessDied {
            process: key.clone(),
        });
        Ok(())
    }
}

impl Poll for DeviceProcessTracker {
    fn name(&self) -> String {
        "device-process-tracker".to_string()
    }

    fn poll(&self) -> Result<(), PollError> {
        for conn in self.registry.connections() {
            match self.poll_connection(&conn) {
                Ok(()) => {}
                Err(PollError::Remote(RemoteError::Disconnected(reason))) => {
                    warn!(device_id = %conn.device_id, %reason, "device lost during discovery");
                    let target = conn.target();
                    self.mark_device_lost(&target)?;
                    self.events.device_lost(&target, reason);
                }
                Err(e) if e.is_transient() => {
                    warn!(device_id = %conn.device_id, error = %e, "discovery failed for device");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
