//! Supervisor: owns connections and every poll runner, and reacts to lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::connection::{ConnectionManager, ConnectionRegistry, DeviceConnection, Transport};
use crate::error::{PipelineError, PollError, StorageError, TransportError};
use crate::lifecycle::{self, LifecycleEvent, LifecycleReceiver, LifecycleSender};
use crate::model::{AttachState, Device, DeviceId, ProcessKey, StreamTarget, DEVICES_TARGET};
use crate::pollers::{
    build_domain_pollers, EventStreamPoller, PayloadExecutor, PollerContext, TokioPayloadExecutor,
};
use crate::runner::{Escalation, Poll, PollRunner};
use crate::storage::{Storage, StorageExt};
use crate::tracker::DeviceProcessTracker;

pub struct Pipeline {
    config: AgentConfig,
    storage: Arc<dyn Storage>,
    handle: Handle,
    connections: Arc<ConnectionManager>,
    tracker: Arc<DeviceProcessTracker>,
    tracker_runner: Option<PollRunner>,
    executor: Arc<TokioPayloadExecutor>,
    events: LifecycleSender,
    receiver: Option<LifecycleReceiver>,
    stream_runners: HashMap<DeviceId, PollRunner>,
    process_runners: HashMap<ProcessKey, Vec<PollRunner>>,
}

impl Pipeline {
    pub fn new(
        config: AgentConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        handle: Handle,
    ) -> Self {
        let (events, receiver) = lifecycle::channel();
        let connections = Arc::new(ConnectionManager::new(
            transport,
            config.polling.max_consecutive_failures,
        ));
        let tracker = Arc::new(DeviceProcessTracker::new(
            connections.registry(),
            Arc::clone(&storage),
            events.clone(),
        ));
        let executor = Arc::new(TokioPayloadExecutor::new(
            handle.clone(),
            config.payload.workers,
        ));
        Self {
            config,
            storage,
            handle,
            connections,
            tracker,
            tracker_runner: None,
            executor,
            events,
            receiver: Some(receiver),
            stream_runners: HashMap::new(),
            process_runners: HashMap::new(),
        }
    }

    pub fn sender(&self) -> LifecycleSender {
        self.events.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.connections.registry()
    }

    pub fn tracker(&self) -> Arc<DeviceProcessTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn monitored_processes(&self) -> Vec<ProcessKey> {
        let mut keys: Vec<_> = self.process_runners.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_streaming(&self, device: &DeviceId) -> bool {
        self.stream_runners.contains_key(device)
    }

    /// Start discovery. Called by [`Pipeline::run`]; idempotent.
    pub fn start(&mut self) {
        if self.tracker_runner.is_some() {
            return;
        }
        let events = self.events.clone();
        let escalation: Escalation = Arc::new(move |e: &PollError| {
            if let PollError::Storage(s) = e {
                events.storage_failed(s.to_string());
            }
        });
        self.tracker_runner = Some(PollRunner::start(
            &self.handle,
            Arc::clone(&self.tracker) as Arc<dyn Poll>,
            self.config.polling.discovery_period(),
            escalation,
        ));
        info!("device discovery started");
    }

    /// Connect a device and start its event stream. Connecting a connected device is a no-op.
    pub async fn connect_device(&mut self, device: &DeviceId) -> Result<(), PipelineError> {
        let manager = Arc::clone(&self.connections);
        let id = device.clone();
        let conn = tokio::task::spawn_blocking(move || manager.connect(&id))
            .await
            .map_err(|e| TransportError::Client(e.to_string()))??;
        self.start_stream(&conn);
        Ok(())
    }

    fn start_stream(&mut self, conn: &DeviceConnection) {
        if !self.config.domains.event_stream || self.stream_runners.contains_key(&conn.device_id) {
            return;
        }
        let poller = EventStreamPoller::new(conn.target(), conn.client(), Arc::clone(&self.storage));
        let runner = PollRunner::start(
            &self.handle,
            Arc::new(poller),
            self.config.polling.stream_period(),
            self.escalation(conn.target()),
        );
        self.stream_runners.insert(conn.device_id.clone(), runner);
    }

    /// Start the enabled domain pollers for a process. Returns false if it was already monitored
    /// or belongs to a connection that no longer exists.
    pub fn monitor_process(
        &mut self,
        process: &ProcessKey,
        attach: AttachState,
    ) -> Result<bool, PipelineError> {
        if self.process_runners.contains_key(process) {
            return Ok(false);
        }
        let conn = match self.connections.registry().get(&process.device_id) {
            Some(conn) if conn.stream_id == process.stream_id => conn,
            _ => {
                debug!(process = %process, "not monitoring process of a stale connection");
                return Ok(false);
            }
        };

        let api_level = self
            .storage
            .get::<Device>(DEVICES_TARGET, process.device_id.as_str())?
            .map(|d| d.api_level)
            .unwrap_or(0);
        let ctx = PollerContext {
            process: process.clone(),
            client: conn.client(),
            storage: Arc::clone(&self.storage),
            events: self.events.clone(),
        };
        let executor = Arc::clone(&self.executor) as Arc<dyn PayloadExecutor>;
        let runners: Vec<PollRunner> =
            build_domain_pollers(&ctx, &self.config, api_level, attach, executor)
                .into_iter()
                .map(|p| {
                    PollRunner::start(
                        &self.handle,
                        p.poller,
                        p.period,
                        self.escalation(conn.target()),
                    )
                })
                .collect();
        info!(process = %process, pollers = runners.len(), "monitoring process");
        self.process_runners.insert(process.clone(), runners);
        Ok(true)
    }

    /// Stop a process's pollers; pending recording sessions are finalized as they stop.
    pub async fn stop_monitoring(&mut self, process: &ProcessKey) -> bool {
        match self.process_runners.remove(process) {
            Some(runners) => {
                for runner in runners {
                    runner.stop().await;
                }
                info!(process = %process, "stopped monitoring process");
                true
            }
            None => false,
        }
    }

    /// Process lifecycle events until `shutdown` is cancelled or storage fails.
    /// Call [`Pipeline::shutdown`] afterwards in both cases.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let Some(mut receiver) = self.receiver.take() else {
            return Ok(());
        };
        self.start();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                event = receiver.recv() => {
                    let Some(event) = event else { break Ok(()) };
                    if let Err(e) = self.handle_event(event).await {
                        break Err(e);
                    }
                }
            }
        };
        self.receiver = Some(receiver);
        result
    }

    pub async fn handle_event(&mut self, event: LifecycleEvent) -> Result<(), PipelineError> {
        match event {
            LifecycleEvent::ProcessStarted {
                process,
                name,
                attach,
            } => {
                let domains = &self.config.domains;
                let wanted = domains.auto_monitor
                    && (attach == AttachState::Attached || domains.monitor_processes.contains(&name));
                if wanted {
                    self.monitor_process(&process, attach)?;
                }
            }
            LifecycleEvent::ProcessDied { process } => {
                self.stop_monitoring(&process).await;
            }
            LifecycleEvent::DeviceLost {
                device_id,
                stream_id,
                reason,
            } => {
                let lost = StreamTarget {
                    device_id,
                    stream_id,
                };
                self.device_lost(&lost, &reason).await?;
            }
            LifecycleEvent::ReconnectRequested { device_id } => {
                if let Err(e) = self.connect_device(&device_id).await {
                    warn!(device_id = %device_id, error = %e, "reconnect failed");
                    self.schedule_reconnect(&device_id);
                }
            }
            LifecycleEvent::StorageFailed { error } => {
                error!(%error, "storage unusable; stopping pipeline");
                return Err(PipelineError::StorageFailed(error));
            }
        }
        Ok(())
    }

    /// Tears down the lost connection. Reports about a connection that was already replaced
    /// by a reconnect leave the current one alone.
    async fn device_lost(&mut self, lost: &StreamTarget, reason: &str) -> Result<(), PipelineError> {
        let device_id = &lost.device_id;
        let conn = match self.connections.registry().get(device_id) {
            Some(current) if current.stream_id != lost.stream_id => {
                debug!(connection = %lost, current = %current.stream_id, "stale loss report ignored");
                return Ok(());
            }
            current => current,
        };
        let processes: Vec<ProcessKey> = self
            .process_runners
            .keys()
            .filter(|k| &k.device_id == device_id && k.stream_id == lost.stream_id)
            .cloned()
            .collect();
        let stream = if conn.is_some() {
            self.stream_runners.remove(device_id)
        } else {
            None
        };
        if conn.is_none() && processes.is_empty() {
            debug!(connection = %lost, "device loss already handled");
            return Ok(());
        }
        warn!(connection = %lost, %reason, "device lost; tearing down");

        if let Some(conn) = &conn {
            conn.proxy().close();
        }
        for process in &processes {
            self.stop_monitoring(process).await;
        }
        if let Some(runner) = stream {
            runner.stop().await;
        }

        if conn.is_some() {
            let manager = Arc::clone(&self.connections);
            let id = device_id.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || manager.disconnect(&id)).await {
                error!(device_id = %device_id, error = %e, "disconnect panicked");
            }
        }
        if let Err(e) = self.tracker.mark_device_lost(lost) {
            storage_error(e)?;
        }

        if self.config.devices.iter().any(|d| d == device_id.as_str()) {
            self.schedule_reconnect(device_id);
        }
        Ok(())
    }

    /// Send `ReconnectRequested` for the device after the configured delay.
    pub fn schedule_reconnect(&self, device_id: &DeviceId) {
        let events = self.events.clone();
        let delay = self.config.polling.reconnect_delay();
        let device_id = device_id.clone();
        debug!(device_id = %device_id, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            events.send(LifecycleEvent::ReconnectRequested { device_id });
        });
    }

    fn escalation(&self, connection: StreamTarget) -> Escalation {
        let events = self.events.clone();
        Arc::new(move |e: &PollError| match e {
            PollError::Storage(s) => events.storage_failed(s.to_string()),
            PollError::Remote(r) => events.device_lost(&connection, r.to_string()),
        })
    }

    /// Stop every runner (pollers finalize pending sessions), drain payload jobs and
    /// disconnect all devices. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(runner) = self.tracker_runner.take() {
            runner.stop().await;
        }
        let processes: Vec<ProcessKey> = self.process_runners.keys().cloned().collect();
        for process in &processes {
            self.stop_monitoring(process).await;
        }
        for (_, runner) in self.stream_runners.drain() {
            runner.stop().await;
        }
        self.executor.drain().await;

        let manager = Arc::clone(&self.connections);
        match tokio::task::spawn_blocking(move || manager.disconnect_all()).await {
            Ok(closed) => info!(devices = closed.len(), "pipeline shut down"),
            Err(e) => error!(error = %e, "disconnect panicked"),
        }
    }
}

/// Unusable storage stops the pipeline; other storage errors are only logged.
fn storage_error(e: StorageError) -> Result<(), PipelineError> {
    if e.is_unusable() {
        error!(error = %e, "storage unusable");
        return Err(PipelineError::StorageFailed(e.to_string()));
    }
    warn!(error = %e, "storage write failed");
    Ok(())
}
