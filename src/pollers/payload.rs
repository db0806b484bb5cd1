//! Heavy payload retrieval, off the poll thread.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::PayloadConfig;
use crate::error::{RemoteError, StorageResult};
use crate::lifecycle::LifecycleSender;
use crate::model::memory::{DumpKind, DumpPayload, DumpResponse, DumpStatus};
use crate::model::{FetchRange, ProcessKey};
use crate::remote::AgentService;
use crate::storage::{Storage, StorageExt};

pub type PayloadJob = Box<dyn FnOnce() + Send + 'static>;

/// Runs payload jobs somewhere other than the calling poll cycle.
pub trait PayloadExecutor: Send + Sync {
    fn submit(&self, job: PayloadJob);
}

/// Runs each job on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl PayloadExecutor for InlineExecutor {
    fn submit(&self, job: PayloadJob) {
        job();
    }
}

/// Shared worker pool on the tokio blocking threads, bounded to `workers` concurrent jobs.
pub struct TokioPayloadExecutor {
    handle: Handle,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl TokioPayloadExecutor {
    pub fn new(handle: Handle, workers: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every submitted job, including ones submitted while draining.
    pub async fn drain(&self) {
        debug!(in_flight = self.in_flight(), "draining payload jobs");
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        debug!("payload jobs drained");
    }
}

impl PayloadExecutor for TokioPayloadExecutor {
    fn submit(&self, job: PayloadJob) {
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn_on(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    error!(error = %e, "payload job panicked");
                }
            },
            &self.handle,
        );
    }
}

/// One closed recording session whose payload must be retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRequest {
    pub process: ProcessKey,
    pub kind: DumpKind,
    pub start_timestamp_ns: i64,
    pub end_timestamp_ns: i64,
    /// Fetch class and stack metadata referenced by the payload.
    pub with_contexts: bool,
}

/// Fetches a payload and its metadata and persists them, metadata first.
pub struct PayloadFetcher {
    client: Arc<dyn AgentService>,
    storage: Arc<dyn Storage>,
    events: LifecycleSender,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl PayloadFetcher {
    pub fn new(
        client: Arc<dyn AgentService>,
        storage: Arc<dyn Storage>,
        events: LifecycleSender,
        config: &PayloadConfig,
    ) -> Self {
        Self {
            client,
            storage,
            events,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn run(&self, request: &PayloadRequest) {
        if let Err(e) = self.fetch_and_store(request) {
            error!(
                process = %request.process,
                kind = request.kind.as_str(),
                start = request.start_timestamp_ns,
                error = %e,
                "payload not stored"
            );
            if e.is_unusable() {
                self.events.storage_failed(e.to_string());
            }
        }
    }

    fn fetch_and_store(&self, request: &PayloadRequest) -> StorageResult<()> {
        let target = request.process.to_string();
        let payload = match self.fetch_dump(request) {
            Some(response) if response.status == DumpStatus::Success => {
                if request.with_contexts && !self.store_contexts(request, &target)? {
                    DumpPayload::placeholder(request.kind, request.start_timestamp_ns)
                } else {
                    DumpPayload {
                        kind: request.kind,
                        start_timestamp_ns: request.start_timestamp_ns,
                        status: DumpStatus::Success,
                        data: response.data,
                    }
                }
            }
            Some(response) if response.status == DumpStatus::NotFound => DumpPayload {
                status: DumpStatus::NotFound,
                ..DumpPayload::placeholder(request.kind, request.start_timestamp_ns)
            },
            _ => DumpPayload::placeholder(request.kind, request.start_timestamp_ns),
        };

        let bytes = payload.data.len();
        let status = payload.status;
        self.storage.put(&target, &payload)?;
        info!(
            process = %request.process,
            kind = request.kind.as_str(),
            start = request.start_timestamp_ns,
            ?status,
            bytes,
            "payload stored"
        );
        Ok(())
    }

    /// Retries while the remote reports the dump as not ready or a call fails transiently.
    fn fetch_dump(&self, request: &PayloadRequest) -> Option<DumpResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retry = attempt < self.retry_attempts;
            match self
                .client
                .fetch_dump(&request.process, request.kind, request.start_timestamp_ns)
            {
                Ok(response) if response.status == DumpStatus::NotReady && retry => {
                    debug!(process = %request.process, attempt, "payload not ready");
                }
                Ok(response) => return Some(response),
                Err(RemoteError::Transient(msg)) if retry => {
                    warn!(process = %request.process, attempt, error = %msg, "payload fetch failed");
                }
                Err(e) => {
                    warn!(process = %request.process, attempt, error = %e, "payload fetch abandoned");
                    return None;
                }
            }
            std::thread::sleep(self.retry_delay);
        }
    }

    /// Returns false when the metadata could not be fetched.
    fn store_contexts(&self, request: &PayloadRequest, target: &str) -> StorageResult<bool> {
        let range = FetchRange {
            start_ns: request.start_timestamp_ns,
            end_ns: request.end_timestamp_ns,
        };
        let contexts = match self.client.fetch_allocation_contexts(&request.process, range) {
            Ok(c) => c,
            Err(e) => {
                warn!(process = %request.process, error = %e, "allocation contexts unavailable");
                return Ok(false);
            }
        };
        for class in &contexts.classes {
            self.storage.put(target, class)?;
        }
        for stack in &contexts.stacks {
            self.storage.put(target, stack)?;
        }
        debug!(
            process = %request.process,
            classes = contexts.classes.len(),
            stacks = contexts.stacks.len(),
            "allocation contexts stored"
        );
        Ok(true)
    }
}
