//! Memory domain: samples, GC events, heap dumps and allocation tracking sessions.
//!
//! Recording sessions span several cycles. At most one session per kind is pending
//! (reported with an open end) at a time; its start is remembered in a [`PendingSample`].
//! The fetch range reaches back to the pending start so the session is reported again
//! until it closes. A closed session is stored once and its payload handed to the
//! [`PayloadExecutor`].

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    merge_records, AllocationTracking, PayloadExecutor, PayloadFetcher, PayloadRequest,
    PollerContext,
};
use crate::error::{PollError, StorageResult};
use crate::model::memory::{
    AllocationsInfo, DumpKind, DumpPayload, HeapDumpInfo, RecordingSession,
};
use crate::model::{FetchRange, Watermark};
use crate::runner::Poll;
use crate::storage::{Entity, StorageExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingSample {
    #[default]
    None,
    Pending { start_ns: i64 },
}

impl PendingSample {
    fn start_ns(self) -> Option<i64> {
        match self {
            PendingSample::None => None,
            PendingSample::Pending { start_ns } => Some(start_ns),
        }
    }

    fn is(self, start: i64) -> bool {
        self.start_ns() == Some(start)
    }
}

pub struct MemoryPoller {
    ctx: PollerContext,
    allocation: Option<Box<dyn AllocationTracking>>,
    fetcher: Arc<PayloadFetcher>,
    executor: Arc<dyn PayloadExecutor>,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    watermark: Watermark,
    heap_dump: PendingSample,
    allocations: PendingSample,
    to_fetch: Vec<PayloadRequest>,
}

impl MemoryPoller {
    pub fn new(
        ctx: PollerContext,
        allocation: Option<Box<dyn AllocationTracking>>,
        fetcher: Arc<PayloadFetcher>,
        executor: Arc<dyn PayloadExecutor>,
    ) -> Self {
        if let Some(tracking) = &allocation {
            debug!(process = %ctx.process, strategy = tracking.name(), "allocation tracking selected");
        }
        Self {
            ctx,
            allocation,
            fetcher,
            executor,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.state.lock().watermark
    }

    pub fn pending(&self, kind: DumpKind) -> PendingSample {
        let state = self.state.lock();
        match kind {
            DumpKind::HeapDump => state.heap_dump,
            DumpKind::Allocations => state.allocations,
        }
    }

    fn fetch_range(state: &MemoryState) -> FetchRange {
        let start = [state.heap_dump.start_ns(), state.allocations.start_ns()]
            .into_iter()
            .flatten()
            .fold(state.watermark.get(), i64::min);
        FetchRange::since(start)
    }

    /// Applies one session report. Returns the session if this report finalized it.
    fn merge_session<S: RecordingSession>(
        &self,
        target: &str,
        kind: DumpKind,
        pending: &mut PendingSample,
        session: S,
    ) -> StorageResult<Option<S>> {
        let storage = self.ctx.storage.as_ref();
        let start = session.start_ns();

        if session.is_open() {
            match *pending {
                PendingSample::Pending { start_ns } if start_ns == start => return Ok(None),
                PendingSample::Pending { start_ns } => {
                    warn!(
                        process = %self.ctx.process,
                        kind = kind.as_str(),
                        pending_start = start_ns,
                        new_start = start,
                        "second open session reported; failing the older one"
                    );
                    self.force_close::<S>(target, kind, start_ns)?;
                    *pending = PendingSample::None;
                }
                PendingSample::None => {}
            }
            if self.stored_closed::<S>(target, &session)? {
                return Ok(None);
            }
            storage.put(target, &session)?;
            *pending = PendingSample::Pending { start_ns: start };
            debug!(process = %self.ctx.process, kind = kind.as_str(), start, "session pending");
            return Ok(None);
        }

        let was_pending = pending.is(start);
        if !was_pending && self.stored_closed::<S>(target, &session)? {
            return Ok(None);
        }
        storage.put(target, &session)?;
        if was_pending {
            *pending = PendingSample::None;
        }
        info!(
            process = %self.ctx.process,
            kind = kind.as_str(),
            start,
            end = session.end_ns(),
            "session finalized"
        );
        Ok(Some(session))
    }

    fn stored_closed<S: RecordingSession>(&self, target: &str, session: &S) -> StorageResult<bool> {
        Ok(self
            .ctx
            .storage
            .get::<S>(target, &session.id())?
            .is_some_and(|stored| !stored.is_open()))
    }

    /// Closes a stored open session as failed at `start + 1` with an empty payload.
    fn force_close<S: RecordingSession>(
        &self,
        target: &str,
        kind: DumpKind,
        start_ns: i64,
    ) -> StorageResult<()> {
        let storage = self.ctx.storage.as_ref();
        if let Some(mut session) = storage.get::<S>(target, &start_ns.to_string())? {
            if session.is_open() {
                session.force_failed_close();
                storage.put(target, &session)?;
            }
        }
        storage.put(target, &DumpPayload::placeholder(kind, start_ns))?;
        Ok(())
    }

    fn submit_payloads(&self, to_fetch: &mut Vec<PayloadRequest>) {
        for request in to_fetch.drain(..) {
            let fetcher = Arc::clone(&self.fetcher);
            self.executor.submit(Box::new(move || fetcher.run(&request)));
        }
    }

    fn finalize_pending<S: RecordingSession>(
        &self,
        target: &str,
        kind: DumpKind,
        pending: &mut PendingSample,
    ) -> StorageResult<()> {
        if let PendingSample::Pending { start_ns } = *pending {
            self.force_close::<S>(target, kind, start_ns)?;
            *pending = PendingSample::None;
            info!(
                process = %self.ctx.process,
                kind = kind.as_str(),
                start = start_ns,
                "pending session failed at shutdown"
            );
        }
        Ok(())
    }
}

impl Poll for MemoryPoller {
    fn name(&self) -> String {
        format!("memory:{}", self.ctx.process)
    }

    fn poll(&self) -> Result<(), PollError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = self.ctx.target();
        let storage = self.ctx.storage.as_ref();

        let data = self
            .ctx
            .client
            .fetch_memory(&self.ctx.process, Self::fetch_range(state))?;
        let samples = data.samples.len();
        let mut high = merge_records(storage, &target, data.samples)?
            .max(merge_records(storage, &target, data.alloc_stats)?)
            .max(merge_records(storage, &target, data.gc_events)?);

        let mut heap_dumps = data.heap_dumps;
        heap_dumps.sort_by_key(|s| s.start_timestamp_ns);
        for session in heap_dumps {
            high = high.max(Some(session.watermark_ns()));
            if let Some(closed) = self.merge_session::<HeapDumpInfo>(
                &target,
                DumpKind::HeapDump,
                &mut state.heap_dump,
                session,
            )? {
                state.to_fetch.push(PayloadRequest {
                    process: self.ctx.process.clone(),
                    kind: DumpKind::HeapDump,
                    start_timestamp_ns: closed.start_timestamp_ns,
                    end_timestamp_ns: closed.end_timestamp_ns,
                    with_contexts: false,
                });
            }
        }

        let mut allocations = data.allocations;
        allocations.sort_by_key(|s| s.start_timestamp_ns);
        for session in allocations {
            high = high.max(Some(session.watermark_ns()));
            if let Some(closed) = self.merge_session::<AllocationsInfo>(
                &target,
                DumpKind::Allocations,
                &mut state.allocations,
                session,
            )? {
                if let Some(request) = self
                    .allocation
                    .as_ref()
                    .and_then(|tracking| tracking.session_closed(&self.ctx, &closed))
                {
                    state.to_fetch.push(request);
                }
            }
        }

        if let Some(ts) = high {
            state.watermark.advance(ts);
        }

        if let Some(tracking) = &self.allocation {
            tracking.poll(&self.ctx)?;
        }

        let queued = state.to_fetch.len();
        self.submit_payloads(&mut state.to_fetch);
        debug!(
            process = %self.ctx.process,
            samples,
            queued,
            watermark = state.watermark.get(),
            "memory cycle merged"
        );
        Ok(())
    }

    fn finish(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = self.ctx.target();

        let result = self
            .finalize_pending::<HeapDumpInfo>(&target, DumpKind::HeapDump, &mut state.heap_dump)
            .and_then(|()| {
                self.finalize_pending::<AllocationsInfo>(
                    &target,
                    DumpKind::Allocations,
                    &mut state.allocations,
                )
            });
        if let Err(e) = result {
            error!(process = %self.ctx.process, error = %e, "finalizing pending sessions failed");
            if e.is_unusable() {
                self.ctx.events.storage_failed(e.to_string());
            }
        }
        self.submit_payloads(&mut state.to_fetch);
    }
}
