//! Allocation tracking behind one interface: live (incremental event batches) or
//! legacy (one dump per closed tracking session).

use parking_lot::Mutex;
use tracing::debug;

use super::{PayloadRequest, PollerContext};
use crate::config::AllocationTrackingMode;
use crate::error::PollError;
use crate::model::memory::{Allocation, AllocationEvent, AllocationsInfo, DumpKind};
use crate::model::{AttachState, Watermark};
use crate::storage::StorageExt;

pub trait AllocationTracking: Send + Sync {
    fn name(&self) -> &'static str;

    /// Incremental work done on every memory cycle.
    fn poll(&self, ctx: &PollerContext) -> Result<(), PollError>;

    /// A tracking session was finalized; returns the payload to fetch, if the strategy needs one.
    fn session_closed(&self, ctx: &PollerContext, session: &AllocationsInfo)
        -> Option<PayloadRequest>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    Live,
    Legacy,
}

impl AllocationStrategy {
    /// `auto` picks live tracking when the device API level reaches `live_min_api_level`
    /// and an agent is attached to the process; legacy otherwise.
    pub fn select(
        mode: AllocationTrackingMode,
        live_min_api_level: u32,
        device_api_level: u32,
        attach: AttachState,
    ) -> Option<Self> {
        match mode {
            AllocationTrackingMode::Disabled => None,
            AllocationTrackingMode::Live => Some(Self::Live),
            AllocationTrackingMode::Legacy => Some(Self::Legacy),
            AllocationTrackingMode::Auto => {
                if device_api_level >= live_min_api_level && attach == AttachState::Attached {
                    Some(Self::Live)
                } else {
                    Some(Self::Legacy)
                }
            }
        }
    }

    pub fn into_tracker(self) -> Box<dyn AllocationTracking> {
        match self {
            Self::Live => Box::new(LiveAllocationTracking::new()),
            Self::Legacy => Box::new(LegacyAllocationTracking),
        }
    }
}

/// Streams allocation and free events with their class, stack and thread metadata.
pub struct LiveAllocationTracking {
    watermark: Mutex<Watermark>,
}

impl LiveAllocationTracking {
    pub fn new() -> Self {
        Self {
            watermark: Mutex::new(Watermark::BEGINNING),
        }
    }

    pub fn watermark(&self) -> Watermark {
        *self.watermark.lock()
    }
}

impl Default for LiveAllocationTracking {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationTracking for LiveAllocationTracking {
    fn name(&self) -> &'static str {
        "live"
    }

    fn poll(&self, ctx: &PollerContext) -> Result<(), PollError> {
        let mut watermark = self.watermark.lock();
        let target = ctx.target();
        let storage = ctx.storage.as_ref();

        let mut batches = ctx
            .client
            .fetch_live_allocations(&ctx.process, watermark.range())?;
        batches.sort_by_key(|b| b.timestamp_ns);

        let mut high = None;
        let (mut allocs, mut frees) = (0, 0);
        for mut batch in batches {
            // Metadata before the events that refer to it.
            for class in &batch.classes {
                storage.put(&target, class)?;
            }
            for stack in &batch.stacks {
                storage.put(&target, stack)?;
            }
            for thread in &batch.threads {
                storage.put(&target, thread)?;
            }

            batch.events.sort_by_key(|e| e.timestamp_ns());
            for event in &batch.events {
                match event {
                    AllocationEvent::Alloc(allocation) => {
                        storage.put(&target, allocation)?;
                        allocs += 1;
                    }
                    AllocationEvent::Free { tag, timestamp_ns } => {
                        match storage.get::<Allocation>(&target, &tag.to_string())? {
                            Some(mut allocation) => {
                                allocation.free_timestamp_ns = *timestamp_ns;
                                storage.put(&target, &allocation)?;
                                frees += 1;
                            }
                            None => debug!(process = %ctx.process, tag, "free of unknown allocation"),
                        }
                    }
                }
            }
            high = high.max(Some(batch.timestamp_ns));
        }

        if let Some(ts) = high {
            watermark.advance(ts);
        }
        if allocs + frees > 0 {
            debug!(process = %ctx.process, allocs, frees, "live allocations merged");
        }
        Ok(())
    }

    fn session_closed(
        &self,
        _ctx: &PollerContext,
        _session: &AllocationsInfo,
    ) -> Option<PayloadRequest> {
        None
    }
}

/// Pre-live devices: the whole recording is pulled as one dump when a session the device
/// flags `legacy` ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyAllocationTracking;

impl AllocationTracking for LegacyAllocationTracking {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn poll(&self, _ctx: &PollerContext) -> Result<(), PollError> {
        Ok(())
    }

    fn session_closed(
        &self,
        ctx: &PollerContext,
        session: &AllocationsInfo,
    ) -> Option<PayloadRequest> {
        // Sessions recorded by a live agent leave no dump on the device.
        if !session.legacy {
            debug!(process = %ctx.process, start_ns = session.start_timestamp_ns, "no dump for live session");
            return None;
        }
        Some(PayloadRequest {
            process: ctx.process.clone(),
            kind: DumpKind::Allocations,
            start_timestamp_ns: session.start_timestamp_ns,
            end_timestamp_ns: session.end_timestamp_ns,
            with_contexts: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_needs_api_level_and_attached_agent() {
        let auto = AllocationTrackingMode::Auto;
        assert_eq!(
            AllocationStrategy::select(auto, 26, 28, AttachState::Attached),
            Some(AllocationStrategy::Live)
        );
        assert_eq!(
            AllocationStrategy::select(auto, 26, 25, AttachState::Attached),
            Some(AllocationStrategy::Legacy)
        );
        assert_eq!(
            AllocationStrategy::select(auto, 26, 30, AttachState::Unattachable),
            Some(AllocationStrategy::Legacy)
        );
    }

    #[test]
    fn explicit_modes_ignore_device() {
        assert_eq!(
            AllocationStrategy::select(AllocationTrackingMode::Live, 26, 19, AttachState::Unspecified),
            Some(AllocationStrategy::Live)
        );
        assert_eq!(
            AllocationStrategy::select(AllocationTrackingMode::Disabled, 26, 30, AttachState::Attached),
            None
        );
    }
}
