//! Per-domain pollers: each mirrors one slice of a process's profiling data into storage,
//! fetching `[watermark, +inf)` every cycle.

mod allocation;
mod cpu;
mod energy;
mod event;
mod memory;
mod network;
mod payload;
mod stream;

pub use allocation::{
    AllocationStrategy, AllocationTracking, LegacyAllocationTracking, LiveAllocationTracking,
};
pub use cpu::CpuPoller;
pub use energy::EnergyPoller;
pub use event::EventPoller;
pub use memory::{MemoryPoller, PendingSample};
pub use network::NetworkPoller;
pub use payload::{
    InlineExecutor, PayloadExecutor, PayloadFetcher, PayloadJob, PayloadRequest,
    TokioPayloadExecutor,
};
pub use stream::EventStreamPoller;

use std::sync::Arc;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::error::StorageResult;
use crate::lifecycle::LifecycleSender;
use crate::model::{AttachState, ProcessKey};
use crate::remote::AgentService;
use crate::runner::Poll;
use crate::storage::{Entity, Storage, StorageExt};

/// What every process-scoped poller is built from.
#[derive(Clone)]
pub struct PollerContext {
    pub process: ProcessKey,
    pub client: Arc<dyn AgentService>,
    pub storage: Arc<dyn Storage>,
    pub events: LifecycleSender,
}

impl PollerContext {
    /// Storage target of the process's records.
    pub fn target(&self) -> String {
        self.process.to_string()
    }
}

/// Upsert a batch in timestamp order. Returns the highest watermark timestamp written,
/// which the caller applies once the whole response is merged.
pub(crate) fn merge_records<T: Entity>(
    storage: &dyn Storage,
    target: &str,
    mut batch: Vec<T>,
) -> StorageResult<Option<i64>> {
    batch.sort_by_key(|r| r.timestamp_ns());
    let mut high = None;
    for record in &batch {
        storage.put(target, record)?;
        high = high.max(Some(record.watermark_ns()));
    }
    Ok(high)
}

/// Appends the parts of `incoming` not already in `cached`. Returns whether anything was added.
pub(crate) fn union_into<T: PartialEq + Clone>(cached: &mut Vec<T>, incoming: &[T]) -> bool {
    let mut added = false;
    for part in incoming {
        if !cached.contains(part) {
            cached.push(part.clone());
            added = true;
        }
    }
    added
}

/// A poller with the period it runs at.
pub struct DomainPoller {
    pub poller: Arc<dyn Poll>,
    pub period: Duration,
}

/// Build the enabled domain pollers for one process.
pub fn build_domain_pollers(
    ctx: &PollerContext,
    config: &AgentConfig,
    device_api_level: u32,
    attach: AttachState,
    executor: Arc<dyn PayloadExecutor>,
) -> Vec<DomainPoller> {
    let polling = &config.polling;
    let domains = &config.domains;
    let mut pollers = Vec::new();

    if domains.cpu {
        pollers.push(DomainPoller {
            poller: Arc::new(CpuPoller::new(ctx.clone())),
            period: Duration::from_millis(polling.cpu_interval_ms),
        });
    }
    if domains.memory {
        let strategy = AllocationStrategy::select(
            config.memory.allocation_tracking,
            config.memory.live_min_api_level,
            device_api_level,
            attach,
        );
        let fetcher = PayloadFetcher::new(
            Arc::clone(&ctx.client),
            Arc::clone(&ctx.storage),
            ctx.events.clone(),
            &config.payload,
        );
        pollers.push(DomainPoller {
            poller: Arc::new(MemoryPoller::new(
                ctx.clone(),
                strategy.map(|s| s.into_tracker()),
                Arc::new(fetcher),
                executor,
            )),
            period: Duration::from_millis(polling.memory_interval_ms),
        });
    }
    if domains.network {
        pollers.push(DomainPoller {
            poller: Arc::new(NetworkPoller::new(ctx.clone())),
            period: Duration::from_millis(polling.network_interval_ms),
        });
    }
    if domains.event {
        pollers.push(DomainPoller {
            poller: Arc::new(EventPoller::new(ctx.clone())),
            period: Duration::from_millis(polling.event_interval_ms),
        });
    }
    if domains.energy {
        pollers.push(DomainPoller {
            poller: Arc::new(EnergyPoller::new(ctx.clone())),
            period: Duration::from_millis(polling.energy_interval_ms),
        });
    }
    pollers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_skips_parts_already_cached() {
        let mut cached = vec![1, 2];
        assert!(union_into(&mut cached, &[2, 3, 3]));
        assert_eq!(cached, vec![1, 2, 3]);
        assert!(!union_into(&mut cached, &[1, 3]));
    }
}
