use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

use super::{merge_records, union_into, PollerContext};
use crate::error::PollError;
use crate::model::cpu::ThreadActivity;
use crate::model::Watermark;
use crate::runner::Poll;
use crate::storage::StorageExt;

/// CPU usage samples and per-thread state timelines.
pub struct CpuPoller {
    ctx: PollerContext,
    state: Mutex<CpuState>,
}

#[derive(Default)]
struct CpuState {
    watermark: Watermark,
    threads: HashMap<i32, ThreadActivity>,
}

impl CpuPoller {
    pub fn new(ctx: PollerContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(CpuState::default()),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.state.lock().watermark
    }
}

impl Poll for CpuPoller {
    fn name(&self) -> String {
        format!("cpu:{}", self.ctx.process)
    }

    fn poll(&self) -> Result<(), PollError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = self.ctx.target();
        let storage = self.ctx.storage.as_ref();

        let data = self
            .ctx
            .client
            .fetch_cpu(&self.ctx.process, state.watermark.range())?;
        let usage = data.usage.len();
        let mut high = merge_records(storage, &target, data.usage)?;

        let mut updated = 0;
        for incoming in data.threads {
            high = high.max(incoming.last_timestamp_ns());
            let cached = match state.threads.entry(incoming.thread_id) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let stored = storage
                        .get::<ThreadActivity>(&target, &incoming.thread_id.to_string())?
                        .unwrap_or_else(|| ThreadActivity {
                            thread_id: incoming.thread_id,
                            name: incoming.name.clone(),
                            states: Vec::new(),
                        });
                    e.insert(stored)
                }
            };
            // The cache only takes states that were written.
            let mut merged = cached.clone();
            if union_into(&mut merged.states, &incoming.states) {
                merged.states.sort_by_key(|s| s.timestamp_ns);
                storage.put(&target, &merged)?;
                *cached = merged;
                updated += 1;
            }
        }

        if let Some(ts) = high {
            state.watermark.advance(ts);
        }
        debug!(
            process = %self.ctx.process,
            usage,
            threads_updated = updated,
            watermark = state.watermark.get(),
            "cpu cycle merged"
        );
        Ok(())
    }
}
