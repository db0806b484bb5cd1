use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

use super::{merge_records, union_into, PollerContext};
use crate::error::PollError;
use crate::model::event::ActivityData;
use crate::model::Watermark;
use crate::runner::Poll;
use crate::storage::{Entity, StorageExt};

/// Activity lifecycles and system input events.
pub struct EventPoller {
    ctx: PollerContext,
    state: Mutex<EventState>,
}

#[derive(Default)]
struct EventState {
    watermark: Watermark,
    activities: HashMap<i64, ActivityData>,
}

impl EventPoller {
    pub fn new(ctx: PollerContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(EventState::default()),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.state.lock().watermark
    }
}

impl Poll for EventPoller {
    fn name(&self) -> String {
        format!("event:{}", self.ctx.process)
    }

    fn poll(&self) -> Result<(), PollError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = self.ctx.target();
        let storage = self.ctx.storage.as_ref();

        let data = self
            .ctx
            .client
            .fetch_events(&self.ctx.process, state.watermark.range())?;
        let system_events = data.system_events.len();
        let mut high = merge_records(storage, &target, data.system_events)?;

        let mut updated = 0;
        for incoming in data.activities {
            if !incoming.states.is_empty() {
                high = high.max(Some(incoming.watermark_ns()));
            }
            let cached = match state.activities.entry(incoming.hash) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let stored = storage
                        .get::<ActivityData>(&target, &incoming.hash.to_string())?
                        .unwrap_or_else(|| ActivityData {
                            states: Vec::new(),
                            ..incoming.clone()
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
            system_events,
            activities_updated = updated,
            watermark = state.watermark.get(),
            "event cycle merged"
        );
        Ok(())
    }
}
