use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::merge_records;
use crate::error::PollError;
use crate::model::{StreamTarget, Watermark};
use crate::remote::AgentService;
use crate::runner::Poll;
use crate::storage::Storage;

/// Device-wide generic event stream, one per connection.
pub struct EventStreamPoller {
    target: StreamTarget,
    client: Arc<dyn AgentService>,
    storage: Arc<dyn Storage>,
    watermark: Mutex<Watermark>,
}

impl EventStreamPoller {
    pub fn new(
        target: StreamTarget,
        client: Arc<dyn AgentService>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            target,
            client,
            storage,
            watermark: Mutex::new(Watermark::BEGINNING),
        }
    }

    pub fn watermark(&self) -> Watermark {
        *self.watermark.lock()
    }
}

impl Poll for EventStreamPoller {
    fn name(&self) -> String {
        format!("stream:{}", self.target)
    }

    fn poll(&self) -> Result<(), PollError> {
        let mut watermark = self.watermark.lock();
        let events = self
            .client
            .fetch_event_stream(&self.target.device_id, watermark.range())?;
        let count = events.len();
        let high = merge_records(self.storage.as_ref(), &self.target.to_string(), events)?;
        if let Some(ts) = high {
            watermark.advance(ts);
        }
        debug!(stream = %self.target, count, watermark = watermark.get(), "stream cycle merged");
        Ok(())
    }
}
