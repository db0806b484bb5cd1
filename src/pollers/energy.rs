use parking_lot::Mutex;
use tracing::debug;

use super::{merge_records, PollerContext};
use crate::error::PollError;
use crate::model::Watermark;
use crate::runner::Poll;

/// Energy usage samples and wake lock / alarm / job / location events.
pub struct EnergyPoller {
    ctx: PollerContext,
    watermark: Mutex<Watermark>,
}

impl EnergyPoller {
    pub fn new(ctx: PollerContext) -> Self {
        Self {
            ctx,
            watermark: Mutex::new(Watermark::BEGINNING),
        }
    }

    pub fn watermark(&self) -> Watermark {
        *self.watermark.lock()
    }
}

impl Poll for EnergyPoller {
    fn name(&self) -> String {
        format!("energy:{}", self.ctx.process)
    }

    fn poll(&self) -> Result<(), PollError> {
        let mut watermark = self.watermark.lock();
        let target = self.ctx.target();
        let storage = self.ctx.storage.as_ref();

        let data = self
            .ctx
            .client
            .fetch_energy(&self.ctx.process, watermark.range())?;
        let (samples, events) = (data.samples.len(), data.events.len());
        let high = merge_records(storage, &target, data.samples)?
            .max(merge_records(storage, &target, data.events)?);

        if let Some(ts) = high {
            watermark.advance(ts);
        }
        debug!(
            process = %self.ctx.process,
            samples,
            events,
            watermark = watermark.get(),
            "energy cycle merged"
        );
        Ok(())
    }
}
