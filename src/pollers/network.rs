use parking_lot::Mutex;
use tracing::debug;

use super::{merge_records, PollerContext};
use crate::error::PollError;
use crate::model::network::DetailKind;
use crate::model::Watermark;
use crate::runner::Poll;
use crate::storage::StorageExt;

/// Traffic and connection-count samples, plus HTTP connections and their details.
///
/// HTTP connections come from a separate range query that returns every connection
/// overlapping the range, open ones included. Its watermark moves one past the latest
/// start or end seen so a finished connection is delivered exactly once after it completes.
pub struct NetworkPoller {
    ctx: PollerContext,
    state: Mutex<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    watermark: Watermark,
    http_watermark: Watermark,
}

impl NetworkPoller {
    pub fn new(ctx: PollerContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(NetworkState::default()),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.state.lock().watermark
    }

    pub fn http_watermark(&self) -> Watermark {
        self.state.lock().http_watermark
    }
}

impl Poll for NetworkPoller {
    fn name(&self) -> String {
        format!("network:{}", self.ctx.process)
    }

    fn poll(&self) -> Result<(), PollError> {
        let mut state = self.state.lock();
        let target = self.ctx.target();
        let storage = self.ctx.storage.as_ref();
        let client = self.ctx.client.as_ref();
        let process = &self.ctx.process;

        let data = client.fetch_network(process, state.watermark.range())?;
        let samples = data.traffic.len() + data.connections.len();
        let high = merge_records(storage, &target, data.traffic)?
            .max(merge_records(storage, &target, data.connections)?);
        if let Some(ts) = high {
            state.watermark.advance(ts);
        }

        let mut connections = client.fetch_http_range(process, state.http_watermark.range())?;
        connections.sort_by_key(|c| c.start_timestamp_ns);
        let mut http_high = state.http_watermark;
        let mut completed = 0;
        for conn in &connections {
            storage.put(&target, conn)?;
            if conn.is_complete() {
                for kind in DetailKind::ALL {
                    let detail = client.fetch_detail(process, conn.connection_id, kind)?;
                    storage.put(&target, &detail)?;
                }
                completed += 1;
                http_high.advance_past(conn.end_timestamp_ns);
            }
            http_high.advance_past(conn.start_timestamp_ns);
        }
        state.http_watermark = http_high;

        debug!(
            process = %process,
            samples,
            connections = connections.len(),
            completed,
            http_watermark = state.http_watermark.get(),
            "network cycle merged"
        );
        Ok(())
    }
}
