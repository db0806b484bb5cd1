//! Fixed-cadence, cancellable poll loop.
//!
//! Each [`PollRunner`] owns one tokio task. Cycles never overlap: the blocking [`Poll::poll`]
//! runs on the blocking pool and the loop waits for it before sleeping out the rest of the
//! period. [`PollRunner::stop`] cancels the sleep, waits for the in-flight cycle and for
//! [`Poll::finish`], and only then returns.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::PollError;

/// A single poll operation driven by a [`PollRunner`].
pub trait Poll: Send + Sync + 'static {
    fn name(&self) -> String;

    fn poll(&self) -> Result<(), PollError>;

    /// Runs once after the last cycle, before the runner reports `Done`.
    fn finish(&self) {}
}

/// Receives errors that end a poll loop (storage unusable, device disconnected).
pub type Escalation = Arc<dyn Fn(&PollError) + Send + Sync>;

pub fn no_escalation() -> Escalation {
    Arc::new(|_| {})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Running,
    Draining,
    Done,
}

#[derive(Debug)]
struct StateCell(Mutex<RunnerState>);

impl StateCell {
    fn get(&self) -> RunnerState {
        *self.0.lock()
    }

    /// Moves forward only; `Done` is terminal.
    fn advance(&self, next: RunnerState) {
        let mut state = self.0.lock();
        let rank = |s: RunnerState| match s {
            RunnerState::Running => 0,
            RunnerState::Draining => 1,
            RunnerState::Done => 2,
        };
        if rank(next) > rank(*state) {
            *state = next;
        }
    }
}

pub struct PollRunner {
    name: String,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    task: Option<JoinHandle<()>>,
}

impl PollRunner {
    /// Start polling on `handle`. Returns immediately.
    pub fn start(
        handle: &Handle,
        poller: Arc<dyn Poll>,
        period: Duration,
        escalation: Escalation,
    ) -> Self {
        let name = poller.name();
        let cancel = CancellationToken::new();
        let state = Arc::new(StateCell(Mutex::new(RunnerState::Running)));
        let task = handle.spawn(run_loop(
            poller,
            period,
            cancel.clone(),
            Arc::clone(&state),
            escalation,
        ));
        debug!(poller = %name, period_ms = period.as_millis() as u64, "poll runner started");
        Self {
            name,
            cancel,
            state,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunnerState {
        self.state.get()
    }

    /// Request termination and wait until the loop, including `finish`, has exited.
    pub async fn stop(mut self) {
        self.state.advance(RunnerState::Draining);
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(poller = %self.name, error = %e, "poll loop aborted");
            }
        }
        self.state.advance(RunnerState::Done);
        debug!(poller = %self.name, "poll runner stopped");
    }
}

impl Drop for PollRunner {
    fn drop(&mut self) {
        // An unjoined runner still winds down (and finishes) on its own.
        self.cancel.cancel();
    }
}

async fn run_loop(
    poller: Arc<dyn Poll>,
    period: Duration,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    escalation: Escalation,
) {
    let name = poller.name();
    while !cancel.is_cancelled() {
        let started = Instant::now();
        let cycle = Arc::clone(&poller);
        match tokio::task::spawn_blocking(move || cycle.poll()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transient() => {
                warn!(poller = %name, error = %e, "poll cycle failed; retrying next cycle");
            }
            Ok(Err(e)) => {
                error!(poller = %name, error = %e, "poll loop stopping");
                escalation(&e);
                break;
            }
            Err(e) => {
                error!(poller = %name, error = %e, "poll cycle panicked");
            }
        }

        let sleep = period.saturating_sub(started.elapsed());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    state.advance(RunnerState::Draining);
    let last = Arc::clone(&poller);
    if let Err(e) = tokio::task::spawn_blocking(move || last.finish()).await {
        error!(poller = %name, error = %e, "poller finish panicked");
    }
    state.advance(RunnerState::Done);
}
