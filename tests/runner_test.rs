//! PollRunner: cadence, error tolerance, escalation, join-on-stop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use devmirror_agent::error::{PollError, RemoteError, StorageError};
use devmirror_agent::runner::{no_escalation, Escalation, Poll, PollRunner, RunnerState};

enum Outcome {
    Transient,
    Disconnected,
    Unusable,
    Panic,
}

#[derive(Default)]
struct Scripted {
    polls: AtomicUsize,
    finishes: AtomicUsize,
    script: Mutex<VecDeque<Outcome>>,
}

impl Scripted {
    fn new(script: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl Poll for Scripted {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    fn poll(&self) -> Result<(), PollError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            None => Ok(()),
            Some(Outcome::Transient) => Err(RemoteError::transient("timeout").into()),
            Some(Outcome::Disconnected) => Err(RemoteError::disconnected("gone").into()),
            Some(Outcome::Unusable) => Err(StorageError::Unusable("disk".into()).into()),
            Some(Outcome::Panic) => panic!("poll blew up"),
        }
    }

    fn finish(&self) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn counting_escalation() -> (Escalation, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let escalation: Escalation = Arc::new(move |_e: &PollError| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (escalation, count)
}

#[tokio::test(flavor = "multi_thread")]
async fn polls_until_stopped_then_finishes_once() {
    let poller = Scripted::new(vec![]);
    let runner = PollRunner::start(
        &Handle::current(),
        Arc::clone(&poller) as Arc<dyn Poll>,
        Duration::from_millis(10),
        no_escalation(),
    );
    assert_eq!(runner.state(), RunnerState::Running);
    assert!(eventually(|| poller.polls() >= 3).await);

    runner.stop().await;
    let after_stop = poller.polls();
    assert_eq!(poller.finishes.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(poller.polls(), after_stop);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_are_swallowed() {
    let poller = Scripted::new(vec![Outcome::Transient, Outcome::Transient, Outcome::Transient]);
    let (escalation, escalated) = counting_escalation();
    let runner = PollRunner::start(
        &Handle::current(),
        Arc::clone(&poller) as Arc<dyn Poll>,
        Duration::from_millis(5),
        escalation,
    );
    assert!(eventually(|| poller.polls() >= 5).await);
    assert_eq!(runner.state(), RunnerState::Running);
    runner.stop().await;
    assert_eq!(escalated.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_ends_loop_and_escalates() {
    let poller = Scripted::new(vec![Outcome::Disconnected]);
    let (escalation, escalated) = counting_escalation();
    let runner = PollRunner::start(
        &Handle::current(),
        Arc::clone(&poller) as Arc<dyn Poll>,
        Duration::from_millis(5),
        escalation,
    );
    assert!(eventually(|| runner.state() == RunnerState::Done).await);
    assert_eq!(poller.polls(), 1);
    assert_eq!(escalated.load(Ordering::SeqCst), 1);
    assert_eq!(poller.finishes.load(Ordering::SeqCst), 1);
    runner.stop().await;
    assert_eq!(poller.finishes.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unusable_storage_ends_loop() {
    let poller = Scripted::new(vec![Outcome::Unusable]);
    let (escalation, escalated) = counting_escalation();
    let runner = PollRunner::start(
        &Handle::current(),
        Arc::clone(&poller) as Arc<dyn Poll>,
        Duration::from_millis(5),
        escalation,
    );
    assert!(eventually(|| runner.state() == RunnerState::Done).await);
    assert_eq!(escalated.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_cycle_does_not_end_loop() {
    let poller = Scripted::new(vec![Outcome::Panic]);
    let runner = PollRunner::start(
        &Handle::current(),
        Arc::clone(&poller) as Arc<dyn Poll>,
        Duration::from_millis(5),
        no_escalation(),
    );
    assert!(eventually(|| poller.polls() >= 3).await);
    assert_eq!(runner.state(), RunnerState::Running);
    runner.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_interrupts_long_sleep() {
    let poller = Scripted::new(vec![]);
    let runner = PollRunner::start(
        &Handle::current(),
        Arc::clone(&poller) as Arc<dyn Poll>,
        Duration::from_secs(3600),
        no_escalation(),
    );
    assert!(eventually(|| poller.polls() == 1).await);
    let stopped = tokio::time::timeout(Duration::from_secs(2), runner.stop()).await;
    assert!(stopped.is_ok());
    assert_eq!(poller.finishes.load(Ordering::SeqCst), 1);
}
