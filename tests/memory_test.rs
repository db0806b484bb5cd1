//! Memory poller: pending recording sessions, shutdown finalization, payload retrieval and
//! allocation tracking strategies.

mod common;

use std::sync::Arc;

use common::{context, CountingStore, FailingStore, FakeAgent};
use devmirror_agent::config::PayloadConfig;
use devmirror_agent::model::memory::{
    AllocatedClass, Allocation, AllocationContexts, AllocationEvent, AllocationStack,
    AllocationsInfo, DumpKind, DumpPayload, DumpResponse, DumpStatus, HeapDumpInfo,
    LiveAllocationBatch, MemoryData, MemorySample, StackFrame, ThreadInfo,
};
use devmirror_agent::model::OPEN_END;
use devmirror_agent::pollers::{
    AllocationStrategy, InlineExecutor, MemoryPoller, PayloadExecutor, PayloadFetcher,
    PendingSample, TokioPayloadExecutor,
};
use devmirror_agent::runner::Poll;
use devmirror_agent::storage::{EntityKind, Storage, StorageExt};

fn poller(
    agent: &Arc<FakeAgent>,
    store: Arc<dyn Storage>,
    strategy: Option<AllocationStrategy>,
) -> (MemoryPoller, String) {
    let (ctx, _rx) = context(Arc::clone(agent), store);
    let target = ctx.target();
    let config = PayloadConfig {
        workers: 1,
        retry_attempts: 3,
        retry_delay_ms: 0,
    };
    let fetcher = PayloadFetcher::new(
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.storage),
        ctx.events.clone(),
        &config,
    );
    let poller = MemoryPoller::new(
        ctx,
        strategy.map(|s| s.into_tracker()),
        Arc::new(fetcher),
        Arc::new(InlineExecutor),
    );
    (poller, target)
}

fn sample(ts: i64) -> MemorySample {
    MemorySample {
        timestamp_ns: ts,
        java_kb: 1_024,
        native_kb: 512,
        stack_kb: 64,
        graphics_kb: 128,
        code_kb: 256,
        others_kb: 32,
        total_kb: 2_016,
    }
}

fn heap_dump(start: i64, end: i64) -> HeapDumpInfo {
    HeapDumpInfo {
        start_timestamp_ns: start,
        end_timestamp_ns: end,
        success: end != OPEN_END,
    }
}

fn tracking(start: i64, end: i64) -> AllocationsInfo {
    AllocationsInfo {
        start_timestamp_ns: start,
        end_timestamp_ns: end,
        legacy: true,
        success: end != OPEN_END,
    }
}

fn dumps(sessions: Vec<HeapDumpInfo>) -> MemoryData {
    MemoryData {
        heap_dumps: sessions,
        ..Default::default()
    }
}

#[test]
fn duplicate_pending_session_is_finalized_once() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), None);

    {
        let mut script = agent.memory.lock();
        script.push_back(Ok(dumps(vec![heap_dump(100, OPEN_END)])));
        script.push_back(Ok(dumps(vec![heap_dump(100, OPEN_END)])));
        script.push_back(Ok(dumps(vec![heap_dump(100, 300)])));
        script.push_back(Ok(dumps(vec![heap_dump(100, 300)])));
    }

    poller.poll().unwrap();
    assert_eq!(
        poller.pending(DumpKind::HeapDump),
        PendingSample::Pending { start_ns: 100 }
    );
    poller.poll().unwrap();
    assert_eq!(store.upserts_of(EntityKind::HeapDump), 1);
    poller.poll().unwrap();
    poller.poll().unwrap();

    assert_eq!(poller.pending(DumpKind::HeapDump), PendingSample::None);
    assert_eq!(store.upserts_of(EntityKind::HeapDump), 2);
    let stored: Vec<HeapDumpInfo> = store.range(&target, 0, i64::MAX).unwrap();
    assert_eq!(stored, vec![heap_dump(100, 300)]);

    assert_eq!(store.upserts_of(EntityKind::DumpPayload), 1);
    let payload: DumpPayload = store.get(&target, "heap_dump:100").unwrap().unwrap();
    assert_eq!(payload.status, DumpStatus::Success);
    assert_eq!(payload.data, b"dump".to_vec());
}

#[test]
fn pending_session_widens_fetch_range() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, _) = poller(&agent, store, None);

    agent.memory.lock().push_back(Ok(MemoryData {
        samples: vec![sample(500)],
        heap_dumps: vec![heap_dump(100, OPEN_END)],
        ..Default::default()
    }));
    agent
        .memory
        .lock()
        .push_back(Ok(dumps(vec![heap_dump(100, 700)])));

    poller.poll().unwrap();
    assert_eq!(poller.watermark().get(), 500);
    poller.poll().unwrap();
    poller.poll().unwrap();

    let starts: Vec<i64> = agent.ranges_of("memory").iter().map(|r| r.start_ns).collect();
    assert_eq!(starts, vec![i64::MIN, 100, 700]);
}

#[test]
fn shutdown_fails_pending_session() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), None);

    agent
        .memory
        .lock()
        .push_back(Ok(dumps(vec![heap_dump(100, OPEN_END)])));
    poller.poll().unwrap();
    poller.finish();

    let stored: HeapDumpInfo = store.get(&target, "100").unwrap().unwrap();
    assert_eq!(stored.end_timestamp_ns, 101);
    assert!(!stored.success);
    let payload: DumpPayload = store.get(&target, "heap_dump:100").unwrap().unwrap();
    assert_eq!(payload.status, DumpStatus::Failure);
    assert!(payload.data.is_empty());
    assert_eq!(poller.pending(DumpKind::HeapDump), PendingSample::None);
}

#[test]
fn second_open_session_fails_the_older_one() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), None);

    agent
        .memory
        .lock()
        .push_back(Ok(dumps(vec![heap_dump(100, OPEN_END)])));
    agent
        .memory
        .lock()
        .push_back(Ok(dumps(vec![heap_dump(200, OPEN_END)])));
    poller.poll().unwrap();
    poller.poll().unwrap();

    let older: HeapDumpInfo = store.get(&target, "100").unwrap().unwrap();
    assert_eq!(older.end_timestamp_ns, 101);
    assert!(!older.success);
    let placeholder: DumpPayload = store.get(&target, "heap_dump:100").unwrap().unwrap();
    assert!(placeholder.data.is_empty());

    let newer: HeapDumpInfo = store.get(&target, "200").unwrap().unwrap();
    assert_eq!(newer.end_timestamp_ns, OPEN_END);
    assert_eq!(
        poller.pending(DumpKind::HeapDump),
        PendingSample::Pending { start_ns: 200 }
    );
}

#[test]
fn legacy_tracking_stores_contexts_before_payload() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), Some(AllocationStrategy::Legacy));

    *agent.contexts.lock() = AllocationContexts {
        classes: vec![AllocatedClass {
            class_id: 1,
            name: "java.lang.String".to_string(),
            alloc_timestamp_ns: 150,
        }],
        stacks: vec![AllocationStack {
            stack_id: 9,
            timestamp_ns: 150,
            frames: vec![StackFrame {
                class_name: "com.example.Main".to_string(),
                method_name: "onCreate".to_string(),
                line_number: 12,
            }],
        }],
    };
    agent.memory.lock().push_back(Ok(MemoryData {
        allocations: vec![tracking(100, OPEN_END)],
        ..Default::default()
    }));
    agent.memory.lock().push_back(Ok(MemoryData {
        allocations: vec![tracking(100, 500)],
        ..Default::default()
    }));
    poller.poll().unwrap();
    assert_eq!(store.upserts_of(EntityKind::DumpPayload), 0);
    poller.poll().unwrap();

    let class_at = store.first_upsert(EntityKind::AllocatedClass).unwrap();
    let stack_at = store.first_upsert(EntityKind::AllocationStack).unwrap();
    let payload_at = store.first_upsert(EntityKind::DumpPayload).unwrap();
    assert!(class_at < payload_at);
    assert!(stack_at < payload_at);

    let range = agent.ranges_of("contexts")[0];
    assert_eq!((range.start_ns, range.end_ns), (100, 500));
    let payload: DumpPayload = store.get(&target, "allocations:100").unwrap().unwrap();
    assert_eq!(payload.status, DumpStatus::Success);
}

#[test]
fn legacy_tracking_skips_sessions_without_a_dump() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, _) = poller(&agent, store.clone(), Some(AllocationStrategy::Legacy));

    let live_session = AllocationsInfo {
        legacy: false,
        ..tracking(100, 500)
    };
    agent.memory.lock().push_back(Ok(MemoryData {
        allocations: vec![live_session],
        ..Default::default()
    }));
    poller.poll().unwrap();
    assert_eq!(store.upserts_of(EntityKind::AllocationsInfo), 1);
    assert_eq!(store.upserts_of(EntityKind::DumpPayload), 0);
    assert!(agent.ranges_of("contexts").is_empty());
}

#[test]
fn disabled_tracking_fetches_no_payload() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, _) = poller(&agent, store.clone(), None);

    agent.memory.lock().push_back(Ok(MemoryData {
        allocations: vec![tracking(100, 500)],
        ..Default::default()
    }));
    poller.poll().unwrap();
    assert_eq!(store.upserts_of(EntityKind::AllocationsInfo), 1);
    assert_eq!(store.upserts_of(EntityKind::DumpPayload), 0);
}

#[test]
fn live_tracking_writes_metadata_then_events() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), Some(AllocationStrategy::Live));

    let allocation = Allocation {
        tag: 5,
        class_id: 1,
        alloc_timestamp_ns: 10,
        free_timestamp_ns: OPEN_END,
        size: 48,
        thread_id: 3,
        stack_id: 9,
    };
    agent.live.lock().push_back(Ok(vec![LiveAllocationBatch {
        timestamp_ns: 10,
        classes: vec![AllocatedClass {
            class_id: 1,
            name: "byte[]".to_string(),
            alloc_timestamp_ns: 10,
        }],
        stacks: vec![AllocationStack {
            stack_id: 9,
            timestamp_ns: 10,
            frames: vec![],
        }],
        threads: vec![ThreadInfo {
            thread_id: 3,
            name: "main".to_string(),
            timestamp_ns: 10,
        }],
        events: vec![AllocationEvent::Alloc(allocation)],
    }]));
    agent.live.lock().push_back(Ok(vec![LiveAllocationBatch {
        timestamp_ns: 20,
        events: vec![AllocationEvent::Free {
            tag: 5,
            timestamp_ns: 20,
        }],
        ..Default::default()
    }]));

    poller.poll().unwrap();
    poller.poll().unwrap();
    poller.poll().unwrap();

    let first_event = store.first_upsert(EntityKind::Allocation).unwrap();
    for kind in [
        EntityKind::AllocatedClass,
        EntityKind::AllocationStack,
        EntityKind::AllocationThread,
    ] {
        assert!(store.first_upsert(kind).unwrap() < first_event);
    }
    let freed: Allocation = store.get(&target, "5").unwrap().unwrap();
    assert_eq!(freed.free_timestamp_ns, 20);

    let starts: Vec<i64> = agent.ranges_of("live").iter().map(|r| r.start_ns).collect();
    assert_eq!(starts, vec![i64::MIN, 10, 20]);
}

#[test]
fn not_ready_payload_is_retried() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), None);

    let not_ready = || {
        Ok(DumpResponse {
            status: DumpStatus::NotReady,
            data: vec![],
        })
    };
    agent.dumps.lock().extend([not_ready(), not_ready()]);
    agent
        .memory
        .lock()
        .push_back(Ok(dumps(vec![heap_dump(100, 300)])));
    poller.poll().unwrap();

    let payload: DumpPayload = store.get(&target, "heap_dump:100").unwrap().unwrap();
    assert_eq!(payload.status, DumpStatus::Success);
    assert!(agent.dumps.lock().is_empty());
}

#[test]
fn payload_never_ready_leaves_placeholder() {
    let agent = FakeAgent::new();
    let store = CountingStore::new();
    let (poller, target) = poller(&agent, store.clone(), None);

    let not_ready = || {
        Ok(DumpResponse {
            status: DumpStatus::NotReady,
            data: vec![1, 2, 3],
        })
    };
    agent
        .dumps
        .lock()
        .extend([not_ready(), not_ready(), not_ready(), not_ready()]);
    agent
        .memory
        .lock()
        .push_back(Ok(dumps(vec![heap_dump(100, 300)])));
    poller.poll().unwrap();

    let payload: DumpPayload = store.get(&target, "heap_dump:100").unwrap().unwrap();
    assert_eq!(payload.status, DumpStatus::Failure);
    assert!(payload.data.is_empty());
    assert_eq!(agent.dumps.lock().len(), 1);
}

#[test]
fn unusable_storage_is_fatal() {
    let agent = FakeAgent::new();
    let (poller, _) = poller(&agent, Arc::new(FailingStore), None);
    agent.memory.lock().push_back(Ok(MemoryData {
        samples: vec![sample(1)],
        ..Default::default()
    }));
    assert!(poller.poll().unwrap_err().is_fatal());
}

#[tokio::test(flavor = "multi_thread")]
async fn executor_drain_waits_for_running_jobs() {
    let executor = TokioPayloadExecutor::new(tokio::runtime::Handle::current(), 1);
    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = Arc::new(std::sync::Mutex::new(gate));
    let (done_tx, done) = std::sync::mpsc::channel::<u32>();

    for n in 0..2 {
        let gate = Arc::clone(&gate);
        let done_tx = done_tx.clone();
        executor.submit(Box::new(move || {
            gate.lock().unwrap().recv().unwrap();
            done_tx.send(n).unwrap();
        }));
    }
    // Both jobs are held at the gate.
    assert_eq!(executor.in_flight(), 2);

    release.send(()).unwrap();
    release.send(()).unwrap();
    executor.drain().await;
    assert_eq!(executor.in_flight(), 0);
    let mut finished: Vec<u32> = done.try_iter().collect();
    finished.sort_unstable();
    assert_eq!(finished, vec![0, 1]);
}
