//! Integration test: config load, end-to-end mirroring into an on-disk store.

mod common;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use common::{FakeAgent, FakeTransport};
use devmirror_agent::config::{AgentConfig, AllocationTrackingMode};
use devmirror_agent::model::cpu::{CpuData, CpuUsageSample};
use devmirror_agent::model::{Device, DeviceId, DeviceState, Process, ProcessState, DEVICES_TARGET};
use devmirror_agent::storage::{SqliteStore, Storage, StorageExt};
use devmirror_agent::Pipeline;

#[test]
fn config_load_default() {
    let c = AgentConfig::load(Path::new("nonexistent.json"));
    assert_eq!(c.polling.max_consecutive_failures, 3);
    assert_eq!(c.memory.allocation_tracking, AllocationTrackingMode::Auto);
    assert!(c.devices.is_empty());
    assert!(c.domains.auto_monitor);
}

#[test]
fn config_load_partial_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"devices":["emulator-5554"],"memory":{{"allocation_tracking":"legacy"}},"polling":{{"cpu_interval_ms":50}}}}"#
    )
    .unwrap();
    let c = AgentConfig::load(file.path());
    assert_eq!(c.devices, vec!["emulator-5554".to_string()]);
    assert_eq!(c.memory.allocation_tracking, AllocationTrackingMode::Legacy);
    assert_eq!(c.memory.live_min_api_level, 26);
    assert_eq!(c.polling.cpu_interval_ms, 50);
    assert_eq!(c.polling.memory_interval_ms, 250);
}

#[test]
fn config_load_malformed_falls_back_to_default() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    let c = AgentConfig::load(file.path());
    assert_eq!(c.polling.discovery_interval_ms, 1_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn mirrors_device_processes_and_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db");
    let device_id = DeviceId::new("emulator-5554");

    let agent = FakeAgent::with_device("emulator-5554", 30);
    agent.set_processes(&[7]);
    agent.cpu.lock().push_back(Ok(CpuData {
        usage: vec![CpuUsageSample {
            timestamp_ns: 1_000,
            elapsed_time_ns: 1_000,
            process_cpu_time_ns: 400,
            system_cpu_time_ns: 900,
        }],
        ..Default::default()
    }));

    let mut config = AgentConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.devices = vec![device_id.to_string()];
    config.polling.discovery_interval_ms = 20;
    config.polling.cpu_interval_ms = 20;
    config.payload.retry_delay_ms = 0;

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let mut pipeline = Pipeline::new(
        config,
        Arc::clone(&store) as Arc<dyn Storage>,
        FakeTransport::new(Arc::clone(&agent)),
        Handle::current(),
    );
    pipeline.connect_device(&device_id).await.unwrap();
    let process = pipeline.registry().get(&device_id).unwrap().process_key(7);

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
    });
    pipeline.run(token).await.unwrap();
    pipeline.shutdown().await;
    drop(pipeline);
    drop(store);

    let store = SqliteStore::open(&path).unwrap();
    let device: Device = store.get(DEVICES_TARGET, "emulator-5554").unwrap().unwrap();
    assert_eq!(device.api_level, 30);
    assert_eq!(device.state, DeviceState::Online);

    let stored: Process = store
        .get(device_id.as_str(), &process.local_id())
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, ProcessState::Alive);
    assert_eq!(stored.name, "proc7");

    let samples: Vec<CpuUsageSample> = store.range(&process.to_string(), 0, i64::MAX).unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].process_cpu_time_ns, 400);
}
