//! DevMirror agent entrypoint: connects the configured devices and mirrors their profiling
//! data into the local store until Ctrl+C.

use devmirror_agent::{
    config::AgentConfig,
    logging::StructuredLogger,
    model::DeviceId,
    pipeline::Pipeline,
    storage::SqliteStore,
    ForwardingTransport,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::var("DEVMIRROR_CONFIG_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("config.json"));
    let config = AgentConfig::load(&config_path);

    if let Err(e) = StructuredLogger::init(config.log.json, &config.log.level) {
        eprintln!("logging already initialized: {}", e);
    }

    info!(data_dir = ?config.data_dir, devices = config.devices.len(), "DevMirror agent starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(SqliteStore::open(&config.data_dir.join("mirror.db"))?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("devmirror")
        .build()?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.cancel()) {
        warn!(error = %e, "Ctrl+C handler not installed");
    }

    let transport = Arc::new(ForwardingTransport::new(config.transport.clone()));
    let devices: Vec<DeviceId> = config.devices.iter().map(DeviceId::new).collect();
    let mut pipeline = Pipeline::new(config, store, transport, runtime.handle().clone());

    let result = runtime.block_on(async {
        for device in &devices {
            if let Err(e) = pipeline.connect_device(device).await {
                warn!(device_id = %device, error = %e, "initial connect failed; retrying later");
                pipeline.schedule_reconnect(device);
            }
        }
        info!("mirroring (Ctrl+C to stop)");
        let result = pipeline.run(shutdown).await;
        pipeline.shutdown().await;
        result
    });

    match result {
        Ok(()) => {
            info!("DevMirror agent stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "DevMirror agent stopped on failure");
            Err(e.into())
        }
    }
}
