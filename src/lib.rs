//! DevMirror agent: mirrors profiling data from attached devices into a local store.
//!
//! Modular structure:
//! - [`connection`]: Port forwarding, per-device proxy and connection registry
//! - [`tracker`]: Device and process discovery with death detection
//! - [`pollers`]: Per-domain incremental pollers (cpu, memory, network, event, energy, stream)
//! - [`runner`]: Fixed-cadence, cancellable poll loop
//! - [`pipeline`]: Supervisor reacting to lifecycle events
//! - [`storage`]: Keyed insert-or-replace mirror store (SQLite)
//! - [`remote`]: Device agent service contract and HTTP client
//! - [`logging`]: Structured JSON logging

pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod pollers;
pub mod remote;
pub mod runner;
pub mod storage;
pub mod tracker;

pub use config::AgentConfig;
pub use connection::{ConnectionManager, ForwardingTransport, Transport};
pub use error::{PipelineError, PollError, RemoteError, StorageError};
pub use lifecycle::LifecycleEvent;
pub use logging::StructuredLogger;
pub use pipeline::Pipeline;
pub use remote::AgentService;
pub use runner::{Poll, PollRunner};
pub use storage::{SqliteStore, Storage};
pub use tracker::DeviceProcessTracker;
