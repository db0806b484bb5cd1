//! Error types shared by the ingestion pipeline.

use thiserror::Error;

/// Failure of a single call against a device's remote agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeout or temporary unreachability; the next cycle retries the same range.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The device's agent is gone (explicit disconnect or repeated transient failures).
    #[error("device disconnected: {0}")]
    Disconnected(String),
}

impl RemoteError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        RemoteError::Transient(msg.into())
    }

    pub fn disconnected<S: Into<String>>(msg: S) -> Self {
        RemoteError::Disconnected(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// Storage can no longer accept writes; every poller depending on it must stop.
    #[error("storage unusable: {0}")]
    Unusable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_unusable(&self) -> bool {
        matches!(self, StorageError::Unusable(_))
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unable to allocate a local port: {0}")]
    NoLocalPort(#[source] std::io::Error),

    #[error("port forward failed for {device}: {reason}")]
    Forward { device: String, reason: String },

    #[error("client setup failed: {0}")]
    Client(String),
}

/// Outcome of a failed poll cycle.
#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PollError {
    /// Swallowed at the cycle boundary and retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            PollError::Remote(RemoteError::Transient(_)) => true,
            PollError::Remote(RemoteError::Disconnected(_)) => false,
            PollError::Storage(e) => !e.is_unusable(),
        }
    }

    /// Ends the poll loop.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("storage failed, pipeline stopped: {0}")]
    StorageFailed(String),
}

/// Result alias for remote agent calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Result alias for storage calls.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
