pub mod file;
pub mod memory;

use std::sync::PoisonError;

use async_trait::async_trait;
use soda_core::{
    DeviceTelemetry,
    record::{self, RecordError},
};
use tracing::{info, warn};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mutex poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(err: PoisonError<T>) -> Self {
        StoreError::Poisoned(err.to_string())
    }
}

/// Keeps the last telemetry the cloud acknowledged across power cycles.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// The previously persisted telemetry, or `None` when nothing usable was
    /// stored.
    async fn retrieve(&self) -> Result<Option<DeviceTelemetry>, StoreError>;

    /// Replace whatever was stored before.
    async fn persist(&self, telemetry: &DeviceTelemetry) -> Result<(), StoreError>;
}

/// Decode raw store contents, treating any mismatch as "never persisted".
pub(crate) fn decode_stored(bytes: &[u8]) -> Option<DeviceTelemetry> {
    match record::decode(bytes) {
        Ok(telemetry) => {
            info!(?telemetry, "Previous telemetry found in persistent storage");
            Some(telemetry)
        }
        Err(RecordError::Empty) => {
            info!("No previous telemetry in persistent storage");
            None
        }
        Err(e) => {
            warn!(error = %e, "Discarding persisted telemetry");
            None
        }
    }
}
