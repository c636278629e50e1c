use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use soda_core::{DeviceTelemetry, record};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, info};

use super::{StoreError, TelemetryStore, decode_stored};

/// Record kept in a single file. No handle is held between operations.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetryStore for FileStore {
    async fn retrieve(&self) -> Result<Option<DeviceTelemetry>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = ?self.path, "No persistent storage file yet");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(decode_stored(&bytes))
    }

    async fn persist(&self, telemetry: &DeviceTelemetry) -> Result<(), StoreError> {
        let bytes = record::encode(telemetry);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;

        debug!(path = ?self.path, size = bytes.len(), "Telemetry persisted");
        Ok(())
    }
}
