use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use soda_core::{DeviceTelemetry, record};

use super::{StoreError, TelemetryStore, decode_stored};

/// Store kept in process memory. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStore {
    /// Start from raw contents, as if read back from a file.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn with_telemetry(telemetry: &DeviceTelemetry) -> Self {
        Self::with_bytes(record::encode(telemetry).to_vec())
    }

    pub fn bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.bytes.lock()?.clone())
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn retrieve(&self) -> Result<Option<DeviceTelemetry>, StoreError> {
        let bytes = self.bytes.lock()?;
        Ok(decode_stored(&bytes))
    }

    async fn persist(&self, telemetry: &DeviceTelemetry) -> Result<(), StoreError> {
        let mut bytes = self.bytes.lock()?;
        *bytes = record::encode(telemetry).to_vec();
        Ok(())
    }
}
