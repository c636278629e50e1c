//! On-disk layout of the last telemetry acknowledged by the cloud.
//!
//! `[magic0: u32][magic1: u32][version: u32][telemetry: 16 bytes]`, all
//! little-endian. Anything that does not match exactly is rejected and the
//! caller treats the device as never synced.

use thiserror::Error;

use crate::{DeviceTelemetry, TELEMETRY_SIZE};

/// `"MSAS"` and `"SODA"` packed big-end first.
pub const RECORD_MAGIC: [u32; 2] = [0x4D53_4153, 0x534F_4441];

/// Version 1 predates the battery reading.
pub const RECORD_VERSION: u32 = 2;

pub const RECORD_HEADER_SIZE: usize = 12;
pub const RECORD_SIZE: usize = RECORD_HEADER_SIZE + TELEMETRY_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is empty")]
    Empty,
    #[error("record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad record magic: {0:#010x} {1:#010x}")]
    BadMagic(u32, u32),
    #[error("record version {found} does not match expected {expected}")]
    VersionMismatch { expected: u32, found: u32 },
}

pub fn encode(telemetry: &DeviceTelemetry) -> [u8; RECORD_SIZE] {
    let mut bytes = [0u8; RECORD_SIZE];

    bytes[0..4].copy_from_slice(&RECORD_MAGIC[0].to_le_bytes());
    bytes[4..8].copy_from_slice(&RECORD_MAGIC[1].to_le_bytes());
    bytes[8..12].copy_from_slice(&RECORD_VERSION.to_le_bytes());
    bytes[RECORD_HEADER_SIZE..].copy_from_slice(&telemetry.to_bytes());

    bytes
}

pub fn decode(bytes: &[u8]) -> Result<DeviceTelemetry, RecordError> {
    if bytes.is_empty() {
        return Err(RecordError::Empty);
    }

    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(RecordError::Truncated {
            needed: RECORD_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

    let magic = [word(0), word(4)];
    if magic != RECORD_MAGIC {
        return Err(RecordError::BadMagic(magic[0], magic[1]));
    }

    let version = word(8);
    if version != RECORD_VERSION {
        return Err(RecordError::VersionMismatch {
            expected: RECORD_VERSION,
            found: version,
        });
    }

    let body: &[u8; TELEMETRY_SIZE] = bytes
        .get(RECORD_HEADER_SIZE..RECORD_SIZE)
        .and_then(|body| body.try_into().ok())
        .ok_or(RecordError::Truncated {
            needed: RECORD_SIZE,
            available: bytes.len(),
        })?;

    Ok(DeviceTelemetry::from_bytes(body))
}
