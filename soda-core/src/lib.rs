mod color;
mod exit;
pub mod protocol;
pub mod record;

pub use color::{Color, UnknownColor};
pub use exit::{ErrorKind, ExitCode};

use serde::{Deserialize, Serialize};

/// Remaining dispenses at or below which the machine reports low stock.
pub const LOW_SODA_THRESHOLD: u32 = 10;

/// Size of [`DeviceTelemetry`] in its fixed little-endian layout.
pub const TELEMETRY_SIZE: usize = 16;

/// Counters reported by the soda machine MCU.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    /// Units dispensed since the machine was first commissioned.
    pub lifetime_total_dispenses: u32,
    /// Units ever stocked into the machine.
    pub lifetime_total_stocked_dispenses: u32,
    /// Current maximum number of stockable units.
    pub capacity: u32,
    /// Most recent battery reading in volts.
    pub battery_level: f32,
}

impl DeviceTelemetry {
    pub fn from_bytes(bytes: &[u8; TELEMETRY_SIZE]) -> Self {
        Self {
            lifetime_total_dispenses: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            lifetime_total_stocked_dispenses: u32::from_le_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            capacity: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            battery_level: f32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; TELEMETRY_SIZE] {
        let mut bytes = [0u8; TELEMETRY_SIZE];

        bytes[0..4].copy_from_slice(&self.lifetime_total_dispenses.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.lifetime_total_stocked_dispenses.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.battery_level.to_le_bytes());

        bytes
    }

    /// Derive the cloud view of this reading against the last reading the
    /// cloud acknowledged. With no previous record every lifetime dispense
    /// counts as new.
    pub fn to_cloud(&self, previous: Option<&DeviceTelemetry>) -> CloudTelemetry {
        let since_last = match previous {
            Some(prev) => self
                .lifetime_total_dispenses
                .saturating_sub(prev.lifetime_total_dispenses),
            None => self.lifetime_total_dispenses,
        };

        let remaining = self
            .lifetime_total_stocked_dispenses
            .saturating_sub(self.lifetime_total_dispenses);

        CloudTelemetry {
            dispenses_since_last_sync: since_last,
            remaining_dispenses: remaining,
            low_soda: remaining <= LOW_SODA_THRESHOLD,
            lifetime_total_dispenses: self.lifetime_total_dispenses,
            battery_level: self.battery_level,
        }
    }
}

/// Telemetry message sent to the cloud, serialized with the field names the
/// cloud application expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudTelemetry {
    #[serde(rename = "DispensesSinceLastUpdate")]
    pub dispenses_since_last_sync: u32,
    #[serde(rename = "RemainingDispenses")]
    pub remaining_dispenses: u32,
    #[serde(rename = "LowSoda")]
    pub low_soda: bool,
    #[serde(rename = "LifetimeTotalDispenses")]
    pub lifetime_total_dispenses: u32,
    #[serde(rename = "BatteryLevel")]
    pub battery_level: f32,
}
