pub mod bridge;
pub mod gateway;
pub mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use gateway::{CloudEvent, CloudGateway, FlavorUpdate, GatewayError, decode_desired};

use crate::config::ScopeId;

/// Identifies which outstanding operation a cloud confirmation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Correlation {
    Telemetry = 0x01,
    FlavorAck = 0x02,
}

impl Correlation {
    pub fn token(self) -> u32 {
        self as u32
    }

    pub fn from_token(token: u32) -> Option<Self> {
        match token {
            0x01 => Some(Correlation::Telemetry),
            0x02 => Some(Correlation::FlavorAck),
            _ => None,
        }
    }
}

/// Raw notifications from a cloud client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connection { connected: bool },
    /// Device twin document or desired-property patch, as JSON text.
    Twin { payload: String },
    TelemetryConfirmed { token: u32, success: bool },
    ReportedStateConfirmed { token: u32, success: bool },
    DirectMethod {
        request_id: u64,
        method: String,
        payload: String,
    },
}

/// A device-to-cloud client: provisioned connection, telemetry, reported
/// state and direct methods.
///
/// Notifications are delivered on the receiver returned by `connect`.
#[async_trait]
pub trait CloudClient: Send + Sync + 'static {
    /// Error type for this client implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start connecting. The client keeps retrying in the background until
    /// `cancel` fires.
    async fn connect(
        &mut self,
        scope_id: &ScopeId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, Self::Error>;

    async fn send_event(&self, body: String, token: u32) -> Result<(), Self::Error>;

    async fn report_state(&self, body: String, token: u32) -> Result<(), Self::Error>;

    async fn respond_to_method(
        &self,
        request_id: u64,
        status: u16,
        body: String,
    ) -> Result<(), Self::Error>;
}
