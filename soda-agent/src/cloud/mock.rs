use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ClientEvent, CloudClient};
use crate::config::ScopeId;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockCloudConfig {
    /// Delay before the connection comes up
    pub connect_delay_ms: u64,
    /// Whether the connection ever comes up
    pub connect: bool,
    /// Twin document delivered right after connecting
    pub desired_twin: Option<String>,
    /// Confirm telemetry as delivered
    pub ack_telemetry: bool,
    /// Confirm reported state as delivered
    pub ack_reported: bool,
}

impl Default for MockCloudConfig {
    fn default() -> Self {
        Self {
            connect_delay_ms: 500,
            connect: true,
            desired_twin: None,
            ack_telemetry: true,
            ack_reported: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum MockCloudError {
    #[error("mock cloud is already connected")]
    AlreadyConnected,
    #[error("mock cloud event channel closed")]
    ChannelClosed,
}

/// Something the device sent to the mock cloud.
#[derive(Debug, Clone, PartialEq)]
pub enum SentMessage {
    Telemetry {
        token: u32,
        body: serde_json::Value,
    },
    ReportedState {
        token: u32,
        body: serde_json::Value,
    },
    MethodResponse {
        request_id: u64,
        status: u16,
        body: String,
    },
}

/// Observes and drives a [`MockCloud`] from outside the agent.
#[derive(Clone)]
pub struct MockCloudHandle {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    events: mpsc::Sender<ClientEvent>,
}

impl MockCloudHandle {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn telemetry(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                SentMessage::Telemetry { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn reported(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                SentMessage::ReportedState { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub async fn inject(&self, event: ClientEvent) -> Result<(), MockCloudError> {
        self.events
            .send(event)
            .await
            .map_err(|_| MockCloudError::ChannelClosed)
    }
}

/// In-process cloud for development and tests.
pub struct MockCloud {
    config: MockCloudConfig,
    handle: MockCloudHandle,
    events: Option<mpsc::Receiver<ClientEvent>>,
}

impl MockCloud {
    pub fn new(config: MockCloudConfig) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            config,
            handle: MockCloudHandle {
                sent: Arc::default(),
                events: tx,
            },
            events: Some(rx),
        }
    }

    pub fn handle(&self) -> MockCloudHandle {
        self.handle.clone()
    }

    fn record(&self, message: SentMessage) {
        if let Ok(mut sent) = self.handle.sent.lock() {
            sent.push(message);
        }
    }

    async fn notify(&self, event: ClientEvent) -> Result<(), MockCloudError> {
        self.handle.inject(event).await
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    type Error = MockCloudError;

    async fn connect(
        &mut self,
        scope_id: &ScopeId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, Self::Error> {
        let rx = self.events.take().ok_or(MockCloudError::AlreadyConnected)?;
        info!(%scope_id, "Mock cloud connecting");

        if self.config.connect {
            let tx = self.handle.events.clone();
            let delay = Duration::from_millis(self.config.connect_delay_ms);
            let twin = self.config.desired_twin.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                if tx
                    .send(ClientEvent::Connection { connected: true })
                    .await
                    .is_err()
                {
                    return;
                }
                if let Some(payload) = twin {
                    let _ = tx.send(ClientEvent::Twin { payload }).await;
                }
            });
        }

        Ok(rx)
    }

    async fn send_event(&self, body: String, token: u32) -> Result<(), Self::Error> {
        let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        self.record(SentMessage::Telemetry { token, body });
        self.notify(ClientEvent::TelemetryConfirmed {
            token,
            success: self.config.ack_telemetry,
        })
        .await
    }

    async fn report_state(&self, body: String, token: u32) -> Result<(), Self::Error> {
        let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        self.record(SentMessage::ReportedState { token, body });
        self.notify(ClientEvent::ReportedStateConfirmed {
            token,
            success: self.config.ack_reported,
        })
        .await
    }

    async fn respond_to_method(
        &self,
        request_id: u64,
        status: u16,
        body: String,
    ) -> Result<(), Self::Error> {
        self.record(SentMessage::MethodResponse {
            request_id,
            status,
            body,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cloud::{CloudEvent, CloudGateway, FlavorUpdate};

    fn scope() -> ScopeId {
        ScopeId::parse(Some("0ne000TEST")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_refuses_telemetry_until_connected() {
        let cloud = MockCloud::new(MockCloudConfig {
            desired_twin: Some(r#"{"NextFlavor":{"Color":"green"}}"#.to_owned()),
            ..Default::default()
        });
        let handle = cloud.handle();
        let mut gateway = CloudGateway::new(cloud);
        let mut rx = gateway.connect(&scope(), CancellationToken::new()).await.unwrap();

        let telemetry = soda_core::DeviceTelemetry::default().to_cloud(None);
        assert!(matches!(
            gateway.send_telemetry(&telemetry).await,
            Err(crate::cloud::GatewayError::NotConnected)
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(gateway.handle(event).await, Some(CloudEvent::Connection(true)));

        let event = rx.recv().await.unwrap();
        assert_eq!(
            gateway.handle(event).await,
            Some(CloudEvent::Flavor(FlavorUpdate::Change {
                name: None,
                color: Some(soda_core::Color::GREEN)
            }))
        );

        gateway.send_telemetry(&telemetry).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(gateway.handle(event).await, Some(CloudEvent::TelemetryAck(true)));
        assert_eq!(handle.telemetry().len(), 1);
    }

    #[tokio::test]
    async fn flavor_ack_is_reported_and_confirmed() {
        let cloud = MockCloud::new(MockCloudConfig {
            connect_delay_ms: 0,
            ack_reported: false,
            ..Default::default()
        });
        let handle = cloud.handle();
        let mut gateway = CloudGateway::new(cloud);
        let mut rx = gateway.connect(&scope(), CancellationToken::new()).await.unwrap();

        let event = rx.recv().await.unwrap();
        gateway.handle(event).await;

        gateway
            .send_flavor_ack(Some("cola"), Some(soda_core::Color::RED))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(gateway.handle(event).await, Some(CloudEvent::FlavorAck(false)));

        assert_eq!(
            handle.reported(),
            vec![json!({"NextFlavor": {"Name": "cola", "Color": "red"}})]
        );
    }

    #[tokio::test]
    async fn direct_methods_are_not_found() {
        let cloud = MockCloud::new(MockCloudConfig::default());
        let handle = cloud.handle();
        let mut gateway = CloudGateway::new(cloud);

        let outcome = gateway
            .handle(ClientEvent::DirectMethod {
                request_id: 7,
                method: "Restock".to_owned(),
                payload: "{}".to_owned(),
            })
            .await;

        assert_eq!(outcome, None);
        assert_eq!(
            handle.sent(),
            vec![SentMessage::MethodResponse {
                request_id: 7,
                status: 404,
                body: "{}".to_owned()
            }]
        );
    }
}
