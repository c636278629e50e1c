use serde::{Deserialize, Serialize};
use soda_core::{CloudTelemetry, Color};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClientEvent, CloudClient, Correlation};
use crate::config::ScopeId;

/// Largest device twin payload accepted.
pub const MAX_TWIN_PAYLOAD: usize = 512;

const METHOD_NOT_FOUND: u16 = 404;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("cloud is not connected")]
    NotConnected,
    #[error("flavor acknowledgement needs a name or a color")]
    EmptyAcknowledgement,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cloud client error: {0}")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Requested flavor carried by a desired twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlavorUpdate {
    /// Nothing to apply or acknowledge.
    NoChange,
    /// At least one of the two is present.
    Change {
        name: Option<String>,
        color: Option<Color>,
    },
}

/// Cloud notifications the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudEvent {
    Connection(bool),
    Flavor(FlavorUpdate),
    TelemetryAck(bool),
    FlavorAck(bool),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct NextFlavor {
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "Color", default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TwinProperties {
    #[serde(rename = "NextFlavor", default, skip_serializing_if = "Option::is_none")]
    next_flavor: Option<NextFlavor>,
}

/// Either a full twin document or a bare desired-property patch.
#[derive(Debug, Deserialize)]
struct TwinDocument {
    #[serde(default)]
    desired: Option<TwinProperties>,
    #[serde(default)]
    reported: Option<TwinProperties>,
    #[serde(rename = "NextFlavor", default)]
    next_flavor: Option<NextFlavor>,
}

/// Work out what a device twin payload asks of the machine.
///
/// Returns `None` for payloads that cannot be read at all.
pub fn decode_desired(payload: &str) -> Option<FlavorUpdate> {
    if payload.len() > MAX_TWIN_PAYLOAD {
        error!(
            size = payload.len(),
            max = MAX_TWIN_PAYLOAD,
            "Device twin payload too large"
        );
        return None;
    }

    let document: TwinDocument = match serde_json::from_str(payload) {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "Cannot parse device twin as JSON");
            return None;
        }
    };

    let (requested, reported) = match document.desired {
        Some(desired) => (
            desired.next_flavor,
            document.reported.and_then(|r| r.next_flavor),
        ),
        None => (document.next_flavor, None),
    };

    let Some(requested) = requested else {
        warn!("Device twin did not contain a NextFlavor desired property");
        return Some(FlavorUpdate::NoChange);
    };

    let color = match requested.color.as_deref().map(str::parse::<Color>) {
        Some(Ok(color)) => Some(color),
        Some(Err(e)) => {
            error!(error = %e, "Unknown LED color in device twin");
            return Some(FlavorUpdate::NoChange);
        }
        None => None,
    };

    if reported.is_some_and(|r| already_applied(&r, requested.name.as_deref(), color)) {
        info!(
            name = ?requested.name,
            ?color,
            "Requested flavor already applied"
        );
        return Some(FlavorUpdate::NoChange);
    }

    match (requested.name, color) {
        (None, None) => {
            info!("No change in requested color or name");
            Some(FlavorUpdate::NoChange)
        }
        (name, color) => {
            info!(?name, ?color, "Requested flavor");
            Some(FlavorUpdate::Change { name, color })
        }
    }
}

/// Reported colors are compared by value, whatever their case.
fn already_applied(reported: &NextFlavor, name: Option<&str>, color: Option<Color>) -> bool {
    let reported_color = match reported.color.as_deref() {
        Some(raw) => match raw.to_ascii_lowercase().parse::<Color>() {
            Ok(color) => Some(color),
            Err(_) => return false,
        },
        None => None,
    };

    reported.name.as_deref() == name && reported_color == color
}

/// Backend-agnostic view of the cloud for one cycle.
pub struct CloudGateway<C> {
    client: C,
    connected: bool,
}

impl<C: CloudClient> CloudGateway<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            connected: false,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn connect(
        &mut self,
        scope_id: &ScopeId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, GatewayError> {
        self.connected = false;
        self.client
            .connect(scope_id, cancel)
            .await
            .map_err(|e| GatewayError::Client(Box::new(e)))
    }

    /// Refuses while disconnected. Confirmation arrives as
    /// [`CloudEvent::TelemetryAck`].
    pub async fn send_telemetry(&self, telemetry: &CloudTelemetry) -> Result<(), GatewayError> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }

        let body = serde_json::to_string(telemetry)?;
        debug!(%body, "Sending telemetry");
        self.client
            .send_event(body, Correlation::Telemetry.token())
            .await
            .map_err(|e| GatewayError::Client(Box::new(e)))
    }

    /// Report the applied flavor. Confirmation arrives as
    /// [`CloudEvent::FlavorAck`].
    pub async fn send_flavor_ack(
        &self,
        name: Option<&str>,
        color: Option<Color>,
    ) -> Result<(), GatewayError> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        if name.is_none() && color.is_none() {
            return Err(GatewayError::EmptyAcknowledgement);
        }

        let reported = TwinProperties {
            next_flavor: Some(NextFlavor {
                name: name.map(str::to_owned),
                color: color.map(|c| c.name().to_owned()),
            }),
        };
        let body = serde_json::to_string(&reported)?;
        debug!(%body, "Reporting flavor");

        self.client
            .report_state(body, Correlation::FlavorAck.token())
            .await
            .map_err(|e| GatewayError::Client(Box::new(e)))
    }

    /// Translate a client notification. Direct methods are answered here.
    pub async fn handle(&mut self, event: ClientEvent) -> Option<CloudEvent> {
        match event {
            ClientEvent::Connection { connected } => {
                info!(connected, "Cloud connection changed");
                self.connected = connected;
                Some(CloudEvent::Connection(connected))
            }
            ClientEvent::Twin { payload } => decode_desired(&payload).map(CloudEvent::Flavor),
            ClientEvent::TelemetryConfirmed { token, success } => {
                match Correlation::from_token(token) {
                    Some(Correlation::Telemetry) => Some(CloudEvent::TelemetryAck(success)),
                    _ => {
                        warn!(token, "Unexpected telemetry confirmation");
                        None
                    }
                }
            }
            ClientEvent::ReportedStateConfirmed { token, success } => {
                match Correlation::from_token(token) {
                    Some(Correlation::FlavorAck) => Some(CloudEvent::FlavorAck(success)),
                    _ => {
                        warn!(token, "Unexpected device twin confirmation");
                        None
                    }
                }
            }
            ClientEvent::DirectMethod {
                request_id, method, ..
            } => {
                info!(%method, "Direct method not supported");
                if let Err(e) = self
                    .client
                    .respond_to_method(request_id, METHOD_NOT_FOUND, "{}".to_owned())
                    .await
                {
                    warn!(error = %e, "Failed to answer direct method");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: Option<&str>, color: Option<Color>) -> Option<FlavorUpdate> {
        Some(FlavorUpdate::Change {
            name: name.map(str::to_owned),
            color,
        })
    }

    #[test]
    fn patch_with_name_and_color() {
        assert_eq!(
            decode_desired(r#"{"NextFlavor":{"Name":"cola","Color":"red"},"$version":4}"#),
            change(Some("cola"), Some(Color::RED))
        );
    }

    #[test]
    fn full_document_uses_desired_section() {
        let payload = r#"{
            "desired": {"NextFlavor": {"Color": "blue"}, "$version": 2},
            "reported": {"NextFlavor": {"Name": "cola", "Color": "red"}}
        }"#;
        assert_eq!(decode_desired(payload), change(None, Some(Color::BLUE)));
    }

    #[test]
    fn already_reported_flavor_is_no_change() {
        let payload = r#"{
            "desired": {"NextFlavor": {"Name": "cola", "Color": "red"}},
            "reported": {"NextFlavor": {"Name": "cola", "Color": "red"}}
        }"#;
        assert_eq!(decode_desired(payload), Some(FlavorUpdate::NoChange));
    }

    #[test]
    fn reported_color_is_compared_by_value() {
        let payload = r#"{
            "desired": {"NextFlavor": {"Name": "cola", "Color": "red"}},
            "reported": {"NextFlavor": {"Name": "cola", "Color": "Red"}}
        }"#;
        assert_eq!(decode_desired(payload), Some(FlavorUpdate::NoChange));

        let payload = r#"{
            "desired": {"NextFlavor": {"Name": "cola", "Color": "red"}},
            "reported": {"NextFlavor": {"Name": "cola", "Color": "blue"}}
        }"#;
        assert_eq!(decode_desired(payload), change(Some("cola"), Some(Color::RED)));
    }

    #[test]
    fn name_only_keeps_the_led() {
        assert_eq!(
            decode_desired(r#"{"NextFlavor":{"Name":"lemonade"}}"#),
            change(Some("lemonade"), None)
        );
    }

    #[test]
    fn unknown_color_is_ignored() {
        assert_eq!(
            decode_desired(r#"{"NextFlavor":{"Name":"cola","Color":"chartreuse"}}"#),
            Some(FlavorUpdate::NoChange)
        );
    }

    #[test]
    fn missing_next_flavor_is_no_change() {
        assert_eq!(
            decode_desired(r#"{"desired":{"$version":1}}"#),
            Some(FlavorUpdate::NoChange)
        );
        assert_eq!(
            decode_desired(r#"{"NextFlavor":{}}"#),
            Some(FlavorUpdate::NoChange)
        );
    }

    #[test]
    fn unreadable_payloads_are_dropped() {
        assert_eq!(decode_desired("not json"), None);

        let padding = "x".repeat(MAX_TWIN_PAYLOAD);
        let oversized = format!(r#"{{"NextFlavor":{{"Name":"{padding}"}}}}"#);
        assert_eq!(decode_desired(&oversized), None);
    }

    #[test]
    fn reported_state_omits_missing_fields() {
        let reported = TwinProperties {
            next_flavor: Some(NextFlavor {
                name: None,
                color: Some("red".to_owned()),
            }),
        };
        assert_eq!(
            serde_json::to_string(&reported).unwrap(),
            r#"{"NextFlavor":{"Color":"red"}}"#
        );
    }
}
