use super::{error::ParseResult, error::ProtocolError, *};
use crate::{Color, DeviceTelemetry, TELEMETRY_SIZE};

/// The only category the soda machine speaks.
pub const CATEGORY_MCU_TO_CLOUD: u16 = 0x0001;

const LED_BODY_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestId {
    Init = 0x0001,
    RequestTelemetry = 0x0002,
    SetLed = 0x0003,
}

impl TryFrom<u16> for RequestId {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(RequestId::Init),
            0x0002 => Ok(RequestId::RequestTelemetry),
            0x0003 => Ok(RequestId::SetLed),
            _ => Err(ProtocolError::UnknownRequest {
                category: CATEGORY_MCU_TO_CLOUD,
                id: value,
            }),
        }
    }
}

/// Requests the controller sends to the MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuRequest {
    Init,
    RequestTelemetry,
    SetLed(Color),
}

/// Decoded response bodies, one per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum McuResponse {
    /// Older firmware answers with an empty body.
    Init { protocol_version: Option<u32> },
    Telemetry(DeviceTelemetry),
    /// The color the MCU actually applied.
    SetLed(Color),
}

impl McuRequest {
    pub fn id(&self) -> RequestId {
        match self {
            McuRequest::Init => RequestId::Init,
            McuRequest::RequestTelemetry => RequestId::RequestTelemetry,
            McuRequest::SetLed(_) => RequestId::SetLed,
        }
    }

    pub fn into_frame(self, sequence: u16) -> RequestFrame {
        let body = match self {
            McuRequest::Init | McuRequest::RequestTelemetry => Vec::new(),
            McuRequest::SetLed(color) => led_body(color).to_vec(),
        };

        RequestFrame {
            category: CATEGORY_MCU_TO_CLOUD,
            request_id: self.id() as u16,
            sequence,
            body,
        }
    }

    /// Decode a request the way the MCU sees it.
    pub fn from_frame(frame: &RequestFrame) -> ParseResult<Self> {
        if frame.category != CATEGORY_MCU_TO_CLOUD {
            return Err(ProtocolError::UnknownRequest {
                category: frame.category,
                id: frame.request_id,
            });
        }

        match RequestId::try_from(frame.request_id)? {
            RequestId::Init => Ok(McuRequest::Init),
            RequestId::RequestTelemetry => Ok(McuRequest::RequestTelemetry),
            RequestId::SetLed => Ok(McuRequest::SetLed(parse_led_body(&frame.body)?)),
        }
    }
}

impl McuResponse {
    pub fn id(&self) -> RequestId {
        match self {
            McuResponse::Init { .. } => RequestId::Init,
            McuResponse::Telemetry(_) => RequestId::RequestTelemetry,
            McuResponse::SetLed(_) => RequestId::SetLed,
        }
    }

    /// Decode the body of a response to request `id`.
    pub fn decode(id: RequestId, body: &[u8]) -> ParseResult<Self> {
        match id {
            RequestId::Init => match body.len() {
                0 => Ok(McuResponse::Init {
                    protocol_version: None,
                }),
                4 => {
                    let version = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    if version != PROTOCOL_VERSION {
                        return Err(ProtocolError::UnsupportedVersion(version));
                    }
                    Ok(McuResponse::Init {
                        protocol_version: Some(version),
                    })
                }
                actual => Err(ProtocolError::UnexpectedBodySize {
                    expected: 0,
                    actual,
                }),
            },
            RequestId::RequestTelemetry => {
                let body: &[u8; TELEMETRY_SIZE] =
                    body.try_into()
                        .map_err(|_| ProtocolError::UnexpectedBodySize {
                            expected: TELEMETRY_SIZE,
                            actual: body.len(),
                        })?;
                Ok(McuResponse::Telemetry(DeviceTelemetry::from_bytes(body)))
            }
            RequestId::SetLed => Ok(McuResponse::SetLed(parse_led_body(body)?)),
        }
    }

    pub fn into_frame(self, sequence: u16) -> ResponseFrame {
        let body = match self {
            McuResponse::Init {
                protocol_version: None,
            } => Vec::new(),
            McuResponse::Init {
                protocol_version: Some(version),
            } => version.to_le_bytes().to_vec(),
            McuResponse::Telemetry(telemetry) => telemetry.to_bytes().to_vec(),
            McuResponse::SetLed(color) => led_body(color).to_vec(),
        };

        ResponseFrame {
            category: CATEGORY_MCU_TO_CLOUD,
            request_id: self.id() as u16,
            sequence,
            result: 0,
            body,
        }
    }
}

fn led_body(color: Color) -> [u8; LED_BODY_SIZE] {
    let channel = |on: bool| if on { 0xFF } else { 0x00 };
    [channel(color.red), channel(color.green), channel(color.blue), 0]
}

fn parse_led_body(body: &[u8]) -> ParseResult<Color> {
    if body.len() != LED_BODY_SIZE {
        return Err(ProtocolError::UnexpectedBodySize {
            expected: LED_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(Color::rgb(body[0] != 0, body[1] != 0, body[2] != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_led_sends_full_channel_values() {
        let frame = McuRequest::SetLed(Color::YELLOW).into_frame(9);

        assert_eq!(frame.request_id, 3);
        assert_eq!(frame.sequence, 9);
        assert_eq!(frame.body, vec![0xFF, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn any_nonzero_channel_counts_as_on() {
        assert_eq!(
            McuResponse::decode(RequestId::SetLed, &[0x01, 0x00, 0x80, 0x00]),
            Ok(McuResponse::SetLed(Color::MAGENTA))
        );
    }

    #[test]
    fn telemetry_body_must_be_exact() {
        assert_eq!(
            McuResponse::decode(RequestId::RequestTelemetry, &[0; 15]),
            Err(ProtocolError::UnexpectedBodySize {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn init_accepts_empty_or_matching_version() {
        assert_eq!(
            McuResponse::decode(RequestId::Init, &[]),
            Ok(McuResponse::Init {
                protocol_version: None
            })
        );
        assert_eq!(
            McuResponse::decode(RequestId::Init, &2u32.to_le_bytes()),
            Ok(McuResponse::Init {
                protocol_version: Some(2)
            })
        );
        assert_eq!(
            McuResponse::decode(RequestId::Init, &1u32.to_le_bytes()),
            Err(ProtocolError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn requests_decode_on_the_peer_side() {
        let frame = McuRequest::SetLed(Color::CYAN).into_frame(1);
        assert_eq!(
            McuRequest::from_frame(&frame),
            Ok(McuRequest::SetLed(Color::CYAN))
        );

        let foreign = RequestFrame {
            category: 0x0002,
            ..McuRequest::Init.into_frame(1)
        };
        assert!(McuRequest::from_frame(&foreign).is_err());
    }
}
