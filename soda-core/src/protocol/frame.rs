use super::{error::ParseResult, error::ProtocolError, *};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0x01,
    Response = 0x02,
    Event = 0x03,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Request),
            0x02 => Ok(MessageType::Response),
            0x03 => Ok(MessageType::Event),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub category: u16,
    pub request_id: u16,
    pub sequence: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub category: u16,
    pub request_id: u16,
    pub sequence: u16,
    /// Zero on success.
    pub result: u8,
    pub body: Vec<u8>,
}

/// Unsolicited notification from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFrame {
    pub category: u16,
    pub event_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Request(_) => MessageType::Request,
            Frame::Response(_) => MessageType::Response,
            Frame::Event(_) => MessageType::Event,
        }
    }

    /// Parse exactly one complete frame, preamble included.
    pub fn from_bytes(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let preamble = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if preamble != MESSAGE_PREAMBLE {
            return Err(ProtocolError::InvalidPreamble(preamble));
        }

        let length = u16::from_le_bytes([bytes[4], bytes[5]]);
        let total_len = LENGTH_PREFIX_SIZE + length as usize;
        if bytes.len() < total_len {
            return Err(ProtocolError::InsufficientData {
                needed: total_len,
                available: bytes.len(),
            });
        }
        let bytes = &bytes[..total_len];

        let word = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);

        match MessageType::try_from(bytes[6])? {
            MessageType::Request => {
                check_header(bytes, REQUEST_HEADER_SIZE)?;
                Ok(Frame::Request(RequestFrame {
                    category: word(8),
                    request_id: word(10),
                    sequence: word(12),
                    body: bytes[REQUEST_HEADER_SIZE..].to_vec(),
                }))
            }
            MessageType::Response => {
                check_header(bytes, RESPONSE_HEADER_SIZE)?;
                Ok(Frame::Response(ResponseFrame {
                    category: word(8),
                    request_id: word(10),
                    sequence: word(12),
                    result: bytes[14],
                    body: bytes[RESPONSE_HEADER_SIZE..].to_vec(),
                }))
            }
            MessageType::Event => {
                if bytes.len() != EVENT_HEADER_SIZE {
                    return Err(ProtocolError::InvalidLength(length));
                }
                Ok(Frame::Event(EventFrame {
                    category: word(8),
                    event_id: word(10),
                }))
            }
        }
    }

    pub fn to_bytes(&self) -> ParseResult<Vec<u8>> {
        let (header_size, body): (usize, &[u8]) = match self {
            Frame::Request(req) => (REQUEST_HEADER_SIZE, req.body.as_slice()),
            Frame::Response(resp) => (RESPONSE_HEADER_SIZE, resp.body.as_slice()),
            Frame::Event(_) => (EVENT_HEADER_SIZE, &[]),
        };

        if body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        let total_len = header_size + body.len();
        let mut bytes = Vec::with_capacity(total_len);

        bytes.extend_from_slice(&MESSAGE_PREAMBLE);
        bytes.extend_from_slice(&((total_len - LENGTH_PREFIX_SIZE) as u16).to_le_bytes());
        bytes.push(self.message_type() as u8);
        bytes.push(0);

        match self {
            Frame::Request(req) => {
                bytes.extend_from_slice(&req.category.to_le_bytes());
                bytes.extend_from_slice(&req.request_id.to_le_bytes());
                bytes.extend_from_slice(&req.sequence.to_le_bytes());
                bytes.extend_from_slice(&[0, 0]);
            }
            Frame::Response(resp) => {
                bytes.extend_from_slice(&resp.category.to_le_bytes());
                bytes.extend_from_slice(&resp.request_id.to_le_bytes());
                bytes.extend_from_slice(&resp.sequence.to_le_bytes());
                bytes.push(resp.result);
                bytes.push(0);
            }
            Frame::Event(event) => {
                bytes.extend_from_slice(&event.category.to_le_bytes());
                bytes.extend_from_slice(&event.event_id.to_le_bytes());
            }
        }

        bytes.extend_from_slice(body);

        Ok(bytes)
    }
}

fn check_header(bytes: &[u8], needed: usize) -> ParseResult<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::InsufficientData {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}
