use thiserror::Error;

pub type ParseResult<T> = core::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid preamble: {0:02x?}")]
    InvalidPreamble([u8; 4]),
    #[error("insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },
    #[error("invalid message type: {0:#04x}")]
    InvalidMessageType(u8),
    #[error("invalid frame length field: {0}")]
    InvalidLength(u16),
    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("unknown request {id:#06x} in category {category:#06x}")]
    UnknownRequest { category: u16, id: u16 },
    #[error("unexpected body size: expected {expected}, got {actual}")]
    UnexpectedBodySize { expected: usize, actual: usize },
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
}
