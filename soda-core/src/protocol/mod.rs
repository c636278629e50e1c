mod decoder;
mod error;
mod frame;
mod message;

pub use decoder::FrameDecoder;
pub use error::{ParseResult, ProtocolError};
pub use frame::{EventFrame, Frame, MessageType, RequestFrame, ResponseFrame};
pub use message::{CATEGORY_MCU_TO_CLOUD, McuRequest, McuResponse, RequestId};

// frame structure : preamble(4) + length(2) + type(1) + reserved(1) + type header + body
// `length` counts every byte after the preamble and the length field itself.

pub const MESSAGE_PREAMBLE: [u8; 4] = [0x22, 0xB5, 0x58, 0xB9];
pub const PROTOCOL_VERSION: u32 = 2;

pub const PREAMBLE_SIZE: usize = 4;
/// Preamble plus the length field.
pub const LENGTH_PREFIX_SIZE: usize = PREAMBLE_SIZE + 2;
/// Common header shared by every message type.
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 2;
pub const REQUEST_HEADER_SIZE: usize = HEADER_SIZE + 8;
pub const RESPONSE_HEADER_SIZE: usize = HEADER_SIZE + 8;
pub const EVENT_HEADER_SIZE: usize = HEADER_SIZE + 4;

pub const MAX_BODY_SIZE: usize = 231;
/// Largest frame either side may put on the wire.
pub const MAX_FRAME_SIZE: usize = RESPONSE_HEADER_SIZE + MAX_BODY_SIZE;
/// Capacity of the streaming receive buffer.
pub const RECEIVE_BUFFER_SIZE: usize = 1024;
