use super::{error::ParseResult, error::ProtocolError, *};

/// Streaming receive side of the wire protocol.
///
/// Bytes arrive in arbitrary chunks; complete frames are handed out one at a
/// time. Garbage before a preamble is dropped silently. A header whose length
/// field cannot describe a valid frame is reported once and skipped, after
/// which decoding resumes at the next preamble.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    capacity: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_capacity(RECEIVE_BUFFER_SIZE)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity: capacity.max(MAX_FRAME_SIZE),
        }
    }

    /// Bytes currently held waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn free_space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append received bytes, returning how many fit into the buffer.
    /// Callers should size their reads with [`FrameDecoder::free_space`].
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.free_space());
        self.buf.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    /// Drop everything buffered, e.g. after the transport reconnects.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete frame, `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<ParseResult<Frame>> {
        self.skip_to_preamble();

        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return None;
        }

        let length = u16::from_le_bytes([self.buf[4], self.buf[5]]);
        let total_len = LENGTH_PREFIX_SIZE + length as usize;

        if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&total_len) {
            // Step past this preamble so the next call resynchronises.
            self.buf.drain(..1);
            return Some(Err(ProtocolError::InvalidLength(length)));
        }

        if self.buf.len() < total_len {
            return None;
        }

        let frame = Frame::from_bytes(&self.buf[..total_len]);
        self.buf.drain(..total_len);

        Some(frame)
    }

    /// Discard bytes before the first complete or trailing partial preamble.
    fn skip_to_preamble(&mut self) {
        let start = (0..self.buf.len())
            .find(|&pos| {
                let rest = &self.buf[pos..];
                let check = rest.len().min(PREAMBLE_SIZE);
                rest[..check] == MESSAGE_PREAMBLE[..check]
            })
            .unwrap_or(self.buf.len());

        if start > 0 {
            self.buf.drain(..start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(sequence: u16, body: &[u8]) -> Vec<u8> {
        Frame::Response(ResponseFrame {
            category: 1,
            request_id: 2,
            sequence,
            result: 0,
            body: body.to_vec(),
        })
        .to_bytes()
        .unwrap()
    }

    fn sequence_of(frame: Frame) -> u16 {
        match frame {
            Frame::Response(resp) => resp.sequence,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn joins_partial_arrivals() {
        let bytes = response(5, &[1, 2, 3, 4]);
        let mut decoder = FrameDecoder::new();

        for chunk in bytes.chunks(3) {
            assert!(decoder.next_frame().is_none());
            decoder.extend(chunk);
        }

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(sequence_of(frame), 5);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn yields_back_to_back_frames_in_order() {
        let mut bytes = response(1, &[]);
        bytes.extend(response(2, &[9; 16]));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(sequence_of(decoder.next_frame().unwrap().unwrap()), 1);
        assert_eq!(sequence_of(decoder.next_frame().unwrap().unwrap()), 2);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn drops_noise_but_keeps_partial_preamble() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x00, 0x13, 0x22, 0xB5]);

        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 2);

        let frame = response(3, &[]);
        decoder.extend(&frame[2..]);
        assert_eq!(sequence_of(decoder.next_frame().unwrap().unwrap()), 3);
    }

    #[test]
    fn bad_length_reports_once_then_resyncs() {
        let mut bytes = vec![0x22, 0xB5, 0x58, 0xB9, 0xFF, 0x7F];
        bytes.extend(response(4, &[]));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(
            decoder.next_frame(),
            Some(Err(ProtocolError::InvalidLength(0x7FFF)))
        );
        assert_eq!(sequence_of(decoder.next_frame().unwrap().unwrap()), 4);
    }

    #[test]
    fn invalid_type_consumes_the_frame() {
        let mut bytes = vec![0x22, 0xB5, 0x58, 0xB9, 2, 0, 0x7E, 0];
        bytes.extend(response(6, &[]));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(
            decoder.next_frame(),
            Some(Err(ProtocolError::InvalidMessageType(0x7E)))
        );
        assert_eq!(sequence_of(decoder.next_frame().unwrap().unwrap()), 6);
    }

    #[test]
    fn buffer_is_bounded() {
        let mut decoder = FrameDecoder::new();
        let noise = vec![0u8; RECEIVE_BUFFER_SIZE + 10];

        assert_eq!(decoder.extend(&noise), RECEIVE_BUFFER_SIZE);
        assert_eq!(decoder.free_space(), 0);

        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.free_space(), RECEIVE_BUFFER_SIZE);
    }
}
