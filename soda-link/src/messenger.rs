use std::time::Duration;

use soda_core::protocol::{
    CATEGORY_MCU_TO_CLOUD, Frame, McuRequest, McuResponse, ProtocolError, RequestId,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("request {outstanding:?} is still outstanding")]
    Busy { outstanding: RequestId },
    #[error("failed to encode request: {0}")]
    Encode(#[from] ProtocolError),
}

/// Why a request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McuFailure {
    TimedOut,
    /// The receive path hit a malformed frame while the request was pending.
    Framing(ProtocolError),
    /// Response header did not belong to the request.
    Mismatch { category: u16, request_id: u16 },
    /// The MCU answered with a non-zero result.
    Rejected(u8),
    /// The response body did not decode.
    BadResponse(ProtocolError),
    /// The transport failed or closed before a response arrived.
    Closed,
}

/// Outcome of one request. Every accepted request yields exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request: RequestId,
    pub outcome: Result<McuResponse, McuFailure>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    request: RequestId,
    sequence: u16,
    deadline: Instant,
}

/// Request/response bookkeeping for the MCU link.
///
/// Holds at most one outstanding request. Responses are matched on the
/// sequence number; anything that does not match is logged and dropped.
#[derive(Debug)]
pub struct Messenger {
    pending: Option<PendingRequest>,
    next_sequence: u16,
    timeout: Duration,
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Messenger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: None,
            next_sequence: 0,
            timeout,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// When the outstanding request times out, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    /// Register `request` as outstanding and return its encoded frame.
    pub fn begin(&mut self, request: McuRequest, now: Instant) -> Result<Vec<u8>, MessengerError> {
        if let Some(pending) = self.pending {
            return Err(MessengerError::Busy {
                outstanding: pending.request,
            });
        }

        let sequence = self.next_sequence;
        let bytes = Frame::Request(request.into_frame(sequence)).to_bytes()?;

        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending = Some(PendingRequest {
            request: request.id(),
            sequence,
            deadline: now + self.timeout,
        });

        debug!(?request, sequence, "MCU request sent");
        Ok(bytes)
    }

    pub fn on_frame(&mut self, frame: Frame) -> Option<Completion> {
        let response = match frame {
            Frame::Response(response) => response,
            Frame::Event(event) => {
                info!(
                    category = event.category,
                    event_id = event.event_id,
                    "Ignoring MCU event with no handler"
                );
                return None;
            }
            Frame::Request(request) => {
                warn!(
                    category = request.category,
                    request_id = request.request_id,
                    "Ignoring request from MCU"
                );
                return None;
            }
        };

        let Some(pending) = self.pending else {
            warn!(
                sequence = response.sequence,
                "Ignoring response with no request outstanding"
            );
            return None;
        };

        if response.sequence != pending.sequence {
            warn!(
                expected = pending.sequence,
                received = response.sequence,
                "Ignoring response with mismatched sequence number"
            );
            return None;
        }

        self.pending = None;

        let outcome = if response.category != CATEGORY_MCU_TO_CLOUD
            || response.request_id != pending.request as u16
        {
            Err(McuFailure::Mismatch {
                category: response.category,
                request_id: response.request_id,
            })
        } else if response.result != 0 {
            Err(McuFailure::Rejected(response.result))
        } else {
            McuResponse::decode(pending.request, &response.body).map_err(McuFailure::BadResponse)
        };

        Some(Completion {
            request: pending.request,
            outcome,
        })
    }

    pub fn on_framing_error(&mut self, error: ProtocolError) -> Option<Completion> {
        self.fail(McuFailure::Framing(error))
    }

    pub fn on_closed(&mut self) -> Option<Completion> {
        self.fail(McuFailure::Closed)
    }

    pub fn poll_timeout(&mut self, now: Instant) -> Option<Completion> {
        match self.pending {
            Some(pending) if now >= pending.deadline => self.fail(McuFailure::TimedOut),
            _ => None,
        }
    }

    fn fail(&mut self, failure: McuFailure) -> Option<Completion> {
        let pending = self.pending.take()?;
        Some(Completion {
            request: pending.request,
            outcome: Err(failure),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soda_core::Color;
    use soda_core::protocol::ResponseFrame;

    fn sent_sequence(bytes: &[u8]) -> u16 {
        match Frame::from_bytes(bytes).unwrap() {
            Frame::Request(req) => req.sequence,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn reply(response: McuResponse, sequence: u16) -> Frame {
        Frame::Response(response.into_frame(sequence))
    }

    #[test]
    fn second_request_is_refused_while_one_is_outstanding() {
        let now = Instant::now();
        let mut messenger = Messenger::default();

        messenger.begin(McuRequest::Init, now).unwrap();
        assert!(matches!(
            messenger.begin(McuRequest::RequestTelemetry, now),
            Err(MessengerError::Busy {
                outstanding: RequestId::Init
            })
        ));
    }

    #[test]
    fn matching_response_completes_once() {
        let now = Instant::now();
        let mut messenger = Messenger::default();

        let bytes = messenger
            .begin(McuRequest::SetLed(Color::RED), now)
            .unwrap();
        let sequence = sent_sequence(&bytes);

        let completion = messenger
            .on_frame(reply(McuResponse::SetLed(Color::RED), sequence))
            .unwrap();
        assert_eq!(completion.outcome, Ok(McuResponse::SetLed(Color::RED)));
        assert!(messenger.is_idle());

        assert!(
            messenger
                .on_frame(reply(McuResponse::SetLed(Color::RED), sequence))
                .is_none()
        );
        assert!(messenger.poll_timeout(now + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn stale_sequence_is_ignored() {
        let now = Instant::now();
        let mut messenger = Messenger::default();

        let first = messenger.begin(McuRequest::Init, now).unwrap();
        let first_sequence = sent_sequence(&first);
        messenger.poll_timeout(now + DEFAULT_REQUEST_TIMEOUT).unwrap();

        let second = messenger.begin(McuRequest::Init, now).unwrap();
        assert_ne!(sent_sequence(&second), first_sequence);

        let late = reply(McuResponse::Init { protocol_version: None }, first_sequence);
        assert!(messenger.on_frame(late).is_none());
        assert!(!messenger.is_idle());
    }

    #[test]
    fn timeout_fires_at_deadline_only() {
        let now = Instant::now();
        let mut messenger = Messenger::new(Duration::from_secs(5));
        messenger.begin(McuRequest::RequestTelemetry, now).unwrap();

        assert!(messenger.poll_timeout(now + Duration::from_secs(4)).is_none());
        let completion = messenger.poll_timeout(now + Duration::from_secs(5)).unwrap();

        assert_eq!(completion.request, RequestId::RequestTelemetry);
        assert_eq!(completion.outcome, Err(McuFailure::TimedOut));
        assert_eq!(messenger.deadline(), None);
    }

    #[test]
    fn response_for_other_request_fails_the_pending_one() {
        let now = Instant::now();
        let mut messenger = Messenger::default();
        let sequence = sent_sequence(&messenger.begin(McuRequest::RequestTelemetry, now).unwrap());

        let completion = messenger
            .on_frame(reply(McuResponse::SetLed(Color::BLUE), sequence))
            .unwrap();

        assert_eq!(
            completion.outcome,
            Err(McuFailure::Mismatch {
                category: CATEGORY_MCU_TO_CLOUD,
                request_id: RequestId::SetLed as u16
            })
        );
    }

    #[test]
    fn nonzero_result_is_a_rejection() {
        let now = Instant::now();
        let mut messenger = Messenger::default();
        let sequence = sent_sequence(&messenger.begin(McuRequest::Init, now).unwrap());

        let completion = messenger
            .on_frame(Frame::Response(ResponseFrame {
                result: 4,
                ..McuResponse::Init { protocol_version: None }.into_frame(sequence)
            }))
            .unwrap();

        assert_eq!(completion.outcome, Err(McuFailure::Rejected(4)));
    }

    #[test]
    fn framing_error_fails_only_when_pending() {
        let now = Instant::now();
        let mut messenger = Messenger::default();

        assert!(
            messenger
                .on_framing_error(ProtocolError::InvalidLength(0xFFFF))
                .is_none()
        );

        messenger.begin(McuRequest::Init, now).unwrap();
        let completion = messenger
            .on_framing_error(ProtocolError::InvalidLength(0xFFFF))
            .unwrap();
        assert!(matches!(completion.outcome, Err(McuFailure::Framing(_))));
    }
}
