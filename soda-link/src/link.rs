use std::time::Duration;

use soda_core::protocol::{FrameDecoder, McuRequest};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tracing::{instrument, warn};

use crate::{Completion, Messenger, MessengerError};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("messenger error: {0}")]
    Messenger(#[from] MessengerError),
    #[error("MCU transport closed")]
    Closed,
}

/// Framed request/response channel to the MCU over any byte stream.
pub struct McuLink<S> {
    stream: S,
    decoder: FrameDecoder,
    messenger: Messenger,
    scratch: [u8; 256],
}

impl<S> McuLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            messenger: Messenger::new(timeout),
            scratch: [0u8; 256],
        }
    }

    pub fn is_idle(&self) -> bool {
        self.messenger.is_idle()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.messenger.deadline()
    }

    /// Put `request` on the wire. A write failure clears the pending slot,
    /// so no completion follows an `Err`.
    pub async fn request(&mut self, request: McuRequest) -> Result<(), LinkError> {
        let bytes = self.messenger.begin(request, Instant::now())?;

        let written = async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await
        }
        .await;

        if let Err(e) = written {
            self.messenger.on_closed();
            return Err(e.into());
        }

        Ok(())
    }

    /// Wait for the next completion. Cancel safe: partially received frames
    /// stay buffered across calls.
    #[instrument(name = "mcu_recv", skip_all)]
    pub async fn recv(&mut self) -> Result<Completion, LinkError> {
        loop {
            while let Some(decoded) = self.decoder.next_frame() {
                let completion = match decoded {
                    Ok(frame) => self.messenger.on_frame(frame),
                    Err(e) => {
                        warn!(error = %e, "Discarding malformed frame from MCU");
                        self.messenger.on_framing_error(e)
                    }
                };

                if let Some(completion) = completion {
                    return Ok(completion);
                }
            }

            let room = self.decoder.free_space().min(self.scratch.len());
            let n = self.stream.read(&mut self.scratch[..room]).await?;
            if n == 0 {
                return Err(LinkError::Closed);
            }

            self.decoder.extend(&self.scratch[..n]);
        }
    }

    /// Fail the outstanding request if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Completion> {
        self.messenger.poll_timeout(now)
    }

    /// Fail the outstanding request after the transport broke.
    pub fn abort(&mut self) -> Option<Completion> {
        self.decoder.clear();
        self.messenger.on_closed()
    }
}
