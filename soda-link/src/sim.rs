//! A stand-in for the soda machine MCU, speaking the device side of the
//! wire protocol. Used by the development harness and by tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use soda_core::{
    Color, DeviceTelemetry,
    protocol::{Frame, FrameDecoder, McuRequest, McuResponse, PROTOCOL_VERSION, RequestId},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::LinkError;

/// Requests the simulated MCU has received, shared with observers.
pub type RequestLog = Arc<Mutex<Vec<McuRequest>>>;

pub struct SimulatedMcu {
    telemetry: DeviceTelemetry,
    led: Color,
    silent: HashSet<RequestId>,
    log: RequestLog,
}

impl SimulatedMcu {
    pub fn new(telemetry: DeviceTelemetry) -> Self {
        Self {
            telemetry,
            led: Color::BLACK,
            silent: HashSet::new(),
            log: RequestLog::default(),
        }
    }

    /// Never answer requests of this kind.
    pub fn silent_on(mut self, request: RequestId) -> Self {
        self.silent.insert(request);
        self
    }

    pub fn request_log(&self) -> RequestLog {
        self.log.clone()
    }

    pub fn telemetry_mut(&mut self) -> &mut DeviceTelemetry {
        &mut self.telemetry
    }

    pub fn led(&self) -> Color {
        self.led
    }

    /// Apply a request and build the response, if this MCU answers it.
    pub fn handle(&mut self, request: McuRequest) -> Option<McuResponse> {
        if let Ok(mut log) = self.log.lock() {
            log.push(request);
        }

        if self.silent.contains(&request.id()) {
            debug!(?request, "Simulated MCU staying silent");
            return None;
        }

        let response = match request {
            McuRequest::Init => McuResponse::Init {
                protocol_version: Some(PROTOCOL_VERSION),
            },
            McuRequest::RequestTelemetry => McuResponse::Telemetry(self.telemetry),
            McuRequest::SetLed(color) => {
                self.led = color;
                McuResponse::SetLed(color)
            }
        };

        Some(response)
    }

    /// Answer requests arriving on `stream` until it closes or `cancel` fires.
    #[instrument(name = "simulated_mcu", skip_all)]
    pub async fn serve<S>(&mut self, mut stream: S, cancel: CancellationToken) -> Result<(), LinkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut tmp = [0u8; 256];

        loop {
            while let Some(decoded) = decoder.next_frame() {
                let frame = match decoded {
                    Ok(Frame::Request(frame)) => frame,
                    Ok(other) => {
                        warn!(frame = ?other, "Simulated MCU ignoring non-request frame");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Simulated MCU discarding malformed frame");
                        continue;
                    }
                };

                let request = match McuRequest::from_frame(&frame) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Simulated MCU ignoring unknown request");
                        continue;
                    }
                };

                if let Some(response) = self.handle(request) {
                    let bytes = Frame::Response(response.into_frame(frame.sequence))
                        .to_bytes()
                        .map_err(crate::MessengerError::Encode)?;
                    stream.write_all(&bytes).await?;
                    stream.flush().await?;
                }
            }

            let room = decoder.free_space().min(tmp.len());
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Simulated MCU shutting down");
                    return Ok(());
                }
                read = stream.read(&mut tmp[..room]) => {
                    let n = read?;
                    if n == 0 {
                        info!("Controller closed the link");
                        return Ok(());
                    }
                    decoder.extend(&tmp[..n]);
                }
            }
        }
    }
}
