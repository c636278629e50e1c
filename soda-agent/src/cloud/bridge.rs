//! Cloud client that talks to a local bridge process over TCP.
//!
//! The bridge owns the vendor cloud SDK. Messages are newline-delimited JSON
//! objects tagged by `type`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{ClientEvent, CloudClient};
use crate::config::ScopeId;

/// First reconnect delay after the bridge drops or refuses.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(600);
/// Keepalive period the bridge should use with the cloud.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bridge client is already connected")]
    AlreadyConnected,

    #[error("Internal channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Connect {
        scope_id: String,
        keepalive_secs: u64,
    },
    Telemetry {
        token: u32,
        body: serde_json::Value,
    },
    ReportState {
        token: u32,
        body: serde_json::Value,
    },
    MethodResponse {
        request_id: u64,
        status: u16,
        body: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Connection {
        connected: bool,
    },
    Twin {
        payload: serde_json::Value,
    },
    TelemetryAck {
        token: u32,
        success: bool,
    },
    ReportedAck {
        token: u32,
        success: bool,
    },
    DirectMethod {
        request_id: u64,
        method: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl From<Inbound> for ClientEvent {
    fn from(message: Inbound) -> Self {
        match message {
            Inbound::Connection { connected } => ClientEvent::Connection { connected },
            Inbound::Twin { payload } => ClientEvent::Twin {
                payload: payload.to_string(),
            },
            Inbound::TelemetryAck { token, success } => {
                ClientEvent::TelemetryConfirmed { token, success }
            }
            Inbound::ReportedAck { token, success } => {
                ClientEvent::ReportedStateConfirmed { token, success }
            }
            Inbound::DirectMethod {
                request_id,
                method,
                payload,
            } => ClientEvent::DirectMethod {
                request_id,
                method,
                payload: payload.to_string(),
            },
        }
    }
}

pub fn next_reconnect_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RECONNECT_DELAY)
}

pub struct BridgeCloud {
    addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    pending: Option<mpsc::Receiver<Outbound>>,
}

impl BridgeCloud {
    pub fn new(addr: SocketAddr) -> Self {
        let (outbound, pending) = mpsc::channel(32);
        Self {
            addr,
            outbound,
            pending: Some(pending),
        }
    }

    async fn enqueue(&self, message: Outbound) -> Result<(), BridgeError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

#[async_trait]
impl CloudClient for BridgeCloud {
    type Error = BridgeError;

    async fn connect(
        &mut self,
        scope_id: &ScopeId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ClientEvent>, Self::Error> {
        let outbound = self.pending.take().ok_or(BridgeError::AlreadyConnected)?;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(run_bridge_loop(
            self.addr,
            scope_id.to_string(),
            outbound,
            tx,
            cancel,
        ));

        Ok(rx)
    }

    async fn send_event(&self, body: String, token: u32) -> Result<(), Self::Error> {
        let body = serde_json::from_str(&body)?;
        self.enqueue(Outbound::Telemetry { token, body }).await
    }

    async fn report_state(&self, body: String, token: u32) -> Result<(), Self::Error> {
        let body = serde_json::from_str(&body)?;
        self.enqueue(Outbound::ReportState { token, body }).await
    }

    async fn respond_to_method(
        &self,
        request_id: u64,
        status: u16,
        body: String,
    ) -> Result<(), Self::Error> {
        let body = serde_json::from_str(&body)?;
        self.enqueue(Outbound::MethodResponse {
            request_id,
            status,
            body,
        })
        .await
    }
}

#[instrument(name = "bridge_loop", skip(scope_id, outbound, tx, cancel))]
async fn run_bridge_loop(
    addr: SocketAddr,
    scope_id: String,
    mut outbound: mpsc::Receiver<Outbound>,
    tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    let mut delay = MIN_RECONNECT_DELAY;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            stream = TcpStream::connect(addr) => stream,
        };

        match connected {
            Ok(stream) => {
                info!("Connected to cloud bridge");
                delay = MIN_RECONNECT_DELAY;

                let mut announced = false;
                let result =
                    run_session(stream, &scope_id, &mut outbound, &tx, &cancel, &mut announced)
                        .await;

                if let Err(e) = &result {
                    error!(error = %e, "Cloud bridge session failed");
                }
                if announced
                    && tx
                        .send(ClientEvent::Connection { connected: false })
                        .await
                        .is_err()
                {
                    break;
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to reach cloud bridge");
            }
        }

        info!(secs = delay.as_secs(), "Retrying cloud bridge connection");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        delay = next_reconnect_delay(delay);
    }

    info!("Cloud bridge loop stopped");
}

async fn run_session(
    stream: TcpStream,
    scope_id: &str,
    outbound: &mut mpsc::Receiver<Outbound>,
    tx: &mpsc::Sender<ClientEvent>,
    cancel: &CancellationToken,
    announced: &mut bool,
) -> Result<(), BridgeError> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let hello = Outbound::Connect {
        scope_id: scope_id.to_owned(),
        keepalive_secs: KEEPALIVE_PERIOD.as_secs(),
    };
    write_message(&mut write, &hello).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown signal received");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Cloud bridge closed the connection");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }

                let message: Inbound = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed bridge message");
                        continue;
                    }
                };
                debug!(?message, "Bridge message");

                if let Inbound::Connection { connected } = message {
                    *announced = connected;
                }
                tx.send(message.into()).await.map_err(|_| BridgeError::ChannelClosed)?;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    return Ok(());
                };
                write_message(&mut write, &message).await?;
            }
        }
    }
}

async fn write_message<W>(write: &mut W, message: &Outbound) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    write.write_all(&line).await?;
    write.flush().await?;
    Ok(())
}
