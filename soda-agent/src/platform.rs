//! Platform update service backends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::update::UpdateEvent;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to subscribe to update notifications: {0}")]
    Subscribe(String),
    #[error("failed to defer update: {0}")]
    Defer(String),
    #[error("failed to resume update: {0}")]
    Resume(String),
}

/// Source of platform update notifications, plus the controls to postpone
/// or release a pending install.
#[async_trait]
pub trait UpdatePlatform: Send + Sync {
    /// Start delivering notifications. Delivery stops when `cancel` fires.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<UpdateEvent>, UpdateError>;

    async fn defer(&self, duration: Duration) -> Result<(), UpdateError>;

    async fn resume(&self) -> Result<(), UpdateError>;
}

/// One notification of a scripted run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptedUpdate {
    /// Delay after subscription
    #[serde(default)]
    pub after_ms: u64,
    #[serde(flatten)]
    pub event: UpdateEvent,
}

impl ScriptedUpdate {
    pub fn new(after: Duration, event: UpdateEvent) -> Self {
        Self {
            after_ms: after.as_millis() as u64,
            event,
        }
    }

    pub fn no_update() -> Self {
        Self::new(Duration::ZERO, UpdateEvent::NoUpdateAvailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformCall {
    Defer(Duration),
    Resume,
}

pub type PlatformLog = Arc<Mutex<Vec<PlatformCall>>>;

/// Plays a fixed list of notifications and records defer/resume calls.
pub struct ScriptedPlatform {
    script: Vec<ScriptedUpdate>,
    calls: PlatformLog,
}

impl ScriptedPlatform {
    pub fn new(script: Vec<ScriptedUpdate>) -> Self {
        Self {
            script,
            calls: PlatformLog::default(),
        }
    }

    pub fn calls(&self) -> PlatformLog {
        self.calls.clone()
    }

    fn record(&self, call: PlatformCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl UpdatePlatform for ScriptedPlatform {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<UpdateEvent>, UpdateError> {
        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        let start = Instant::now();

        tokio::spawn(async move {
            for step in script {
                let at = start + Duration::from_millis(step.after_ms);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(at) => {}
                }

                debug!(event = ?step.event, "Delivering scripted update notification");
                if tx.send(step.event).await.is_err() {
                    return;
                }
            }

            // The platform keeps the subscription open for the whole cycle.
            cancel.cancelled().await;
        });

        Ok(rx)
    }

    async fn defer(&self, duration: Duration) -> Result<(), UpdateError> {
        info!(secs = duration.as_secs(), "Scripted platform deferring update");
        self.record(PlatformCall::Defer(duration));
        Ok(())
    }

    async fn resume(&self) -> Result<(), UpdateError> {
        info!("Scripted platform resuming update");
        self.record(PlatformCall::Resume);
        Ok(())
    }
}

/// A platform that never reports anything, leaving the guard to its
/// deadlines.
#[derive(Debug, Default)]
pub struct NoUpdates;

#[async_trait]
impl UpdatePlatform for NoUpdates {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<UpdateEvent>, UpdateError> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(tx);
        });
        Ok(rx)
    }

    async fn defer(&self, _duration: Duration) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), UpdateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripted_events_arrive_in_order() {
        let platform = ScriptedPlatform::new(vec![
            ScriptedUpdate::new(Duration::from_secs(2), UpdateEvent::UpdateStarted),
            ScriptedUpdate::new(Duration::from_secs(1), UpdateEvent::NoUpdateAvailable),
        ]);
        let cancel = CancellationToken::new();
        let mut rx = platform.subscribe(cancel.clone()).await.unwrap();

        // Delays are measured from subscription, so the second entry is
        // already due when the first is delivered.
        assert_eq!(rx.recv().await, Some(UpdateEvent::UpdateStarted));
        assert_eq!(rx.recv().await, Some(UpdateEvent::NoUpdateAvailable));

        cancel.cancel();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn defer_and_resume_are_recorded() {
        let platform = ScriptedPlatform::new(Vec::new());
        platform.defer(Duration::from_secs(60)).await.unwrap();
        platform.resume().await.unwrap();

        let calls = platform.calls();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![PlatformCall::Defer(Duration::from_secs(60)), PlatformCall::Resume]
        );
    }
}
