//! Status LED shown while a cycle is running.

use std::path::PathBuf;

use async_trait::async_trait;
use soda_core::Color;
use tracing::{info, warn};

#[async_trait]
pub trait StatusIndicator: Send + Sync {
    /// Cycle started: green on.
    async fn notify_starting(&self);

    /// Cycle over: everything off. Safe to call more than once.
    async fn notify_finished(&self);
}

#[derive(Debug, Default)]
pub struct LogStatus;

#[async_trait]
impl StatusIndicator for LogStatus {
    async fn notify_starting(&self) {
        info!(color = %Color::GREEN, "Status LED on");
    }

    async fn notify_finished(&self) {
        info!("Status LED off");
    }
}

/// Three GPIO lines exposed as sysfs `value` files. The LED is wired active
/// low, so writing "0" lights a channel.
#[derive(Debug, Clone)]
pub struct SysfsStatus {
    red: PathBuf,
    green: PathBuf,
    blue: PathBuf,
}

impl SysfsStatus {
    pub fn new(red: PathBuf, green: PathBuf, blue: PathBuf) -> Self {
        Self { red, green, blue }
    }

    async fn show(&self, color: Color) {
        for (path, on) in [
            (&self.red, color.red),
            (&self.green, color.green),
            (&self.blue, color.blue),
        ] {
            let level = if on { "0" } else { "1" };
            if let Err(e) = tokio::fs::write(path, level).await {
                warn!(path = ?path, error = %e, "Failed to set status LED");
            }
        }
    }
}

#[async_trait]
impl StatusIndicator for SysfsStatus {
    async fn notify_starting(&self) {
        self.show(Color::GREEN).await;
    }

    async fn notify_finished(&self) {
        self.show(Color::BLACK).await;
    }
}
