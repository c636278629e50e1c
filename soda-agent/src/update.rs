use std::time::Duration;

use serde::Deserialize;
use soda_core::ExitCode;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// How long one deferral postpones a pending install.
pub const DEFERRAL: Duration = Duration::from_secs(60);

/// Notifications from the platform update service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum UpdateEvent {
    NoUpdateAvailable,
    UpdateStarted,
    ReadyForInstall {
        status: InstallStatus,
        /// `None` when the platform could not describe the update.
        #[serde(default)]
        info: Option<UpdateInfo>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    /// Install can still be deferred.
    Pending,
    /// Install is imminent.
    Final,
    /// Our deferral took effect.
    Deferred,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UpdateInfo {
    pub update_type: UpdateType,
    #[serde(default)]
    pub max_deferral_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Invalid,
    App,
    System,
}

/// What the guard needs done in response to an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutput {
    /// Postpone the pending install.
    Defer(Duration),
    /// Let the pending install proceed.
    Resume,
    /// The update check is over.
    CheckComplete { reboot_required: bool },
    Failed(ExitCode),
}

/// Keeps platform updates from interrupting the business logic while making
/// sure they are never starved.
///
/// Reports completion exactly once, either from a platform notification or
/// from one of its two deadlines.
#[derive(Debug)]
pub struct UpdateGuard {
    check_timeout: Duration,
    download_timeout: Duration,
    check_deadline: Option<Instant>,
    download_deadline: Option<Instant>,
    business_logic_complete: bool,
    finished: bool,
}

impl Default for UpdateGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_TIMEOUT, DEFAULT_DOWNLOAD_TIMEOUT)
    }
}

impl UpdateGuard {
    pub fn new(check_timeout: Duration, download_timeout: Duration) -> Self {
        Self {
            check_timeout,
            download_timeout,
            check_deadline: None,
            download_deadline: None,
            business_logic_complete: false,
            finished: false,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.check_deadline = Some(now + self.check_timeout);
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Earliest armed deadline.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.check_deadline, self.download_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_business_logic_complete(&mut self) {
        self.business_logic_complete = true;
    }

    pub fn on_event(&mut self, event: UpdateEvent, now: Instant) -> Option<GuardOutput> {
        // Any notification proves the check ran.
        self.check_deadline = None;

        if self.finished {
            info!(?event, "Update check already complete, ignoring notification");
            return None;
        }

        match event {
            UpdateEvent::NoUpdateAvailable => {
                info!("No update available");
                self.complete(false)
            }
            UpdateEvent::UpdateStarted => {
                info!("Update download started");
                if self.download_deadline.is_none() {
                    self.download_deadline = Some(now + self.download_timeout);
                }
                None
            }
            UpdateEvent::ReadyForInstall { status, info } => {
                let Some(info) = info else {
                    warn!("Update is ready but its details are unavailable");
                    return self.fail(ExitCode::UpdateGetUpdateData);
                };

                info!(
                    update_type = ?info.update_type,
                    max_deferral_minutes = info.max_deferral_minutes,
                    ?status,
                    "Update ready for install"
                );

                match status {
                    InstallStatus::Pending if self.business_logic_complete => {
                        info!("Allowing update");
                        Some(GuardOutput::Resume)
                    }
                    InstallStatus::Pending => {
                        info!(deferral_secs = DEFERRAL.as_secs(), "Deferring update");
                        Some(GuardOutput::Defer(DEFERRAL))
                    }
                    InstallStatus::Final => {
                        info!("Final update, install is imminent");
                        self.complete(true)
                    }
                    InstallStatus::Deferred => {
                        info!("Update deferred");
                        None
                    }
                    InstallStatus::Complete => {
                        warn!(?status, "Unexpected update status");
                        self.fail(ExitCode::UpdateUnexpectedStatus)
                    }
                }
            }
        }
    }

    /// Fire whichever deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<GuardOutput> {
        let check_due = self.check_deadline.is_some_and(|d| now >= d);
        let download_due = self.download_deadline.is_some_and(|d| now >= d);

        if check_due {
            warn!("Timed out waiting for update check");
        } else if download_due {
            warn!("Timed out waiting for update download, not installing now");
        } else {
            return None;
        }

        self.complete(false)
    }

    /// A defer or resume request to the platform failed.
    pub fn on_platform_error(&mut self, code: ExitCode) -> Option<GuardOutput> {
        if self.finished {
            return None;
        }
        self.fail(code)
    }

    fn complete(&mut self, reboot_required: bool) -> Option<GuardOutput> {
        self.finish();
        Some(GuardOutput::CheckComplete { reboot_required })
    }

    fn fail(&mut self, code: ExitCode) -> Option<GuardOutput> {
        self.finish();
        Some(GuardOutput::Failed(code))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.check_deadline = None;
        self.download_deadline = None;
    }
}
