use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("no command configured for {0}")]
    NoCommand(&'static str),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
    },
}

/// Terminal power requests. Callers do not expect control to come back in
/// any useful way once either succeeds.
#[async_trait]
pub trait PowerController: Send + Sync {
    async fn request_reboot(&self) -> Result<(), PowerError>;

    async fn request_powerdown(&self, residency: Duration) -> Result<(), PowerError>;
}

/// Only logs the request. For development machines.
#[derive(Debug, Default)]
pub struct LogPowerController;

#[async_trait]
impl PowerController for LogPowerController {
    async fn request_reboot(&self) -> Result<(), PowerError> {
        info!("Reboot requested");
        Ok(())
    }

    async fn request_powerdown(&self, residency: Duration) -> Result<(), PowerError> {
        info!(residency_secs = residency.as_secs(), "Power-down requested");
        Ok(())
    }
}

/// Runs external programs to reboot or power down the host.
#[derive(Debug, Clone)]
pub struct CommandPowerController {
    reboot: Vec<String>,
    powerdown: Vec<String>,
    min_residency: Duration,
}

impl CommandPowerController {
    pub fn new(reboot: Vec<String>, powerdown: Vec<String>, min_residency: Duration) -> Self {
        Self {
            reboot,
            powerdown,
            min_residency,
        }
    }

    async fn run(&self, what: &'static str, argv: &[String]) -> Result<(), PowerError> {
        let (program, args) = argv.split_first().ok_or(PowerError::NoCommand(what))?;
        info!(%program, ?args, "Running {what} command");

        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|source| PowerError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(PowerError::Failed {
                program: program.clone(),
                status,
            });
        }
        Ok(())
    }
}

/// Replace `{secs}` in each argument with the residency.
pub fn substitute_residency(argv: &[String], residency: Duration) -> Vec<String> {
    let secs = residency.as_secs().to_string();
    argv.iter().map(|arg| arg.replace("{secs}", &secs)).collect()
}

#[async_trait]
impl PowerController for CommandPowerController {
    async fn request_reboot(&self) -> Result<(), PowerError> {
        self.run("reboot", &self.reboot).await
    }

    async fn request_powerdown(&self, residency: Duration) -> Result<(), PowerError> {
        // Too short a residency is indistinguishable from a reboot.
        if residency < self.min_residency {
            warn!(
                residency_secs = residency.as_secs(),
                min_secs = self.min_residency.as_secs(),
                "Residency below minimum, rebooting instead"
            );
            return self.request_reboot().await;
        }

        let argv = substitute_residency(&self.powerdown, residency);
        self.run("powerdown", &argv).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn residency_is_substituted() {
        assert_eq!(
            substitute_residency(
                &argv(&["rtcwake", "-m", "off", "-s", "{secs}"]),
                Duration::from_secs(600)
            ),
            argv(&["rtcwake", "-m", "off", "-s", "600"])
        );
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let power = CommandPowerController::new(Vec::new(), Vec::new(), Duration::ZERO);
        assert!(matches!(
            power.request_reboot().await,
            Err(PowerError::NoCommand("reboot"))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn short_residency_falls_back_to_reboot() {
        let power = CommandPowerController::new(
            argv(&["true"]),
            argv(&["false"]),
            Duration::from_secs(10),
        );

        power.request_powerdown(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            power.request_powerdown(Duration::from_secs(60)).await,
            Err(PowerError::Failed { .. })
        ));
    }
}
