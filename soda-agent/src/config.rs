use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use soda_core::ExitCode;
use soda_link::Endpoint;
use thiserror::Error;

use crate::cloud::mock::MockCloudConfig;
use crate::platform::ScriptedUpdate;

/// Longest scope id the cloud client accepts.
pub const MAX_SCOPE_ID_LENGTH: usize = 16;

const SCOPE_ID_PLACEHOLDER: &str = "<scopeid>";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cycle: CycleConfig,
    pub cloud: CloudConfig,
    pub mcu: McuConfig,
    pub storage: StorageConfig,
    pub power: PowerConfig,
    pub status: StatusConfig,
    pub updates: UpdatesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Global deadline for the business logic
    pub timeout_secs: u64,
    /// Requested power-down duration at the end of a cycle
    pub powerdown_residency_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            powerdown_residency_secs: 60,
        }
    }
}

impl CycleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn residency(&self) -> Duration {
        Duration::from_secs(self.powerdown_residency_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    /// Provisioning scope, overridden by `--ScopeID`
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(flatten)]
    pub backend: CloudBackend,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CloudBackend {
    Mock(MockCloudConfig),
    Bridge {
        /// Address of the local cloud bridge
        addr: SocketAddr,
    },
}

impl Default for CloudBackend {
    fn default() -> Self {
        CloudBackend::Mock(MockCloudConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McuConfig {
    pub transport: TransportConfig,
    /// Per-request response timeout
    pub request_timeout_secs: u64,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::Tcp {
                addr: SocketAddr::from(([127, 0, 0, 1], 5555)),
            },
            request_timeout_secs: 5,
        }
    }
}

impl McuConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial { path: PathBuf },
    Tcp { addr: SocketAddr },
}

impl TransportConfig {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            TransportConfig::Serial { path } => Endpoint::Serial(path.clone()),
            TransportConfig::Tcp { addr } => Endpoint::Tcp(*addr),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PowerConfig {
    #[default]
    Log,
    Command {
        /// Program and arguments run to reboot
        reboot: Vec<String>,
        /// Program and arguments run to power down, `{secs}` is replaced
        /// with the residency
        powerdown: Vec<String>,
        #[serde(default)]
        min_residency_secs: u64,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatusConfig {
    #[default]
    Log,
    Sysfs {
        red: PathBuf,
        green: PathBuf,
        blue: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    pub check_timeout_secs: u64,
    pub download_timeout_secs: u64,
    #[serde(flatten)]
    pub platform: UpdatePlatformConfig,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 120,
            download_timeout_secs: 300,
            platform: UpdatePlatformConfig::default(),
        }
    }
}

impl UpdatesConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpdatePlatformConfig {
    None,
    Scripted {
        #[serde(default)]
        events: Vec<ScriptedUpdate>,
    },
}

impl Default for UpdatePlatformConfig {
    fn default() -> Self {
        UpdatePlatformConfig::Scripted {
            events: vec![ScriptedUpdate::no_update()],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("scope id is missing")]
    MissingScopeId,
    #[error("scope id is empty")]
    EmptyScopeId,
    #[error("scope id is still the <scopeid> placeholder")]
    PlaceholderScopeId,
    #[error("scope id is {0} characters, at most 16 are accepted")]
    ScopeIdTooLong(usize),
}

impl ConfigError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ConfigError::ScopeIdTooLong(_) => ExitCode::CloudInitInvalidScopeId,
            _ => ExitCode::ValidationScopeId,
        }
    }
}

/// A validated provisioning scope id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        let raw = raw.ok_or(ConfigError::MissingScopeId)?.trim();

        if raw.is_empty() {
            return Err(ConfigError::EmptyScopeId);
        }
        if raw == SCOPE_ID_PLACEHOLDER {
            return Err(ConfigError::PlaceholderScopeId);
        }

        let len = raw.chars().count();
        if len > MAX_SCOPE_ID_LENGTH {
            return Err(ConfigError::ScopeIdTooLong(len));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
