pub mod agent;
pub mod cloud;
pub mod config;
pub mod orchestrator;
pub mod platform;
pub mod power;
pub mod status;
pub mod store;
pub mod update;

pub use agent::{Agent, Collaborators, CycleSettings};
pub use cloud::{CloudClient, CloudGateway};
pub use config::{
    CloudBackend, Config, ConfigError, PowerConfig, ScopeId, StatusConfig, StorageConfig,
    UpdatePlatformConfig,
};
pub use orchestrator::{Action, CycleState, Event, Orchestrator};
pub use platform::UpdatePlatform;
pub use power::PowerController;
pub use status::StatusIndicator;
pub use store::TelemetryStore;
pub use update::{GuardOutput, UpdateEvent, UpdateGuard};
