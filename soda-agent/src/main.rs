use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use soda_agent::cloud::{bridge::BridgeCloud, mock::MockCloud};
use soda_agent::platform::{NoUpdates, ScriptedPlatform};
use soda_agent::power::{CommandPowerController, LogPowerController};
use soda_agent::status::{LogStatus, SysfsStatus};
use soda_agent::store::{FileStore, MemoryStore};
use soda_agent::{
    Agent, CloudBackend, Collaborators, Config, CycleSettings, PowerConfig, ScopeId,
    StatusConfig, StorageConfig, UpdatePlatformConfig,
};
use soda_core::ExitCode;
use soda_link::McuLink;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "soda-agent")]
#[command(about = "Soda machine cloud agent")]
struct Cli {
    /// Cloud provisioning scope ID
    #[arg(short = 's', long = "ScopeID")]
    scope_id: Option<String>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "soda-agent.toml")]
    config: PathBuf,
}

fn main() -> color_eyre::Result<std::process::ExitCode> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "soda_agent=info,soda_link=info".to_owned());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = ?e, path = ?cli.config, "Failed to load configuration");
            return Ok(ExitCode::InitConfig.into());
        }
    };

    let raw_scope_id = cli.scope_id.as_deref().or(config.cloud.scope_id.as_deref());
    let scope_id = match ScopeId::parse(raw_scope_id) {
        Ok(scope_id) => scope_id,
        Err(e) => {
            error!(error = %e, "Invalid scope ID, pass --ScopeID or set cloud.scope_id");
            return Ok(e.exit_code().into());
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create event loop");
            return Ok(ExitCode::InitEventLoop.into());
        }
    };

    let code = runtime.block_on(run(config, scope_id));
    Ok(code.into())
}

fn load_config(path: &Path) -> color_eyre::Result<Config> {
    if path.exists() {
        info!(path = ?path, "Loading configuration");
        Config::load(path)
    } else {
        info!("No configuration file found, using defaults");
        Ok(Config::default())
    }
}

async fn run(config: Config, scope_id: ScopeId) -> ExitCode {
    info!(
        %scope_id,
        timeout_secs = config.cycle.timeout_secs,
        residency_secs = config.cycle.powerdown_residency_secs,
        "Starting soda-agent"
    );

    let endpoint = config.mcu.transport.endpoint();
    let stream = match endpoint.open().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(%endpoint, error = %e, "Failed to open MCU transport");
            return ExitCode::McuTransportOpen;
        }
    };

    let link = McuLink::new(stream, config.mcu.request_timeout());
    let settings = CycleSettings::from(&config);
    let services = collaborators(&config);

    match &config.cloud.backend {
        CloudBackend::Mock(mock) => {
            info!("Using mock cloud");
            Agent::new(scope_id, settings, MockCloud::new(mock.clone()), link, services)
                .run()
                .await
        }
        CloudBackend::Bridge { addr } => {
            info!(%addr, "Using cloud bridge");
            Agent::new(scope_id, settings, BridgeCloud::new(*addr), link, services)
                .run()
                .await
        }
    }
}

fn collaborators(config: &Config) -> Collaborators {
    let store: Box<dyn soda_agent::TelemetryStore> = match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            Box::new(MemoryStore::default())
        }
        StorageConfig::File { path } => {
            info!(path = ?path, "Using file storage");
            Box::new(FileStore::new(path.clone()))
        }
    };

    let power: Box<dyn soda_agent::PowerController> = match &config.power {
        PowerConfig::Log => Box::new(LogPowerController),
        PowerConfig::Command {
            reboot,
            powerdown,
            min_residency_secs,
        } => Box::new(CommandPowerController::new(
            reboot.clone(),
            powerdown.clone(),
            Duration::from_secs(*min_residency_secs),
        )),
    };

    let status: Box<dyn soda_agent::StatusIndicator> = match &config.status {
        StatusConfig::Log => Box::new(LogStatus),
        StatusConfig::Sysfs { red, green, blue } => {
            Box::new(SysfsStatus::new(red.clone(), green.clone(), blue.clone()))
        }
    };

    let updates: Box<dyn soda_agent::UpdatePlatform> = match &config.updates.platform {
        UpdatePlatformConfig::None => Box::new(NoUpdates),
        UpdatePlatformConfig::Scripted { events } => {
            info!(count = events.len(), "Using scripted update notifications");
            Box::new(ScriptedPlatform::new(events.clone()))
        }
    };

    Collaborators {
        store,
        power,
        status,
        updates,
    }
}
