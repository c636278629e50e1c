use std::net::SocketAddr;

use clap::Parser;
use rand::Rng;
use soda_core::{DeviceTelemetry, protocol::RequestId};
use soda_link::sim::SimulatedMcu;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "soda-harness")]
#[command(about = "Serve a simulated soda machine MCU over TCP")]
struct Cli {
    /// Address the agent connects to
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    listen: SocketAddr,

    /// Lifetime dispenses at startup
    #[arg(long, default_value_t = 0)]
    dispensed: u32,

    /// Machine capacity, also the restock amount
    #[arg(long, default_value_t = 100)]
    capacity: u32,

    /// Most units dispensed between two cycles
    #[arg(long, default_value_t = 5)]
    max_dispenses: u32,

    /// Never answer telemetry requests
    #[arg(long)]
    silent: bool,
}

/// Simulate customers between two cycles, restocking an empty machine.
fn simulate_sales(telemetry: &mut DeviceTelemetry, max_dispenses: u32) {
    let mut rng = rand::rng();

    let remaining = telemetry
        .lifetime_total_stocked_dispenses
        .saturating_sub(telemetry.lifetime_total_dispenses);
    let sold = rng.random_range(0..=max_dispenses).min(remaining);
    telemetry.lifetime_total_dispenses += sold;

    if remaining == sold {
        info!(capacity = telemetry.capacity, "Machine empty, restocking");
        telemetry.lifetime_total_stocked_dispenses += telemetry.capacity;
    }

    telemetry.battery_level = (telemetry.battery_level - rng.random_range(0.0..0.02)).max(3.0);
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "soda_harness=info,soda_link=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut mcu = SimulatedMcu::new(DeviceTelemetry {
        lifetime_total_dispenses: cli.dispensed,
        lifetime_total_stocked_dispenses: cli.dispensed + cli.capacity,
        capacity: cli.capacity,
        battery_level: 4.1,
    });
    if cli.silent {
        mcu = mcu.silent_on(RequestId::RequestTelemetry);
    }

    let listener = TcpListener::bind(cli.listen).await?;
    info!(addr = %cli.listen, "Simulated MCU listening");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        info!(%peer, "Agent connected");
        stream.set_nodelay(true)?;

        simulate_sales(mcu.telemetry_mut(), cli.max_dispenses);

        if let Err(e) = mcu.serve(stream, cancel.clone()).await {
            error!(%peer, error = %e, "Session failed");
        }
        info!(%peer, led = %mcu.led(), "Agent disconnected");
    }

    info!("Simulated MCU stopped");
    Ok(())
}
