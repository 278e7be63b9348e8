use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flywheel_zenoh_runtime::clock::MonotonicClock;
use flywheel_zenoh_runtime::config::{FlywheelConfig, MOTOR_PORT};
use flywheel_zenoh_runtime::flywheel::{FlywheelIo, FlywheelIoHardware, FlywheelIoSim};
use flywheel_zenoh_runtime::motor::SerialBus;

/// Flywheel velocity runtime: zenoh setpoints in, telemetry out
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Run against the simulated flywheel instead of real controllers
    #[arg(long)]
    sim: bool,

    /// Serial port of the motor controller bus
    #[arg(long, default_value = MOTOR_PORT)]
    port: String,

    /// JSON config file; defaults are used for anything it leaves out
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();

    let io = match build_io(&args) {
        Ok(io) => io,
        Err(e) => {
            eprintln!("Startup error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = flywheel_zenoh_runtime::runtime::run(io).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

fn build_io(args: &Args) -> Result<Box<dyn FlywheelIo>, Box<dyn std::error::Error + Send + Sync>> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            FlywheelConfig::load(path)?
        }
        None => FlywheelConfig::default(),
    };

    if args.sim {
        info!("Using simulated flywheel");
        return Ok(Box::new(FlywheelIoSim::new(&config)));
    }

    info!("Opening motor bus on {}", args.port);
    let bus = SerialBus::open(&args.port)?;
    Ok(Box::new(FlywheelIoHardware::new(bus, MonotonicClock::new(), &config)))
}
