// Headless spin-up of the simulated flywheel
//
// Usage: cargo run --example sim_spinup -- [velocity_rps] [config.json]

use flywheel_zenoh_runtime::config::FlywheelConfig;
use flywheel_zenoh_runtime::flywheel::{FlywheelInputs, FlywheelIo, FlywheelIoSim};

const SPIN_CYCLES: u32 = 100;
const COAST_CYCLES: u32 = 50;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let target: f64 = match args.next() {
        Some(arg) => arg.parse()?,
        None => 40.0,
    };
    let config = match args.next() {
        Some(path) => FlywheelConfig::load(path)?,
        None => FlywheelConfig::default(),
    };

    let mut sim = FlywheelIoSim::new(&config);
    let dt = sim.step().as_secs_f64();
    let mut inputs = FlywheelInputs::default();

    println!("Target: {:.1} rps, gear ratio {}, step {} ms", target, config.gear_ratio, dt * 1e3);
    println!();
    println!("   t (s)   vel (rps)   pos (rot)   volts    amps   connected");

    sim.set_velocity(target);
    for i in 0..SPIN_CYCLES {
        sim.update_inputs(&mut inputs);
        print_row(f64::from(i + 1) * dt, &inputs, sim.current_draw_amps());
    }

    println!();
    println!("Stopping, coasting down...");
    sim.stop();
    for i in 0..COAST_CYCLES {
        sim.update_inputs(&mut inputs);
        print_row(f64::from(SPIN_CYCLES + i + 1) * dt, &inputs, sim.current_draw_amps());
    }

    Ok(())
}

fn print_row(t: f64, inputs: &FlywheelInputs, amps: f64) {
    println!(
        "{:8.2} {:11.3} {:11.3} {:8.3} {:7.2}   {}",
        t,
        inputs.velocity_rps,
        inputs.position_rot,
        inputs.applied_volts,
        amps,
        if inputs.all_connected() { "yes" } else { "no" }
    );
}
