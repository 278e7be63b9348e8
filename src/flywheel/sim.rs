// Simulated flywheel backend
//
// Owns a hardware backend running on simulated controllers. Each step feeds
// the leader's output voltage through the flywheel physics and writes the
// resulting rotor motion and currents back into the controllers, then lets the
// hardware backend read them out exactly as it would on a real bus.

use std::time::Duration;

use tracing::info;

use super::{FlywheelInputs, FlywheelIo, FlywheelIoHardware};
use crate::clock::ManualClock;
use crate::config::FlywheelConfig;
use crate::motor::{DeviceId, SimBus};
use crate::physics::{
    ConstantSupply, DcMotor, FlywheelPlant, PowerSupply, disk_moi, rot_to_rad,
};

pub struct FlywheelIoSim {
    hardware: FlywheelIoHardware<SimBus, ManualClock>,
    clock: ManualClock,
    plant: FlywheelPlant,
    /// One of the motors driving the plant, for per-controller currents
    single_motor: DcMotor,
    supply: Box<dyn PowerSupply>,
    leader: DeviceId,
    follower: DeviceId,
    follower_sign: f64,
    step: Duration,
}

impl FlywheelIoSim {
    pub fn new(config: &FlywheelConfig) -> Self {
        Self::with_supply(config, Box::new(ConstantSupply(config.sim.supply_voltage)))
    }

    pub fn with_supply(config: &FlywheelConfig, supply: Box<dyn PowerSupply>) -> Self {
        let sim = &config.sim;
        let clock = ManualClock::new();
        let bus = SimBus::new(&[config.leader_id, config.follower_id]);
        let hardware = FlywheelIoHardware::new(bus, clock.clone(), config);

        let moi = disk_moi(sim.mass_kg, sim.radius_m);
        let motor = DcMotor::from_model(sim.motor, sim.motor_count);
        info!(
            "Simulating flywheel: {:?} x{}, moi {:.6} kg*m^2, step {:?}",
            sim.motor,
            sim.motor_count,
            moi,
            sim.step()
        );

        Self {
            hardware,
            clock,
            plant: FlywheelPlant::new(motor, moi, config.gear_ratio),
            single_motor: DcMotor::from_model(sim.motor, 1),
            supply,
            leader: config.leader_id,
            follower: config.follower_id,
            follower_sign: if config.follower_opposes_leader { -1.0 } else { 1.0 },
            step: sim.step(),
        }
    }

    /// Step used by `update_inputs`
    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn bus(&self) -> &SimBus {
        self.hardware.bus()
    }

    pub fn bus_mut(&mut self) -> &mut SimBus {
        self.hardware.bus_mut()
    }

    /// Flywheel velocity straight from the physics model, rotations per second
    pub fn mechanism_velocity_rps(&self) -> f64 {
        self.plant.angular_velocity_rps()
    }

    /// Total current drawn by the motors
    pub fn current_draw_amps(&self) -> f64 {
        self.plant.current_draw_amps()
    }

    /// Advance the simulated controllers and physics by `dt`
    ///
    /// Does not read telemetry; `update_inputs` does that after stepping.
    pub fn advance(&mut self, dt: Duration) {
        let dt_s = dt.as_secs_f64();
        let supply = self.supply.voltage();
        let (leader, follower) = (self.leader, self.follower);

        let bus = self.hardware.bus_mut();
        for id in [leader, follower] {
            if let Some(dev) = bus.device_mut(id) {
                dev.supply_voltage = supply;
            }
        }

        // Controllers compute their output from last step's rotor state
        bus.update_outputs(dt_s);
        let volts = bus.device(leader).map_or(0.0, |d| d.motor_voltage);

        self.plant.set_input_voltage(volts);
        self.plant.update(dt_s);

        // The plant reports the flywheel; controllers see the rotor
        let rotor_rps = self.plant.angular_velocity_rps() * self.hardware.gear_ratio();
        let stator = self.single_motor.current(rot_to_rad(rotor_rps), volts);
        let supply_amps = if supply > 0.0 {
            stator * volts / supply
        } else {
            0.0
        };

        let bus = self.hardware.bus_mut();
        if let Some(dev) = bus.device_mut(leader) {
            dev.rotor_velocity_rps = rotor_rps;
            dev.rotor_position_rot += rotor_rps * dt_s;
            dev.stator_current = stator;
            dev.supply_current = supply_amps;
        }
        if let Some(dev) = bus.device_mut(follower) {
            dev.rotor_velocity_rps = self.follower_sign * rotor_rps;
            dev.rotor_position_rot += self.follower_sign * rotor_rps * dt_s;
            dev.stator_current = self.follower_sign * stator;
            dev.supply_current = supply_amps;
        }

        self.clock.advance(dt);
    }
}

impl FlywheelIo for FlywheelIoSim {
    /// Advance one fixed step, then read telemetry through the hardware path
    ///
    /// Assumes it is called once per step; calling at a different cadence
    /// desynchronises simulated time from wall time.
    fn update_inputs(&mut self, inputs: &mut FlywheelInputs) {
        self.advance(self.step);
        self.hardware.update_inputs(inputs);
    }

    fn set_velocity(&mut self, velocity_rps: f64) {
        self.hardware.set_velocity(velocity_rps);
    }

    fn stop(&mut self) {
        self.hardware.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::SimConfig;
    use crate::motor::StatusCode;
    use crate::physics::{KG_PER_LB, M_PER_IN};

    fn reference_config() -> FlywheelConfig {
        FlywheelConfig {
            gear_ratio: 1.5,
            sim: SimConfig {
                mass_kg: 8.0 * KG_PER_LB,
                radius_m: 1.5 * M_PER_IN,
                ..SimConfig::default()
            },
            ..FlywheelConfig::default()
        }
    }

    fn run(sim: &mut FlywheelIoSim, cycles: usize) -> Vec<FlywheelInputs> {
        let mut inputs = FlywheelInputs::default();
        (0..cycles)
            .map(|_| {
                sim.update_inputs(&mut inputs);
                inputs
            })
            .collect()
    }

    #[test]
    fn test_zero_command_stays_at_rest() {
        let mut sim = FlywheelIoSim::new(&reference_config());
        sim.stop();

        for inputs in run(&mut sim, 50) {
            assert_eq!(inputs.velocity_rps, 0.0);
            assert_eq!(inputs.applied_volts, 0.0);
        }
        assert_eq!(sim.mechanism_velocity_rps(), 0.0);
    }

    #[test]
    fn test_zero_setpoint_stays_at_rest() {
        let mut sim = FlywheelIoSim::new(&reference_config());
        sim.set_velocity(0.0);

        let history = run(&mut sim, 50);
        assert_eq!(history.last().unwrap().velocity_rps, 0.0);
    }

    #[test]
    fn test_step_response_is_monotonic_without_overshoot() {
        let target = 40.0;
        let mut sim = FlywheelIoSim::new(&reference_config());
        sim.set_velocity(target);

        let history = run(&mut sim, 100);
        let mut last = 0.0;
        for inputs in &history {
            assert!(
                inputs.velocity_rps >= last - 1e-9,
                "velocity fell from {last} to {}",
                inputs.velocity_rps
            );
            assert!(inputs.velocity_rps <= target * 1.01);
            last = inputs.velocity_rps;
        }

        let settled = history.last().unwrap().velocity_rps;
        assert!((settled - target).abs() / target < 0.01, "settled at {settled}");
    }

    #[test]
    fn test_setpoints_converge_across_voltage_range() {
        for target in [-50.0, -10.0, 5.0, 25.0, 50.0] {
            let mut sim = FlywheelIoSim::new(&reference_config());
            sim.set_velocity(target);

            let settled = run(&mut sim, 150).last().unwrap().velocity_rps;
            assert!(
                (settled - target).abs() / target.abs() < 0.01,
                "target {target}, settled at {settled}"
            );
        }
    }

    #[test]
    fn test_stop_decays_and_second_stop_changes_nothing() {
        let mut once = FlywheelIoSim::new(&reference_config());
        let mut twice = FlywheelIoSim::new(&reference_config());
        for sim in [&mut once, &mut twice] {
            sim.set_velocity(40.0);
            run(sim, 50);
        }

        once.stop();
        twice.stop();
        twice.stop();

        let a = run(&mut once, 50);
        let b = run(&mut twice, 50);
        assert_eq!(a, b);

        let mut last = a[0].velocity_rps;
        for inputs in &a[1..] {
            assert!(inputs.velocity_rps <= last);
            assert!(inputs.velocity_rps >= 0.0);
            last = inputs.velocity_rps;
        }
        assert!(last < 1.0, "still spinning at {last}");
    }

    #[test]
    fn test_telemetry_matches_plant_through_gear_ratio() {
        for gear_ratio in [1.0, 1.5] {
            let config = FlywheelConfig {
                gear_ratio,
                ..reference_config()
            };
            let mut sim = FlywheelIoSim::new(&config);
            sim.set_velocity(20.0);
            let inputs = run(&mut sim, 10).pop().unwrap();

            let rotor = sim.bus().device(config.leader_id).unwrap().rotor_velocity_rps;
            assert!((inputs.velocity_rps - rotor / gear_ratio).abs() < 1e-12);
            assert!((inputs.velocity_rps - sim.mechanism_velocity_rps()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_position_integrates_velocity() {
        let mut sim = FlywheelIoSim::new(&reference_config());
        sim.set_velocity(30.0);
        let history = run(&mut sim, 100);

        let dt = sim.step().as_secs_f64();
        let integrated: f64 = history.iter().map(|i| i.velocity_rps * dt).sum();
        let position = history.last().unwrap().position_rot;
        assert!((position - integrated).abs() < 1e-9, "{position} != {integrated}");
    }

    #[test]
    fn test_follower_mirrors_leader() {
        let mut sim = FlywheelIoSim::new(&reference_config());
        sim.set_velocity(30.0);
        // still accelerating, so currents are well away from zero
        let inputs = run(&mut sim, 5).pop().unwrap();

        let bus = sim.bus();
        let leader = bus.device(14).unwrap();
        let follower = bus.device(15).unwrap();
        assert_eq!(follower.motor_voltage, -leader.motor_voltage);
        assert_eq!(follower.rotor_velocity_rps, -leader.rotor_velocity_rps);
        assert_eq!(inputs.follower_stator_amps, -inputs.leader_stator_amps);
        assert!(inputs.leader_supply_amps > 0.0);
    }

    #[test]
    fn test_connects_after_debounce_window_of_sim_time() {
        let mut sim = FlywheelIoSim::new(&reference_config());
        let history = run(&mut sim, 30);

        // 20 ms steps: connected from the 25th step (500 ms) on
        assert!(!history[23].leader_connected);
        assert!(history[24].leader_connected);
        assert!(history[29].all_connected());
    }

    #[test]
    fn test_injected_disconnect_reported() {
        let mut sim = FlywheelIoSim::new(&reference_config());
        run(&mut sim, 30);

        sim.bus_mut().inject_fault(14, Some(StatusCode::DeviceFault(0x04)));
        let history = run(&mut sim, 25);
        // reported only once the fault has lasted the debounce window
        assert!(history[..24].iter().all(|i| i.leader_connected));
        assert!(!history[24].leader_connected);
        assert!(history[24].follower_connected);

        sim.bus_mut().inject_fault(14, None);
        let inputs = run(&mut sim, 25).pop().unwrap();
        assert!(inputs.all_connected());
    }

    #[test]
    fn test_sagging_supply_limits_output() {
        let supply = || 10.0;
        let mut sim = FlywheelIoSim::with_supply(&reference_config(), Box::new(supply));
        sim.set_velocity(60.0);
        let inputs = run(&mut sim, 1).pop().unwrap();
        assert_eq!(inputs.applied_volts, 10.0);
    }

    #[test]
    fn test_advance_accumulates_sim_time() {
        let mut coarse = FlywheelIoSim::new(&reference_config());
        let mut fine = FlywheelIoSim::new(&reference_config());
        coarse.stop();
        fine.stop();

        coarse.advance(Duration::from_millis(40));
        fine.advance(Duration::from_millis(20));
        fine.advance(Duration::from_millis(20));

        // nothing commanded, both at rest after the same simulated time
        assert_eq!(coarse.mechanism_velocity_rps(), fine.mechanism_velocity_rps());
        assert_eq!(coarse.clock.now(), fine.clock.now());
    }
}
