//! Flywheel velocity control boundary.
//!
//! Controllers only ever talk to [`FlywheelIo`]. Two implementations exist:
//! [`FlywheelIoHardware`] drives a leader/follower pair of motor controllers
//! over an [`ActuatorBus`][crate::motor::ActuatorBus], and [`FlywheelIoSim`]
//! wraps the same hardware backend around simulated controllers and a physics
//! model.
//!
//! Errors never cross this boundary. A failed telemetry refresh shows up as a
//! debounced `*_connected = false`; callers must check connectivity before
//! trusting position or velocity.

mod hardware;
mod sim;

pub use hardware::FlywheelIoHardware;
pub use sim::FlywheelIoSim;

use serde::{Deserialize, Serialize};

/// Telemetry snapshot, overwritten on every `update_inputs`
///
/// Position and velocity are always in the flywheel (mechanism) frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlywheelInputs {
    pub leader_connected: bool,
    pub follower_connected: bool,
    /// Flywheel position, rotations
    pub position_rot: f64,
    /// Flywheel velocity, rotations per second
    pub velocity_rps: f64,
    /// Leader output voltage, volts
    pub applied_volts: f64,
    pub leader_stator_amps: f64,
    pub follower_stator_amps: f64,
    pub leader_supply_amps: f64,
    pub follower_supply_amps: f64,
}

impl FlywheelInputs {
    pub fn all_connected(&self) -> bool {
        self.leader_connected && self.follower_connected
    }
}

/// Hardware abstraction for a velocity-controlled flywheel
///
/// Must be driven from a single control loop at a fixed cadence. No method
/// blocks indefinitely or returns an error.
pub trait FlywheelIo: Send {
    /// Refresh telemetry and overwrite every field of `inputs`
    fn update_inputs(&mut self, inputs: &mut FlywheelInputs);

    /// Command flywheel velocity in rotations per second
    ///
    /// The follower tracks through controller-level following; failure is only
    /// visible through later connectivity flags.
    fn set_velocity(&mut self, velocity_rps: f64);

    /// Command zero output
    fn stop(&mut self);
}

impl<T: FlywheelIo + ?Sized> FlywheelIo for Box<T> {
    fn update_inputs(&mut self, inputs: &mut FlywheelInputs) {
        (**self).update_inputs(inputs)
    }

    fn set_velocity(&mut self, velocity_rps: f64) {
        (**self).set_velocity(velocity_rps)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}
