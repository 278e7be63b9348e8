// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::flywheel::FlywheelInputs;

// Setpoint from teleop/scripts -> runtime, flywheel frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub velocity_rps: f64,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    /// Leader or follower not (yet) reporting telemetry
    ActuatorDisconnected,
}

// Published every cycle: health plus the telemetry it was derived from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FlywheelStatus {
    pub health: RuntimeHealth,
    pub inputs: FlywheelInputs,
}
