// Timeouts, topics, flywheel configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::debounce::DebounceType;
use crate::motor::{ActuatorConfiguration, DeviceId};
use crate::physics::{KG_PER_LB, M_PER_IN, MotorModel};

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_VELOCITY: &str = "flywheel/cmd/velocity"; // setpoints
pub const TOPIC_STATE_INPUTS: &str = "flywheel/state/inputs"; // telemetry
pub const TOPIC_HEALTH: &str = "flywheel/state/health"; // health status

// Serial port for the motor controller bus
pub const MOTOR_PORT: &str = "/dev/ttyACM0";

// Bus addresses of the two controllers
pub const LEADER_ID: DeviceId = 14;
pub const FOLLOWER_ID: DeviceId = 15;

// Rotor turns per flywheel turn
pub const GEAR_RATIO: f64 = 1.5;

// Broadcast rate for the telemetry we read
pub const STATUS_FRAME_RATE_HZ: f64 = 50.0;

// Connectivity must hold this long before it is reported
pub const CONNECTION_DEBOUNCE: Duration = Duration::from_millis(500);

// Simulation step, matches the loop period
pub const SIM_STEP: Duration = Duration::from_millis(1000 / LOOP_HZ);

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Physical parameters of the simulated flywheel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub motor: MotorModel,
    pub motor_count: u32,
    pub mass_kg: f64,
    pub radius_m: f64,
    pub step_s: f64,
    pub supply_voltage: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            motor: MotorModel::KrakenX60Foc,
            motor_count: 2,
            mass_kg: 8.0 * KG_PER_LB,
            radius_m: 1.5 * M_PER_IN,
            step_s: SIM_STEP.as_secs_f64(),
            supply_voltage: 12.0,
        }
    }
}

impl SimConfig {
    pub fn step(&self) -> Duration {
        Duration::from_secs_f64(self.step_s)
    }
}

/// Everything fixed at backend construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlywheelConfig {
    pub leader_id: DeviceId,
    pub follower_id: DeviceId,
    /// Follower is mounted facing the leader and must invert its output
    pub follower_opposes_leader: bool,
    pub gear_ratio: f64,
    pub status_frame_hz: f64,
    pub connection_debounce_s: f64,
    pub debounce_type: DebounceType,
    pub actuator: ActuatorConfiguration,
    pub sim: SimConfig,
}

impl Default for FlywheelConfig {
    fn default() -> Self {
        Self {
            leader_id: LEADER_ID,
            follower_id: FOLLOWER_ID,
            follower_opposes_leader: true,
            gear_ratio: GEAR_RATIO,
            status_frame_hz: STATUS_FRAME_RATE_HZ,
            connection_debounce_s: CONNECTION_DEBOUNCE.as_secs_f64(),
            debounce_type: DebounceType::Both,
            actuator: ActuatorConfiguration::default(),
            sim: SimConfig::default(),
        }
    }
}

impl FlywheelConfig {
    /// Load a JSON config; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn connection_debounce(&self) -> Duration {
        Duration::from_secs_f64(self.connection_debounce_s)
    }

    /// Reject values that make no physical sense
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("gear_ratio", self.gear_ratio)?;
        positive("status_frame_hz", self.status_frame_hz)?;
        positive("sim.mass_kg", self.sim.mass_kg)?;
        positive("sim.radius_m", self.sim.radius_m)?;
        positive("sim.step_s", self.sim.step_s)?;
        duration("sim.step_s", self.sim.step_s)?;
        duration("connection_debounce_s", self.connection_debounce_s)?;
        if self.sim.motor_count == 0 {
            return Err(ConfigError::Invalid {
                field: "sim.motor_count",
                reason: "at least one motor must drive the flywheel".to_string(),
            });
        }
        if self.leader_id == self.follower_id {
            return Err(ConfigError::Invalid {
                field: "follower_id",
                reason: format!("shares id {} with the leader", self.leader_id),
            });
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{} must be positive", value),
        })
    }
}

// `step()` and `connection_debounce()` convert without checking, so anything
// Duration cannot hold is rejected here
fn duration(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("{} s is not a duration: {}", secs, e),
    })
}
