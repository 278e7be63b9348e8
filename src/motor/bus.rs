// Actuator bus boundary
//
// Everything the flywheel backends need from a smart motor controller:
// configuration, control requests, telemetry reads and frame-rate management.
// Each method is one round trip to one device.

use serde::{Deserialize, Serialize};

/// Bus address of a motor controller
pub type DeviceId = u8;

/// Telemetry a controller can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signal {
    /// Rotor position, rotations
    Position,
    /// Rotor velocity, rotations per second
    Velocity,
    /// Output voltage applied to the motor, volts
    MotorVoltage,
    /// Current through the motor windings, amps
    StatorCurrent,
    /// Current drawn from the supply, amps
    SupplyCurrent,
}

impl Signal {
    /// Position in the controller's register layout
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Output behavior when no effort is commanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeutralMode {
    #[default]
    Coast,
    Brake,
}

/// Closed-loop gains, rotor units (volts per rps and friends)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Static feedforward, volts, applied in the direction of the setpoint
    pub ks: f64,
    /// Velocity feedforward, volts per rps
    pub kv: f64,
    /// Acceleration feedforward, volts per rps^2
    pub ka: f64,
}

impl Default for SlotGains {
    fn default() -> Self {
        Self {
            kp: 0.4,
            ki: 0.0,
            kd: 0.0,
            ks: 0.01,
            kv: 0.123,
            ka: 0.0,
        }
    }
}

/// Configuration applied identically to leader and follower
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfiguration {
    pub neutral_mode: NeutralMode,
    pub slot0: SlotGains,
}

/// What a controller should be doing with its output
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ControlRequest {
    /// Closed-loop velocity with feedforward, rotor frame
    VelocityVoltage {
        velocity_rps: f64,
        acceleration_rps2: f64,
    },
    /// Mirror another controller's output, optionally inverted
    Follower { leader: DeviceId, oppose_leader: bool },
    /// Zero output; coast or brake per the neutral mode
    #[default]
    Neutral,
}

/// Error types for bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from device {id}: {reason}")]
    InvalidResponse { id: DeviceId, reason: String },

    #[error("Checksum mismatch for device {id}")]
    ChecksumMismatch { id: DeviceId },

    #[error("Device {id} returned error status: 0x{status:02X}")]
    DeviceFault { id: DeviceId, status: u8 },

    #[error("Timeout waiting for response from device {id}")]
    Timeout { id: DeviceId },

    #[error("No device {id} on the bus")]
    UnknownDevice { id: DeviceId },
}

/// Outcome of a telemetry refresh, reduced to something cheap to copy around
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    /// Never refreshed
    NoData,
    Timeout,
    InvalidResponse,
    ChecksumMismatch,
    DeviceFault(u8),
    /// Device answered with a NaN or infinite value
    InvalidValue,
    UnknownDevice,
    TransportFault,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl From<&BusError> for StatusCode {
    fn from(err: &BusError) -> Self {
        match err {
            BusError::Serial(_) | BusError::Io(_) => StatusCode::TransportFault,
            BusError::InvalidResponse { .. } => StatusCode::InvalidResponse,
            BusError::ChecksumMismatch { .. } => StatusCode::ChecksumMismatch,
            BusError::DeviceFault { status, .. } => StatusCode::DeviceFault(*status),
            BusError::Timeout { .. } => StatusCode::Timeout,
            BusError::UnknownDevice { .. } => StatusCode::UnknownDevice,
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A shared bus of smart motor controllers
pub trait ActuatorBus: Send {
    /// Write gains and neutral behavior to a device
    fn apply_config(&mut self, id: DeviceId, config: &ActuatorConfiguration) -> Result<()>;

    /// Replace the device's active control request
    fn set_control(&mut self, id: DeviceId, request: ControlRequest) -> Result<()>;

    /// Set how often the device broadcasts the given signals
    fn set_update_frequency(&mut self, id: DeviceId, signals: &[Signal], hz: f64) -> Result<()>;

    /// Read the given signals in one round trip, in the order requested
    fn read_signals(&mut self, id: DeviceId, signals: &[Signal]) -> Result<Vec<f64>>;

    /// Stop broadcasting signals nobody asked a frequency for
    ///
    /// Repeated calls are cheap; implementations skip devices already trimmed.
    fn optimize_bus_utilization(&mut self, id: DeviceId) -> Result<()>;
}
