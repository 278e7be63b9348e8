// Motor controller access for the flywheel
//
// Provides:
// - The actuator bus boundary (configuration, control requests, telemetry)
// - Batched telemetry signals with aggregate status
// - Serial packet protocol for real controllers
// - Simulated controllers for running without hardware

pub mod bus;
pub mod serial;
pub mod signals;
pub mod sim_bus;

pub use bus::{
    ActuatorBus, ActuatorConfiguration, BusError, ControlRequest, DeviceId, NeutralMode, Signal,
    SlotGains, StatusCode,
};
pub use serial::SerialBus;
pub use signals::SignalBatch;
pub use sim_bus::{SimBus, SimDeviceState};
