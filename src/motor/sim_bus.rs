// In-process simulated motor controllers
//
// Each simulated device keeps the configuration and control request the
// backend sent it and runs its own output loop, so the flywheel backends talk
// to it exactly as they would to real hardware. The physics side writes rotor
// state and supply voltage into the device state between loop updates.

use std::collections::BTreeMap;

use tracing::debug;

use super::bus::{
    ActuatorBus, ActuatorConfiguration, BusError, ControlRequest, DeviceId, Result, Signal,
    StatusCode,
};

/// Electrical and mechanical state of one simulated controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimDeviceState {
    pub supply_voltage: f64,
    pub rotor_position_rot: f64,
    pub rotor_velocity_rps: f64,
    /// Output computed by the last `update_outputs`
    pub motor_voltage: f64,
    pub stator_current: f64,
    pub supply_current: f64,
}

impl Default for SimDeviceState {
    fn default() -> Self {
        Self {
            supply_voltage: 12.0,
            rotor_position_rot: 0.0,
            rotor_velocity_rps: 0.0,
            motor_voltage: 0.0,
            stator_current: 0.0,
            supply_current: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SimDevice {
    state: SimDeviceState,
    config: Option<ActuatorConfiguration>,
    request: ControlRequest,
    integral: f64,
    last_error: Option<f64>,
    frame_hz: BTreeMap<Signal, f64>,
    trimmed: bool,
    fault: Option<StatusCode>,
}

impl SimDevice {
    fn velocity_voltage(&mut self, target_rps: f64, accel_rps2: f64, dt: f64) -> f64 {
        let gains = self.config.unwrap_or_default().slot0;
        let error = target_rps - self.state.rotor_velocity_rps;

        self.integral += error * dt;
        let derivative = match self.last_error {
            Some(prev) if dt > 0.0 => (error - prev) / dt,
            _ => 0.0,
        };
        self.last_error = Some(error);

        let static_ff = if target_rps == 0.0 {
            0.0
        } else {
            gains.ks * target_rps.signum()
        };
        let feedforward = static_ff + gains.kv * target_rps + gains.ka * accel_rps2;
        feedforward + gains.kp * error + gains.ki * self.integral + gains.kd * derivative
    }

    fn clamp_to_supply(&self, volts: f64) -> f64 {
        let limit = self.state.supply_voltage.max(0.0);
        volts.clamp(-limit, limit)
    }
}

/// Simulated bus holding a fixed set of controllers
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    devices: BTreeMap<DeviceId, SimDevice>,
}

impl SimBus {
    pub fn new(ids: &[DeviceId]) -> Self {
        Self {
            devices: ids.iter().map(|&id| (id, SimDevice::default())).collect(),
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&SimDeviceState> {
        self.devices.get(&id).map(|d| &d.state)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut SimDeviceState> {
        self.devices.get_mut(&id).map(|d| &mut d.state)
    }

    /// Make every bus operation on `id` fail with `fault`, or clear it with `None`
    ///
    /// `Some(StatusCode::Ok)` clears the fault as well.
    pub fn inject_fault(&mut self, id: DeviceId, fault: Option<StatusCode>) {
        if let Some(dev) = self.devices.get_mut(&id) {
            dev.fault = fault.filter(|code| !code.is_ok());
        }
    }

    /// Make every bus operation on `id` time out (or stop doing so)
    pub fn set_connected(&mut self, id: DeviceId, connected: bool) {
        self.inject_fault(id, (!connected).then_some(StatusCode::Timeout));
    }

    pub fn config(&self, id: DeviceId) -> Option<&ActuatorConfiguration> {
        self.devices.get(&id).and_then(|d| d.config.as_ref())
    }

    pub fn request(&self, id: DeviceId) -> Option<ControlRequest> {
        self.devices.get(&id).map(|d| d.request)
    }

    pub fn update_frequency(&self, id: DeviceId, signal: Signal) -> Option<f64> {
        self.devices
            .get(&id)
            .and_then(|d| d.frame_hz.get(&signal).copied())
    }

    pub fn is_trimmed(&self, id: DeviceId) -> bool {
        self.devices.get(&id).is_some_and(|d| d.trimmed)
    }

    /// Run one iteration of every device's output loop
    ///
    /// Leaders are evaluated first so followers mirror this iteration's output.
    pub fn update_outputs(&mut self, dt: f64) {
        for dev in self.devices.values_mut() {
            let volts = match dev.request {
                ControlRequest::VelocityVoltage {
                    velocity_rps,
                    acceleration_rps2,
                } => dev.velocity_voltage(velocity_rps, acceleration_rps2, dt),
                ControlRequest::Neutral => 0.0,
                ControlRequest::Follower { .. } => continue,
            };
            dev.state.motor_voltage = dev.clamp_to_supply(volts);
        }

        let outputs: BTreeMap<DeviceId, f64> = self
            .devices
            .iter()
            .map(|(&id, d)| (id, d.state.motor_voltage))
            .collect();

        for dev in self.devices.values_mut() {
            if let ControlRequest::Follower {
                leader,
                oppose_leader,
            } = dev.request
            {
                let leader_volts = outputs.get(&leader).copied().unwrap_or(0.0);
                let volts = if oppose_leader {
                    -leader_volts
                } else {
                    leader_volts
                };
                dev.state.motor_voltage = dev.clamp_to_supply(volts);
            }
        }
    }

    fn reachable(&mut self, id: DeviceId) -> Result<&mut SimDevice> {
        match self.devices.get_mut(&id) {
            Some(dev) => match dev.fault {
                Some(code) => Err(fault_error(id, code)),
                None => Ok(dev),
            },
            None => Err(BusError::UnknownDevice { id }),
        }
    }
}

/// The bus error a device with an injected fault answers with
fn fault_error(id: DeviceId, code: StatusCode) -> BusError {
    match code {
        StatusCode::Timeout | StatusCode::NoData | StatusCode::Ok => BusError::Timeout { id },
        StatusCode::ChecksumMismatch => BusError::ChecksumMismatch { id },
        StatusCode::DeviceFault(status) => BusError::DeviceFault { id, status },
        StatusCode::UnknownDevice => BusError::UnknownDevice { id },
        StatusCode::TransportFault => {
            BusError::Io(std::io::Error::other("injected transport fault"))
        }
        StatusCode::InvalidResponse | StatusCode::InvalidValue => BusError::InvalidResponse {
            id,
            reason: format!("injected {:?}", code),
        },
    }
}

impl ActuatorBus for SimBus {
    fn apply_config(&mut self, id: DeviceId, config: &ActuatorConfiguration) -> Result<()> {
        let dev = self.reachable(id)?;
        dev.config = Some(*config);
        dev.trimmed = false;
        Ok(())
    }

    fn set_control(&mut self, id: DeviceId, request: ControlRequest) -> Result<()> {
        let dev = self.reachable(id)?;
        if std::mem::discriminant(&dev.request) != std::mem::discriminant(&request) {
            dev.integral = 0.0;
            dev.last_error = None;
        }
        dev.request = request;
        Ok(())
    }

    fn set_update_frequency(&mut self, id: DeviceId, signals: &[Signal], hz: f64) -> Result<()> {
        let dev = self.reachable(id)?;
        for &signal in signals {
            dev.frame_hz.insert(signal, hz);
        }
        Ok(())
    }

    fn read_signals(&mut self, id: DeviceId, signals: &[Signal]) -> Result<Vec<f64>> {
        let state = self.reachable(id)?.state;
        Ok(signals
            .iter()
            .map(|signal| match signal {
                Signal::Position => state.rotor_position_rot,
                Signal::Velocity => state.rotor_velocity_rps,
                Signal::MotorVoltage => state.motor_voltage,
                Signal::StatorCurrent => state.stator_current,
                Signal::SupplyCurrent => state.supply_current,
            })
            .collect())
    }

    fn optimize_bus_utilization(&mut self, id: DeviceId) -> Result<()> {
        let dev = self.reachable(id)?;
        if !dev.trimmed {
            debug!("Trimming unused frames on simulated device {}", id);
            dev.trimmed = true;
        }
        Ok(())
    }
}
