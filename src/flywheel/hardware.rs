// Leader/follower motor controller backend
//
// Runs on any ActuatorBus. The controllers close their velocity loop in the
// rotor frame, so commands are scaled up by the gear ratio on the way out and
// telemetry is scaled down on the way in.

use tracing::{debug, info, warn};

use super::{FlywheelInputs, FlywheelIo};
use crate::clock::{Clock, MonotonicClock};
use crate::config::FlywheelConfig;
use crate::debounce::Debouncer;
use crate::motor::{ActuatorBus, ControlRequest, DeviceId, Signal, SignalBatch};

/// Telemetry read from the leader every cycle
const LEADER_SIGNALS: [Signal; 5] = [
    Signal::Position,
    Signal::Velocity,
    Signal::MotorVoltage,
    Signal::StatorCurrent,
    Signal::SupplyCurrent,
];

/// Telemetry read from the follower every cycle
const FOLLOWER_SIGNALS: [Signal; 2] = [Signal::StatorCurrent, Signal::SupplyCurrent];

pub struct FlywheelIoHardware<B, C = MonotonicClock> {
    bus: B,
    clock: C,
    leader: DeviceId,
    follower: DeviceId,
    gear_ratio: f64,
    leader_signals: SignalBatch,
    follower_signals: SignalBatch,
    leader_debounce: Debouncer,
    follower_debounce: Debouncer,
    connected: (bool, bool),
    command_failed: bool,
}

impl<B: ActuatorBus, C: Clock> FlywheelIoHardware<B, C> {
    /// Configure both controllers and start following
    ///
    /// Bus failures here are logged, not returned: a missing controller shows
    /// up as disconnected once the loop runs.
    pub fn new(mut bus: B, clock: C, config: &FlywheelConfig) -> Self {
        let leader = config.leader_id;
        let follower = config.follower_id;
        info!(
            "Configuring flywheel controllers: leader={}, follower={}, gear ratio {}",
            leader, follower, config.gear_ratio
        );

        for id in [leader, follower] {
            if let Err(e) = bus.apply_config(id, &config.actuator) {
                warn!("Failed to configure controller {}: {}", id, e);
            }
        }

        let follow = ControlRequest::Follower {
            leader,
            oppose_leader: config.follower_opposes_leader,
        };
        if let Err(e) = bus.set_control(follower, follow) {
            warn!("Failed to set controller {} to follow {}: {}", follower, leader, e);
        }

        let leader_signals = SignalBatch::new(leader, &LEADER_SIGNALS);
        let follower_signals = SignalBatch::new(follower, &FOLLOWER_SIGNALS);
        for batch in [&leader_signals, &follower_signals] {
            let status = batch.set_update_frequency(&mut bus, config.status_frame_hz);
            if !status.is_ok() {
                warn!(
                    "Failed to set frame rate on controller {}: {:?}",
                    batch.device(),
                    status
                );
            }
        }

        let now = clock.now();
        let window = config.connection_debounce();
        Self {
            bus,
            clock,
            leader,
            follower,
            gear_ratio: config.gear_ratio,
            leader_signals,
            follower_signals,
            leader_debounce: Debouncer::new(window, config.debounce_type, now),
            follower_debounce: Debouncer::new(window, config.debounce_type, now),
            connected: (false, false),
            command_failed: false,
        }
    }

    pub fn gear_ratio(&self) -> f64 {
        self.gear_ratio
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn send(&mut self, request: ControlRequest) {
        match self.bus.set_control(self.leader, request) {
            Ok(()) => {
                if self.command_failed {
                    info!("Controller {} accepting commands again", self.leader);
                }
                self.command_failed = false;
            }
            Err(e) => {
                if !self.command_failed {
                    warn!("Failed to command controller {}: {}", self.leader, e);
                }
                self.command_failed = true;
            }
        }
    }

    fn log_connectivity(&mut self, leader: bool, follower: bool) {
        for (id, was, now) in [
            (self.leader, self.connected.0, leader),
            (self.follower, self.connected.1, follower),
        ] {
            match (was, now) {
                (false, true) => info!("Controller {} connected", id),
                (true, false) => warn!("Controller {} disconnected", id),
                _ => {}
            }
        }
        self.connected = (leader, follower);
    }

    fn trim_bus(&mut self) {
        for id in [self.leader, self.follower] {
            if let Err(e) = self.bus.optimize_bus_utilization(id) {
                debug!("Bus trim on controller {} failed: {}", id, e);
            }
        }
    }
}

impl<B: ActuatorBus, C: Clock> FlywheelIo for FlywheelIoHardware<B, C> {
    fn update_inputs(&mut self, inputs: &mut FlywheelInputs) {
        // Leader batch first, then follower; flags are written only after both
        let leader_status = self.leader_signals.refresh(&mut self.bus);
        let follower_status = self.follower_signals.refresh(&mut self.bus);

        let now = self.clock.now();
        let leader_ok = self.leader_debounce.calculate(leader_status.is_ok(), now);
        let follower_ok = self.follower_debounce.calculate(follower_status.is_ok(), now);
        self.log_connectivity(leader_ok, follower_ok);

        let leader = &self.leader_signals;
        let follower = &self.follower_signals;
        *inputs = FlywheelInputs {
            leader_connected: leader_ok,
            follower_connected: follower_ok,
            position_rot: leader.value(Signal::Position) / self.gear_ratio,
            velocity_rps: leader.value(Signal::Velocity) / self.gear_ratio,
            applied_volts: leader.value(Signal::MotorVoltage),
            leader_stator_amps: leader.value(Signal::StatorCurrent),
            follower_stator_amps: follower.value(Signal::StatorCurrent),
            leader_supply_amps: leader.value(Signal::SupplyCurrent),
            follower_supply_amps: follower.value(Signal::SupplyCurrent),
        };

        self.trim_bus();
    }

    fn set_velocity(&mut self, velocity_rps: f64) {
        self.send(ControlRequest::VelocityVoltage {
            velocity_rps: velocity_rps * self.gear_ratio,
            acceleration_rps2: 0.0,
        });
    }

    fn stop(&mut self) {
        self.send(ControlRequest::Neutral);
    }
}
