// Flywheel physics for simulation
//
// Linear DC motor model driving an inertial load through a gear reduction,
// integrated with an exact zero-order-hold step over an explicit dt.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const KG_PER_LB: f64 = 0.453_592_37;
pub const M_PER_IN: f64 = 0.0254;

pub fn rpm_to_rad_per_sec(rpm: f64) -> f64 {
    rpm * 2.0 * PI / 60.0
}

pub fn rad_to_rot(rad: f64) -> f64 {
    rad / (2.0 * PI)
}

pub fn rot_to_rad(rot: f64) -> f64 {
    rot * 2.0 * PI
}

/// Moment of inertia of the flywheel, mass concentrated at the radius
pub fn disk_moi(mass_kg: f64, radius_m: f64) -> f64 {
    mass_kg * radius_m * radius_m
}

/// Motors with published curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorModel {
    KrakenX60,
    #[default]
    KrakenX60Foc,
    Falcon500,
    Falcon500Foc,
}

/// Linear model of one or more identical DC motors sharing a shaft
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcMotor {
    pub nominal_voltage: f64,
    pub stall_torque_nm: f64,
    pub stall_current_amps: f64,
    pub free_current_amps: f64,
    pub free_speed_rad_per_sec: f64,
    /// Winding resistance, ohms
    pub r_ohms: f64,
    /// Speed constant, rad/s per volt
    pub kv: f64,
    /// Torque constant, newton-meters per amp
    pub kt: f64,
}

impl DcMotor {
    pub fn new(
        nominal_voltage: f64,
        stall_torque_nm: f64,
        stall_current_amps: f64,
        free_current_amps: f64,
        free_speed_rad_per_sec: f64,
        num_motors: u32,
    ) -> Self {
        let n = num_motors as f64;
        let stall_torque_nm = stall_torque_nm * n;
        let stall_current_amps = stall_current_amps * n;
        let free_current_amps = free_current_amps * n;

        let r_ohms = nominal_voltage / stall_current_amps;
        Self {
            nominal_voltage,
            stall_torque_nm,
            stall_current_amps,
            free_current_amps,
            free_speed_rad_per_sec,
            r_ohms,
            kv: free_speed_rad_per_sec / (nominal_voltage - r_ohms * free_current_amps),
            kt: stall_torque_nm / stall_current_amps,
        }
    }

    pub fn from_model(model: MotorModel, num_motors: u32) -> Self {
        match model {
            MotorModel::KrakenX60 => Self::kraken_x60(num_motors),
            MotorModel::KrakenX60Foc => Self::kraken_x60_foc(num_motors),
            MotorModel::Falcon500 => Self::falcon500(num_motors),
            MotorModel::Falcon500Foc => Self::falcon500_foc(num_motors),
        }
    }

    pub fn kraken_x60(num_motors: u32) -> Self {
        Self::new(12.0, 7.09, 366.0, 2.0, rpm_to_rad_per_sec(6000.0), num_motors)
    }

    pub fn kraken_x60_foc(num_motors: u32) -> Self {
        Self::new(12.0, 9.37, 483.0, 2.0, rpm_to_rad_per_sec(5800.0), num_motors)
    }

    pub fn falcon500(num_motors: u32) -> Self {
        Self::new(12.0, 4.69, 257.0, 1.5, rpm_to_rad_per_sec(6380.0), num_motors)
    }

    pub fn falcon500_foc(num_motors: u32) -> Self {
        Self::new(12.0, 5.84, 304.0, 1.5, rpm_to_rad_per_sec(6080.0), num_motors)
    }

    /// Winding current at a shaft speed and terminal voltage
    pub fn current(&self, speed_rad_per_sec: f64, voltage: f64) -> f64 {
        (voltage - speed_rad_per_sec / self.kv) / self.r_ohms
    }
}

/// First-order flywheel: state is mechanism angular velocity
///
/// `x' = A x + B u` with `A = -G^2 Kt / (Kv R J)` and `B = G Kt / (R J)`,
/// where G is the reduction (rotor turns per mechanism turn).
#[derive(Debug, Clone)]
pub struct FlywheelPlant {
    motor: DcMotor,
    gearing: f64,
    a: f64,
    b: f64,
    velocity_rad_per_sec: f64,
    input_volts: f64,
}

impl FlywheelPlant {
    pub fn new(motor: DcMotor, moi_kg_m2: f64, gearing: f64) -> Self {
        let denom = motor.r_ohms * moi_kg_m2;
        Self {
            motor,
            gearing,
            a: -gearing * gearing * motor.kt / (motor.kv * denom),
            b: gearing * motor.kt / denom,
            velocity_rad_per_sec: 0.0,
            input_volts: 0.0,
        }
    }

    pub fn set_input_voltage(&mut self, volts: f64) {
        self.input_volts = volts;
    }

    pub fn set_state(&mut self, velocity_rad_per_sec: f64) {
        self.velocity_rad_per_sec = velocity_rad_per_sec;
    }

    /// Advance by `dt_s` holding the input voltage constant
    pub fn update(&mut self, dt_s: f64) {
        if dt_s <= 0.0 {
            return;
        }
        let x = self.velocity_rad_per_sec;
        let u = self.input_volts;
        self.velocity_rad_per_sec = if self.a == 0.0 {
            x + self.b * u * dt_s
        } else {
            let ad = (self.a * dt_s).exp();
            ad * x + (ad - 1.0) / self.a * self.b * u
        };
    }

    pub fn angular_velocity_rad_per_sec(&self) -> f64 {
        self.velocity_rad_per_sec
    }

    /// Mechanism velocity, rotations per second
    pub fn angular_velocity_rps(&self) -> f64 {
        rad_to_rot(self.velocity_rad_per_sec)
    }

    /// Total current drawn by all motors, positive when the input is driving
    pub fn current_draw_amps(&self) -> f64 {
        if self.input_volts == 0.0 {
            return 0.0;
        }
        let rotor_speed = self.velocity_rad_per_sec * self.gearing;
        self.motor.current(rotor_speed, self.input_volts) * self.input_volts.signum()
    }
}

/// Source of the simulated system supply voltage
pub trait PowerSupply: Send {
    fn voltage(&self) -> f64;
}

/// Fixed-voltage supply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantSupply(pub f64);

impl Default for ConstantSupply {
    fn default() -> Self {
        Self(12.0)
    }
}

impl PowerSupply for ConstantSupply {
    fn voltage(&self) -> f64 {
        self.0
    }
}

impl<F: Fn() -> f64 + Send> PowerSupply for F {
    fn voltage(&self) -> f64 {
        self()
    }
}
