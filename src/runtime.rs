// 50 Hz loop with watchdog
// If the command source goes quiet the flywheel is stopped. If either
// controller stays off the bus past the connection debounce window it is
// stopped too, until both report again.

use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::config::{CMD_TIMEOUT, LOOP_HZ, TOPIC_CMD_VELOCITY, TOPIC_HEALTH, TOPIC_STATE_INPUTS};
use crate::flywheel::{FlywheelInputs, FlywheelIo};
use crate::messages::{FlywheelStatus, RuntimeHealth, VelocityCommand};

pub struct Runtime {
    io: Box<dyn FlywheelIo>,
    inputs: FlywheelInputs,
    latest_cmd: Option<VelocityCommand>,
    cmd_received_at: Option<Instant>,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(io: Box<dyn FlywheelIo>) -> Self {
        Self {
            io,
            inputs: FlywheelInputs::default(),
            latest_cmd: None,
            cmd_received_at: None,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn inputs(&self) -> &FlywheelInputs {
        &self.inputs
    }

    /// Process incoming command
    pub fn on_command(&mut self, cmd: VelocityCommand, now: Instant) {
        if !cmd.velocity_rps.is_finite() {
            warn!("Ignoring non-finite setpoint: {:?}", cmd);
            return;
        }
        info!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = Some(now);
    }

    /// Read telemetry, then command the flywheel based on watchdog state
    pub fn cycle(&mut self, now: Instant) -> FlywheelStatus {
        self.io.update_inputs(&mut self.inputs);

        let cmd_age = self
            .cmd_received_at
            .map(|at| now.saturating_duration_since(at));
        let fresh_cmd = match (self.latest_cmd, cmd_age) {
            (Some(cmd), Some(age)) if age <= CMD_TIMEOUT => Some(cmd),
            _ => None,
        };

        let health = if !self.inputs.all_connected() {
            RuntimeHealth::ActuatorDisconnected
        } else if fresh_cmd.is_some() {
            RuntimeHealth::Ok
        } else {
            RuntimeHealth::CmdStale
        };

        match fresh_cmd {
            Some(cmd) if health == RuntimeHealth::Ok => self.io.set_velocity(cmd.velocity_rps),
            _ => self.io.stop(),
        }

        if health != self.health {
            match health {
                RuntimeHealth::Ok => info!("Runtime healthy, tracking setpoint"),
                RuntimeHealth::CmdStale => match cmd_age {
                    Some(age) => warn!("Command stale ({:?} old), stopping flywheel", age),
                    None => warn!("No command received yet, holding flywheel stopped"),
                },
                RuntimeHealth::ActuatorDisconnected => warn!(
                    "Actuator disconnected (leader: {}, follower: {}), stopping flywheel",
                    self.inputs.leader_connected, self.inputs.follower_connected
                ),
            }
            self.health = health;
        }

        FlywheelStatus {
            health,
            inputs: self.inputs,
        }
    }
}

/// Loop timer; a late cycle skips the ticks it missed instead of bursting
fn loop_interval() -> Interval {
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

/// Run one cycle on the blocking pool
///
/// Bus I/O blocks for up to its read timeout per operation, so it must not
/// stall the async workers that service zenoh.
async fn cycle_blocking(
    mut runtime: Runtime,
    now: Instant,
) -> Result<(Runtime, FlywheelStatus), JoinError> {
    tokio::task::spawn_blocking(move || {
        let status = runtime.cycle(now);
        (runtime, status)
    })
    .await
}

pub async fn run(io: Box<dyn FlywheelIo>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_VELOCITY).await?;
    let pub_inputs = session.declare_publisher(TOPIC_STATE_INPUTS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new(io);
    let mut tick = loop_interval();

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD_VELOCITY);
    info!("Publishing to: {}, {}", TOPIC_STATE_INPUTS, TOPIC_HEALTH);

    loop {
        tick.tick().await;

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<VelocityCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd, Instant::now()),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Read telemetry and actuate (includes watchdog logic)
        let (next, status) = cycle_blocking(runtime, Instant::now()).await?;
        runtime = next;

        // 3. Publish telemetry
        pub_inputs.put(serde_json::to_string(&status)?).await?;

        // 4. Publish health
        pub_health.put(serde_json::to_string(&status.health)?).await?;
    }
}
