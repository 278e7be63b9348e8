// Keyboard setpoints: W/S step speed up/down, R/F step size, SPACE zero, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use flywheel_zenoh_runtime::config::TOPIC_CMD_VELOCITY;
use flywheel_zenoh_runtime::messages::VelocityCommand;
use std::time::Duration;
use tracing::info;

const STEPS: [f64; 3] = [1.0, 5.0, 10.0]; // rps per key press
const MAX_VELOCITY: f64 = 90.0; // rps, keeps requests inside the 12 V envelope

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_VELOCITY).await?;

    info!("Controls: W/S=faster/slower, R/F=step size, SPACE=zero, Q=quit");
    info!("Step: {} rps", STEPS[0]);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;

    // Setpoint persists between key presses; the runtime watchdog only
    // needs us to keep publishing
    let mut velocity_rps = 0.0_f64;

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let before = velocity_rps;

                match code {
                    KeyCode::Char('w') if pressed => velocity_rps += STEPS[step_idx],
                    KeyCode::Char('s') if pressed => velocity_rps -= STEPS[step_idx],
                    KeyCode::Char(' ') if pressed => velocity_rps = 0.0,

                    // Step size
                    KeyCode::Char('r') if pressed => {
                        step_idx = (step_idx + 1).min(STEPS.len() - 1);
                        info!("Step: {} rps", STEPS[step_idx]);
                    }
                    KeyCode::Char('f') if pressed => {
                        step_idx = step_idx.saturating_sub(1);
                        info!("Step: {} rps", STEPS[step_idx]);
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }

                velocity_rps = velocity_rps.clamp(-MAX_VELOCITY, MAX_VELOCITY);
                if velocity_rps != before {
                    info!("Setpoint: {:.1} rps", velocity_rps);
                }
            }
        }

        // Always publish at ~50Hz
        let cmd = VelocityCommand { velocity_rps };
        publisher.put(serde_json::to_string(&cmd)?).await?;
    }

    // Leave the flywheel commanded to zero rather than relying on the watchdog
    let cmd = VelocityCommand { velocity_rps: 0.0 };
    publisher.put(serde_json::to_string(&cmd)?).await?;

    Ok(())
}
