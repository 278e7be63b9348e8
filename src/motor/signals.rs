// Batched telemetry signals for one device
//
// A batch is refreshed in one bus round trip and reduced to a single status.
// Values that fail to refresh keep their last good reading.

use tracing::debug;

use super::bus::{ActuatorBus, DeviceId, Signal, StatusCode};

#[derive(Debug, Clone)]
pub struct SignalBatch {
    device: DeviceId,
    signals: Vec<Signal>,
    values: Vec<f64>,
    status: StatusCode,
}

impl SignalBatch {
    pub fn new(device: DeviceId, signals: &[Signal]) -> Self {
        Self {
            device,
            signals: signals.to_vec(),
            values: vec![0.0; signals.len()],
            status: StatusCode::NoData,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Status of the most recent refresh
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Last good value of `signal`, or 0.0 if it is not in this batch or has
    /// never been read
    pub fn value(&self, signal: Signal) -> f64 {
        self.signals
            .iter()
            .position(|&s| s == signal)
            .map_or(0.0, |i| self.values[i])
    }

    /// Register the broadcast rate of every signal in the batch
    pub fn set_update_frequency<B: ActuatorBus + ?Sized>(&self, bus: &mut B, hz: f64) -> StatusCode {
        match bus.set_update_frequency(self.device, &self.signals, hz) {
            Ok(()) => StatusCode::Ok,
            Err(e) => StatusCode::from(&e),
        }
    }

    /// Read every signal in one round trip
    ///
    /// Ok only if the device answered for every signal with a finite value.
    pub fn refresh<B: ActuatorBus + ?Sized>(&mut self, bus: &mut B) -> StatusCode {
        self.status = match bus.read_signals(self.device, &self.signals) {
            Ok(values) if values.len() != self.signals.len() => {
                debug!(
                    "Device {} answered {} of {} signals",
                    self.device,
                    values.len(),
                    self.signals.len()
                );
                StatusCode::InvalidResponse
            }
            Ok(values) => {
                let mut status = StatusCode::Ok;
                for (slot, value) in self.values.iter_mut().zip(values) {
                    if value.is_finite() {
                        *slot = value;
                    } else {
                        status = StatusCode::InvalidValue;
                    }
                }
                status
            }
            Err(e) => {
                debug!("Refresh of device {} failed: {}", self.device, e);
                StatusCode::from(&e)
            }
        };
        self.status
    }
}
