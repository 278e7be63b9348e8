// Serial protocol for smart motor controllers
//
// Half-duplex packet bus, one instruction per packet:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Status format: [0xFF, 0xFF, ID, Length, Error, Params..., Checksum]
// Multi-byte register values are little-endian; gains, targets and telemetry
// are f32.

use serialport::{ClearBuffer, SerialPort};
use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

use super::bus::{
    ActuatorBus, ActuatorConfiguration, BusError, ControlRequest, DeviceId, NeutralMode, Result,
    Signal,
};

/// Default serial configuration
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 10;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    // Configuration
    NeutralMode = 20, // 1 byte: 0=coast, 1=brake
    Slot0Kp = 24,     // f32, followed by ki, kd, ks, kv, ka
    // Control block: mode (1), target (f32), aux (f32), leader id (1), oppose (1)
    ControlMode = 60,
    // Broadcast period per signal, u16 ms each, in Signal order (0 = off)
    FramePeriod = 80,
    OptimizeBus = 96, // 1 byte: write 1 to drop unregistered frames
    // Telemetry, f32 each, read-only, in Signal order
    PresentPosition = 100,
}

/// Control modes written to the control block
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMode {
    Neutral = 0,
    VelocityVoltage = 1,
    Follower = 2,
}

const GAIN_COUNT: usize = 6;
const CONTROL_BLOCK_LEN: usize = 11;
const TELEMETRY_WIDTH: u8 = 4;

/// Address of a telemetry signal
fn telemetry_register(signal: Signal) -> u8 {
    Register::PresentPosition as u8 + TELEMETRY_WIDTH * signal.index() as u8
}

/// Address of a signal's broadcast period
fn frame_register(signal: Signal) -> u8 {
    Register::FramePeriod as u8 + 2 * signal.index() as u8
}

/// Broadcast period for a rate; 0 disables the frame
fn frame_period_ms(hz: f64) -> u16 {
    if hz <= 0.0 {
        0
    } else {
        (1000.0 / hz).round().clamp(1.0, u16::MAX as f64) as u16
    }
}

/// Serialise a control request into the device's control block
fn encode_control(request: ControlRequest) -> [u8; CONTROL_BLOCK_LEN] {
    let (mode, target, aux, leader, oppose) = match request {
        ControlRequest::Neutral => (ControlMode::Neutral, 0.0, 0.0, 0, false),
        ControlRequest::VelocityVoltage {
            velocity_rps,
            acceleration_rps2,
        } => (
            ControlMode::VelocityVoltage,
            velocity_rps as f32,
            acceleration_rps2 as f32,
            0,
            false,
        ),
        ControlRequest::Follower {
            leader,
            oppose_leader,
        } => (ControlMode::Follower, 0.0, 0.0, leader, oppose_leader),
    };

    let mut block = [0u8; CONTROL_BLOCK_LEN];
    block[0] = mode as u8;
    block[1..5].copy_from_slice(&target.to_le_bytes());
    block[5..9].copy_from_slice(&aux.to_le_bytes());
    block[9] = leader;
    block[10] = oppose as u8;
    block
}

/// Byte transport under the bus: a serial port, or a scripted stand-in in tests
pub trait Transport: Read + Write {
    /// Throw away whatever has been received but not yet read
    fn discard_input(&mut self) -> Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Longest run of foreign bytes tolerated while hunting for our reply
const MAX_RESYNC_BYTES: usize = 64;

/// One's complement of the byte sum, as carried in the last byte of a frame
fn frame_checksum<'a>(bytes: impl IntoIterator<Item = &'a u8>) -> u8 {
    !bytes.into_iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn check_overrun(id: DeviceId, skipped: usize) -> Result<()> {
    if skipped > MAX_RESYNC_BYTES {
        return Err(BusError::InvalidResponse {
            id,
            reason: format!("no reply within {} bytes of other traffic", MAX_RESYNC_BYTES),
        });
    }
    Ok(())
}

/// Request frame: header, id, length, instruction, params, checksum
fn encode_frame(id: DeviceId, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut frame = HEADER.to_vec();
    frame.extend([id, (params.len() + 2) as u8, instruction as u8]);
    frame.extend_from_slice(params);
    frame.push(frame_checksum(&frame[HEADER.len()..]));
    frame
}

/// Motor controller bus over a serial line
///
/// Every request starts from an empty receive buffer, and replies are found by
/// scanning for a header addressed from the device we asked, so a late or
/// corrupt reply costs one failed request rather than the bus's framing.
pub struct SerialBus<P = Box<dyn SerialPort>> {
    port: P,
    trimmed: HashSet<DeviceId>,
}

impl SerialBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        debug!("Opened {} at {} baud", port_name, baudrate);
        Ok(Self::from_port(port))
    }
}

impl<P: Transport> SerialBus<P> {
    pub fn from_port(port: P) -> Self {
        Self {
            port,
            trimmed: HashSet::new(),
        }
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Send one request and return the reply's parameters
    fn transact(&mut self, id: DeviceId, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        self.port.discard_input()?;
        self.port.write_all(&encode_frame(id, instruction, params))?;
        self.port.flush()?;
        self.read_reply(id)
    }

    fn fill(&mut self, id: DeviceId, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::UnexpectedEof => BusError::Timeout { id },
            _ => BusError::Io(e),
        })
    }

    fn next_byte(&mut self, id: DeviceId) -> Result<u8> {
        let mut byte = [0u8];
        self.fill(id, &mut byte)?;
        Ok(byte[0])
    }

    /// Consume bytes up to and including the next header
    fn seek_header(&mut self, id: DeviceId, skipped: &mut usize) -> Result<()> {
        let mut prev = self.next_byte(id)?;
        loop {
            let byte = self.next_byte(id)?;
            if [prev, byte] == HEADER {
                return Ok(());
            }
            *skipped += 1;
            check_overrun(id, *skipped)?;
            prev = byte;
        }
    }

    /// Wait for the status frame from `id`, dropping anything else on the way
    fn read_reply(&mut self, id: DeviceId) -> Result<Vec<u8>> {
        let mut skipped = 0;
        loop {
            self.seek_header(id, &mut skipped)?;
            let mut from = self.next_byte(id)?;
            // a run of 0xFF is header padding, not an address
            while from == HEADER[0] {
                skipped += 1;
                check_overrun(id, skipped)?;
                from = self.next_byte(id)?;
            }
            let length = self.next_byte(id)?;
            if length < 2 {
                skipped += 4;
                check_overrun(id, skipped)?;
                debug!("Ignoring frame from {} with length {}", from, length);
                continue;
            }

            // status byte + params + checksum
            let mut body = vec![0u8; length as usize];
            self.fill(id, &mut body)?;

            if from != id {
                skipped += 4 + body.len();
                debug!("Dropping stray frame from device {} while waiting on {}", from, id);
                check_overrun(id, skipped)?;
                continue;
            }

            let (content, checksum) = body.split_at(body.len() - 1);
            if frame_checksum([from, length].iter().chain(content)) != checksum[0] {
                return Err(BusError::ChecksumMismatch { id });
            }
            return match content.split_first() {
                Some((0, params)) => Ok(params.to_vec()),
                Some((&status, _)) => Err(BusError::DeviceFault { id, status }),
                None => Err(BusError::InvalidResponse {
                    id,
                    reason: "status frame without a status byte".to_string(),
                }),
            };
        }
    }

    /// Whether a device answers at all; silence is not an error
    pub fn ping(&mut self, id: DeviceId) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Err(BusError::Timeout { .. }) => Ok(false),
            other => other.map(|_| true),
        }
    }

    /// Write a run of bytes starting at `address` and wait for the status reply
    pub fn write_bytes(&mut self, id: DeviceId, address: u8, data: &[u8]) -> Result<()> {
        debug!("Write {} bytes to device {} at {}", data.len(), id, address);
        let mut params = vec![address];
        params.extend_from_slice(data);
        self.transact(id, Instruction::Write, &params)?;
        Ok(())
    }

    /// Read `len` bytes starting at `address`
    pub fn read_bytes(&mut self, id: DeviceId, address: u8, len: u8) -> Result<Vec<u8>> {
        let data = self.transact(id, Instruction::Read, &[address, len])?;
        if data.len() != len as usize {
            return Err(BusError::InvalidResponse {
                id,
                reason: format!("asked for {} bytes, got {}", len, data.len()),
            });
        }
        Ok(data)
    }
}

impl<P: Transport + Send> ActuatorBus for SerialBus<P> {
    fn apply_config(&mut self, id: DeviceId, config: &ActuatorConfiguration) -> Result<()> {
        let neutral = match config.neutral_mode {
            NeutralMode::Coast => 0,
            NeutralMode::Brake => 1,
        };
        self.write_bytes(id, Register::NeutralMode as u8, &[neutral])?;

        let g = &config.slot0;
        let mut gains = Vec::with_capacity(4 * GAIN_COUNT);
        for value in [g.kp, g.ki, g.kd, g.ks, g.kv, g.ka] {
            gains.extend_from_slice(&(value as f32).to_le_bytes());
        }
        self.write_bytes(id, Register::Slot0Kp as u8, &gains)?;

        // a config write resets the device's frame table
        self.trimmed.remove(&id);
        Ok(())
    }

    fn set_control(&mut self, id: DeviceId, request: ControlRequest) -> Result<()> {
        self.write_bytes(id, Register::ControlMode as u8, &encode_control(request))
    }

    fn set_update_frequency(&mut self, id: DeviceId, signals: &[Signal], hz: f64) -> Result<()> {
        let period = frame_period_ms(hz).to_le_bytes();
        for &signal in signals {
            self.write_bytes(id, frame_register(signal), &period)?;
        }
        Ok(())
    }

    fn read_signals(&mut self, id: DeviceId, signals: &[Signal]) -> Result<Vec<f64>> {
        let (Some(first), Some(last)) = (
            signals.iter().map(|&s| telemetry_register(s)).min(),
            signals.iter().map(|&s| telemetry_register(s)).max(),
        ) else {
            return Ok(Vec::new());
        };

        // One read spanning every requested register
        let len = last - first + TELEMETRY_WIDTH;
        let raw = self.read_bytes(id, first, len)?;

        Ok(signals
            .iter()
            .map(|&s| {
                let offset = (telemetry_register(s) - first) as usize;
                let bytes = [
                    raw[offset],
                    raw[offset + 1],
                    raw[offset + 2],
                    raw[offset + 3],
                ];
                f32::from_le_bytes(bytes) as f64
            })
            .collect())
    }

    fn optimize_bus_utilization(&mut self, id: DeviceId) -> Result<()> {
        if self.trimmed.contains(&id) {
            return Ok(());
        }
        self.write_bytes(id, Register::OptimizeBus as u8, &[1])?;
        self.trimmed.insert(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    const LEADER_SET: [Signal; 5] = [
        Signal::Position,
        Signal::Velocity,
        Signal::MotorVoltage,
        Signal::StatorCurrent,
        Signal::SupplyCurrent,
    ];
    const FOLLOWER_SET: [Signal; 2] = [Signal::StatorCurrent, Signal::SupplyCurrent];

    fn status_frame(id: DeviceId, status: u8, params: &[u8]) -> Vec<u8> {
        let mut body = vec![id, (params.len() + 2) as u8, status];
        body.extend_from_slice(params);
        let checksum = frame_checksum(&body);
        let mut frame = HEADER.to_vec();
        frame.extend(body);
        frame.push(checksum);
        frame
    }

    fn telemetry(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Port where each scripted reply arrives when the next request is written
    #[derive(Default)]
    struct ScriptedPort {
        written: Vec<u8>,
        received: VecDeque<u8>,
        replies: VecDeque<Vec<u8>>,
        discards: usize,
    }

    impl ScriptedPort {
        fn reply(&mut self, id: DeviceId, status: u8, params: &[u8]) {
            self.replies.push_back(status_frame(id, status, params));
        }

        fn reply_raw(&mut self, bytes: Vec<u8>) {
            self.replies.push_back(bytes);
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.received.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
            }
            let n = buf.len().min(self.received.len());
            for (slot, byte) in buf.iter_mut().zip(self.received.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if let Some(reply) = self.replies.pop_front() {
                self.received.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedPort {
        fn discard_input(&mut self) -> Result<()> {
            self.received.clear();
            self.discards += 1;
            Ok(())
        }
    }

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(frame_checksum(&data), 215);
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(14, Instruction::Ping, &[]);
        assert_eq!(frame, vec![0xFF, 0xFF, 14, 2, 0x01, !(14u8 + 2 + 1)]);

        let frame = encode_frame(15, Instruction::Read, &[100, 8]);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[3], 4);
        assert_eq!(frame[7], frame_checksum(&frame[2..7]));
    }

    #[test]
    fn test_ping_timeout_is_not_an_error() {
        let mut bus = SerialBus::from_port(ScriptedPort::default());
        assert!(!bus.ping(14).unwrap());

        let mut port = ScriptedPort::default();
        port.reply(14, 0, &[]);
        let mut bus = SerialBus::from_port(port);
        assert!(bus.ping(14).unwrap());
    }

    #[test]
    fn test_read_signals_is_one_spanning_read() {
        let mut port = ScriptedPort::default();
        port.reply(15, 0, &telemetry(&[42.5, 3.25]));

        let mut bus = SerialBus::from_port(port);
        let values = bus
            .read_signals(15, &[Signal::SupplyCurrent, Signal::StatorCurrent])
            .unwrap();
        assert_eq!(values, vec![3.25, 42.5]);

        let port = bus.into_port();
        // exactly one read request went out, on a freshly cleared buffer
        let expected = encode_frame(
            15,
            Instruction::Read,
            &[telemetry_register(Signal::StatorCurrent), 8],
        );
        assert_eq!(port.written, expected);
        assert_eq!(port.discards, 1);
    }

    #[test]
    fn test_late_reply_does_not_desync_following_traffic() {
        let mut port = ScriptedPort::default();
        // a leader reply that missed its deadline is sitting in the buffer
        port.received
            .extend(status_frame(14, 0, &telemetry(&[1.0, 2.0, 3.0, 4.0, 5.0])));
        for cycle in 0..20 {
            let v = cycle as f32;
            port.reply(14, 0, &telemetry(&[v, v + 0.5, 6.0, 30.0, 16.0]));
            port.reply(15, 0, &telemetry(&[-29.0, 15.5]));
        }
        let mut bus = SerialBus::from_port(port);

        for cycle in 0..20 {
            let leader = bus.read_signals(14, &LEADER_SET).unwrap();
            assert_eq!(leader[0], cycle as f64);
            let follower = bus.read_signals(15, &FOLLOWER_SET).unwrap();
            assert_eq!(follower, vec![-29.0, 15.5]);
        }
    }

    #[test]
    fn test_stray_frame_ahead_of_reply_is_skipped() {
        let mut port = ScriptedPort::default();
        let mut arrival = status_frame(14, 0, &telemetry(&[9.0, 9.0]));
        arrival.extend(status_frame(15, 0, &telemetry(&[-29.0, 15.5])));
        port.reply_raw(arrival);

        let mut bus = SerialBus::from_port(port);
        assert_eq!(
            bus.read_signals(15, &FOLLOWER_SET).unwrap(),
            vec![-29.0, 15.5]
        );
    }

    #[test]
    fn test_line_noise_before_header_is_skipped() {
        let mut port = ScriptedPort::default();
        let mut arrival = vec![0x00, 0x13, 0xFF];
        arrival.extend(status_frame(14, 0, &[]));
        port.reply_raw(arrival);

        let mut bus = SerialBus::from_port(port);
        assert!(bus.ping(14).unwrap());
    }

    #[test]
    fn test_endless_noise_gives_up() {
        let mut port = ScriptedPort::default();
        port.reply_raw(vec![0x00; 200]);

        let mut bus = SerialBus::from_port(port);
        assert!(matches!(
            bus.set_control(14, ControlRequest::Neutral),
            Err(BusError::InvalidResponse { id: 14, .. })
        ));
    }

    #[test]
    fn test_device_fault_and_bad_checksum() {
        let mut port = ScriptedPort::default();
        port.reply(14, 0x20, &[]);
        let mut bus = SerialBus::from_port(port);
        assert!(matches!(
            bus.set_control(14, ControlRequest::Neutral),
            Err(BusError::DeviceFault { id: 14, status: 0x20 })
        ));

        let mut port = ScriptedPort::default();
        let mut corrupt = status_frame(14, 0, &[]);
        if let Some(last) = corrupt.last_mut() {
            *last ^= 0xFF;
        }
        port.reply_raw(corrupt);
        port.reply(14, 0, &[]);
        let mut bus = SerialBus::from_port(port);
        assert!(matches!(
            bus.set_control(14, ControlRequest::Neutral),
            Err(BusError::ChecksumMismatch { id: 14 })
        ));
        // the next request goes through
        assert!(bus.set_control(14, ControlRequest::Neutral).is_ok());
    }

    #[test]
    fn test_silent_device_times_out() {
        let mut bus = SerialBus::from_port(ScriptedPort::default());
        assert!(matches!(
            bus.read_signals(14, &[Signal::Velocity]),
            Err(BusError::Timeout { id: 14 })
        ));
    }

    #[test]
    fn test_control_block_encoding() {
        let block = encode_control(ControlRequest::VelocityVoltage {
            velocity_rps: 60.0,
            acceleration_rps2: 0.0,
        });
        assert_eq!(block[0], ControlMode::VelocityVoltage as u8);
        assert_eq!(f32::from_le_bytes([block[1], block[2], block[3], block[4]]), 60.0);

        let block = encode_control(ControlRequest::Follower {
            leader: 14,
            oppose_leader: true,
        });
        assert_eq!(block[0], ControlMode::Follower as u8);
        assert_eq!(block[9], 14);
        assert_eq!(block[10], 1);

        assert_eq!(encode_control(ControlRequest::Neutral), [0u8; CONTROL_BLOCK_LEN]);
    }

    #[test]
    fn test_trim_written_once_until_reconfigured() {
        let mut port = ScriptedPort::default();
        for _ in 0..4 {
            port.reply(14, 0, &[]);
        }
        let mut bus = SerialBus::from_port(port);

        bus.optimize_bus_utilization(14).unwrap();
        bus.optimize_bus_utilization(14).unwrap();
        // neutral mode + gains
        bus.apply_config(14, &ActuatorConfiguration::default()).unwrap();
        bus.optimize_bus_utilization(14).unwrap();

        let port = bus.into_port();
        assert!(port.replies.is_empty());
        assert_eq!(port.discards, 4);
    }

    #[test]
    fn test_frame_period() {
        assert_eq!(frame_period_ms(50.0), 20);
        assert_eq!(frame_period_ms(4.0), 250);
        assert_eq!(frame_period_ms(0.0), 0);
        assert_eq!(frame_period_ms(5000.0), 1);
    }
}
