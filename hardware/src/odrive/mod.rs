//! ODrive ASCII protocol driver.
//!
//! The ODrive motion controller speaks a newline-terminated ASCII
//! request/response protocol over a serial link. This driver exposes the
//! command surface the fixture uses:
//!
//! - **Motion**: [`set_position`](OdriveLink::set_position),
//!   [`set_velocity`](OdriveLink::set_velocity),
//!   [`set_current`](OdriveLink::set_current),
//!   [`trapezoidal_move`](OdriveLink::trapezoidal_move)
//! - **Feedback**: [`read_feedback`](OdriveLink::read_feedback),
//!   [`current_state`](OdriveLink::current_state),
//!   [`bus_voltage`](OdriveLink::bus_voltage)
//! - **Configuration**: current/velocity/trajectory limits, encoder setup,
//!   PID gains, startup behavior flags
//! - **System**: save/erase configuration, reboot
//!
//! Reads block until a terminating newline or a fixed timeout; on timeout
//! whatever accumulated is returned to the parser, matching the controller's
//! historical link behavior. Blocking state-transition waits live in the
//! startup sequencer, not here — the driver only issues the request and
//! reads back state on demand.

pub mod mock;
mod params;

pub use params::{AxisState, ControlMode, EncoderMode, MotorType};

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

/// How long a read waits for a terminating newline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error on controller link: {0}")]
    Io(#[from] std::io::Error),

    #[error("controller read timed out with no data")]
    Timeout,

    #[error("invalid response from controller: {0:?}")]
    InvalidResponse(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Position and velocity feedback for one axis, in encoder counts and
/// counts per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    pub position: f32,
    pub velocity: f32,
}

/// The motion-controller surface consumed by the control core.
///
/// [`OdriveLink`] is the hardware implementation;
/// [`mock::MockController`] records commands and scripts responses for
/// tests.
pub trait MotionController {
    fn set_position(&mut self, axis: u8, position: f32) -> LinkResult<()>;
    fn set_velocity(&mut self, axis: u8, velocity: f32) -> LinkResult<()>;
    fn set_current(&mut self, axis: u8, current: f32) -> LinkResult<()>;
    fn trapezoidal_move(&mut self, axis: u8, position: f32) -> LinkResult<()>;
    fn read_feedback(&mut self, axis: u8) -> LinkResult<Feedback>;

    fn set_control_mode(&mut self, axis: u8, mode: ControlMode) -> LinkResult<()>;

    fn request_state(&mut self, axis: u8, state: AxisState) -> LinkResult<()>;
    fn current_state(&mut self, axis: u8) -> LinkResult<AxisState>;

    fn motor_calibrated(&mut self, axis: u8) -> LinkResult<bool>;
    fn encoder_ready(&mut self, axis: u8) -> LinkResult<bool>;

    fn set_motor_pre_calibrated(&mut self, axis: u8, value: bool) -> LinkResult<()>;
    fn set_encoder_pre_calibrated(&mut self, axis: u8, value: bool) -> LinkResult<()>;
    fn set_encoder_use_index(&mut self, axis: u8, value: bool) -> LinkResult<()>;

    fn configure_braking_resistance(&mut self, ohms: f32) -> LinkResult<()>;
    fn configure_current_limit(&mut self, axis: u8, amps: f32) -> LinkResult<()>;
    fn configure_calibration_current(&mut self, axis: u8, amps: f32) -> LinkResult<()>;
    fn configure_velocity_limit(&mut self, axis: u8, counts_per_s: f32) -> LinkResult<()>;
    fn configure_pole_pairs(&mut self, axis: u8, pole_pairs: i32) -> LinkResult<()>;
    fn configure_motor_type(&mut self, axis: u8, motor_type: MotorType) -> LinkResult<()>;
    fn configure_cpr(&mut self, axis: u8, cpr: i32) -> LinkResult<()>;
    fn configure_encoder_mode(&mut self, axis: u8, mode: EncoderMode) -> LinkResult<()>;
    fn configure_encoder_bandwidth(&mut self, axis: u8, bandwidth: f32) -> LinkResult<()>;

    fn configure_traj_velocity_limit(&mut self, axis: u8, counts_per_s: f32) -> LinkResult<()>;
    fn configure_traj_accel_limit(&mut self, axis: u8, counts_per_s2: f32) -> LinkResult<()>;
    fn configure_traj_decel_limit(&mut self, axis: u8, counts_per_s2: f32) -> LinkResult<()>;

    fn configure_pos_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()>;
    fn configure_vel_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()>;
    fn configure_vel_integrator_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()>;

    fn set_startup_motor_calibration(&mut self, axis: u8, value: bool) -> LinkResult<()>;
    fn set_startup_encoder_index_search(&mut self, axis: u8, value: bool) -> LinkResult<()>;
    fn set_startup_encoder_offset_calibration(&mut self, axis: u8, value: bool) -> LinkResult<()>;
    fn set_startup_closed_loop(&mut self, axis: u8, value: bool) -> LinkResult<()>;
    fn set_startup_sensorless(&mut self, axis: u8, value: bool) -> LinkResult<()>;

    fn save_configuration(&mut self) -> LinkResult<()>;
    fn erase_configuration(&mut self) -> LinkResult<()>;
    fn reboot(&mut self) -> LinkResult<()>;
    fn bus_voltage(&mut self) -> LinkResult<f32>;
}

/// ODrive ASCII driver over any byte transport.
///
/// The transport is typically a serial port opened with a short read
/// timeout; the driver loops reads until its own [`read timeout`]
/// (DEFAULT_READ_TIMEOUT) elapses.
pub struct OdriveLink<T> {
    transport: T,
    read_timeout: Duration,
}

impl<T: Read + Write> OdriveLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the newline-read timeout. The default is one second.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn send(&mut self, line: &str) -> LinkResult<()> {
        trace!(command = line, "odrive tx");
        self.transport.write_all(line.as_bytes())?;
        self.transport.write_all(b"\n")?;
        Ok(())
    }

    /// Read one newline-terminated response.
    ///
    /// Returns whatever accumulated when the timeout elapses before a
    /// newline arrives.
    fn read_line(&mut self) -> LinkResult<String> {
        let mut line = String::new();
        let start = Instant::now();
        let mut byte = [0u8; 1];

        while start.elapsed() < self.read_timeout {
            match self.transport.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0] as char);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }

        trace!(response = line.as_str(), "odrive rx");
        Ok(line)
    }

    fn query(&mut self, request: &str) -> LinkResult<String> {
        self.send(request)?;
        let response = self.read_line()?;
        if response.trim().is_empty() {
            return Err(LinkError::Timeout);
        }
        Ok(response)
    }

    fn query_f32(&mut self, request: &str) -> LinkResult<f32> {
        let response = self.query(request)?;
        response
            .trim()
            .parse()
            .map_err(|_| LinkError::InvalidResponse(response))
    }

    fn query_i32(&mut self, request: &str) -> LinkResult<i32> {
        let response = self.query(request)?;
        response
            .trim()
            .parse()
            .map_err(|_| LinkError::InvalidResponse(response))
    }

    fn write_param_f32(&mut self, axis: u8, path: &str, value: f32) -> LinkResult<()> {
        self.send(&format!("w axis{axis}.{path} {value:.4}"))
    }

    fn write_param_i32(&mut self, axis: u8, path: &str, value: i32) -> LinkResult<()> {
        self.send(&format!("w axis{axis}.{path} {value}"))
    }

    fn write_param_bool(&mut self, axis: u8, path: &str, value: bool) -> LinkResult<()> {
        self.write_param_i32(axis, path, i32::from(value))
    }

    fn read_param_bool(&mut self, axis: u8, path: &str) -> LinkResult<bool> {
        Ok(self.query_i32(&format!("r axis{axis}.{path}"))? != 0)
    }
}

impl<T: Read + Write> MotionController for OdriveLink<T> {
    fn set_position(&mut self, axis: u8, position: f32) -> LinkResult<()> {
        self.send(&format!("p {axis} {position:.4} 0.0000 0.0000"))
    }

    fn set_velocity(&mut self, axis: u8, velocity: f32) -> LinkResult<()> {
        self.send(&format!("v {axis} {velocity:.4} 0.0000"))
    }

    fn set_current(&mut self, axis: u8, current: f32) -> LinkResult<()> {
        self.send(&format!("c {axis} {current:.4}"))
    }

    fn trapezoidal_move(&mut self, axis: u8, position: f32) -> LinkResult<()> {
        self.send(&format!("t {axis} {position:.4}"))
    }

    fn read_feedback(&mut self, axis: u8) -> LinkResult<Feedback> {
        let response = self.query(&format!("f {axis}"))?;
        let mut parts = response.trim().split_whitespace();
        let position = parts.next().and_then(|p| p.parse().ok());
        let velocity = parts.next().and_then(|v| v.parse().ok());
        match (position, velocity) {
            (Some(position), Some(velocity)) => Ok(Feedback { position, velocity }),
            _ => Err(LinkError::InvalidResponse(response)),
        }
    }

    fn set_control_mode(&mut self, axis: u8, mode: ControlMode) -> LinkResult<()> {
        self.write_param_i32(axis, "controller.config.control_mode", mode.as_raw())
    }

    fn request_state(&mut self, axis: u8, state: AxisState) -> LinkResult<()> {
        self.write_param_i32(axis, "requested_state", state.as_raw())
    }

    fn current_state(&mut self, axis: u8) -> LinkResult<AxisState> {
        let raw = self.query_i32(&format!("r axis{axis}.current_state"))?;
        Ok(AxisState::from_raw(raw))
    }

    fn motor_calibrated(&mut self, axis: u8) -> LinkResult<bool> {
        self.read_param_bool(axis, "motor.is_calibrated")
    }

    fn encoder_ready(&mut self, axis: u8) -> LinkResult<bool> {
        self.read_param_bool(axis, "encoder.is_ready")
    }

    fn set_motor_pre_calibrated(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "motor.config.pre_calibrated", value)
    }

    fn set_encoder_pre_calibrated(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "encoder.config.pre_calibrated", value)
    }

    fn set_encoder_use_index(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "encoder.config.use_index", value)
    }

    fn configure_braking_resistance(&mut self, ohms: f32) -> LinkResult<()> {
        self.send(&format!("w config.brake_resistance {ohms:.4}"))
    }

    fn configure_current_limit(&mut self, axis: u8, amps: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "motor.config.current_lim", amps)
    }

    fn configure_calibration_current(&mut self, axis: u8, amps: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "motor.config.calibration_current", amps)
    }

    fn configure_velocity_limit(&mut self, axis: u8, counts_per_s: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "controller.config.vel_limit", counts_per_s)
    }

    fn configure_pole_pairs(&mut self, axis: u8, pole_pairs: i32) -> LinkResult<()> {
        self.write_param_i32(axis, "motor.config.pole_pairs", pole_pairs)
    }

    fn configure_motor_type(&mut self, axis: u8, motor_type: MotorType) -> LinkResult<()> {
        self.write_param_i32(axis, "motor.config.motor_type", motor_type.as_raw())
    }

    fn configure_cpr(&mut self, axis: u8, cpr: i32) -> LinkResult<()> {
        self.write_param_i32(axis, "encoder.config.cpr", cpr)
    }

    fn configure_encoder_mode(&mut self, axis: u8, mode: EncoderMode) -> LinkResult<()> {
        self.write_param_i32(axis, "encoder.config.mode", mode.as_raw())
    }

    fn configure_encoder_bandwidth(&mut self, axis: u8, bandwidth: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "encoder.config.bandwidth", bandwidth)
    }

    fn configure_traj_velocity_limit(&mut self, axis: u8, counts_per_s: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "trap_traj.config.vel_limit", counts_per_s)
    }

    fn configure_traj_accel_limit(&mut self, axis: u8, counts_per_s2: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "trap_traj.config.accel_limit", counts_per_s2)
    }

    fn configure_traj_decel_limit(&mut self, axis: u8, counts_per_s2: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "trap_traj.config.decel_limit", counts_per_s2)
    }

    fn configure_pos_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "controller.config.pos_gain", gain)
    }

    fn configure_vel_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "controller.config.vel_gain", gain)
    }

    fn configure_vel_integrator_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()> {
        self.write_param_f32(axis, "controller.config.vel_integrator_gain", gain)
    }

    fn set_startup_motor_calibration(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "config.startup_motor_calibration", value)
    }

    fn set_startup_encoder_index_search(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "config.startup_encoder_index_search", value)
    }

    fn set_startup_encoder_offset_calibration(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "config.startup_encoder_offset_calibration", value)
    }

    fn set_startup_closed_loop(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "config.startup_closed_loop_control", value)
    }

    fn set_startup_sensorless(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.write_param_bool(axis, "config.startup_sensorless_control", value)
    }

    fn save_configuration(&mut self) -> LinkResult<()> {
        self.send("ss")
    }

    fn erase_configuration(&mut self) -> LinkResult<()> {
        self.send("se")
    }

    fn reboot(&mut self) -> LinkResult<()> {
        self.send("sb")
    }

    fn bus_voltage(&mut self) -> LinkResult<f32> {
        self.query_f32("r vbus_voltage")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// In-memory transport: records written lines, replays scripted reads.
    struct ScriptedTransport {
        written: Vec<u8>,
        responses: VecDeque<u8>,
    }

    impl ScriptedTransport {
        fn new(responses: &[&str]) -> Self {
            let mut bytes = VecDeque::new();
            for r in responses {
                bytes.extend(r.bytes());
                bytes.push_back(b'\n');
            }
            Self {
                written: Vec::new(),
                responses: bytes,
            }
        }

        fn lines_written(&self) -> Vec<String> {
            String::from_utf8(self.written.clone())
                .unwrap()
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.responses.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted data")),
            }
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn link(responses: &[&str]) -> OdriveLink<ScriptedTransport> {
        OdriveLink::new(ScriptedTransport::new(responses))
            .with_read_timeout(Duration::from_millis(20))
    }

    #[test]
    fn motion_command_wire_format() {
        let mut link = link(&[]);
        link.set_velocity(1, 0.0).unwrap();
        link.trapezoidal_move(1, 12600.5).unwrap();
        link.set_position(0, -42.0).unwrap();
        assert_eq!(
            link.transport.lines_written(),
            vec![
                "v 1 0.0000 0.0000",
                "t 1 12600.5000",
                "p 0 -42.0000 0.0000 0.0000",
            ]
        );
    }

    #[test]
    fn configuration_wire_format() {
        let mut link = link(&[]);
        link.configure_traj_velocity_limit(1, 128000.0).unwrap();
        link.set_control_mode(1, ControlMode::Trajectory).unwrap();
        link.set_startup_closed_loop(1, true).unwrap();
        link.save_configuration().unwrap();
        assert_eq!(
            link.transport.lines_written(),
            vec![
                "w axis1.trap_traj.config.vel_limit 128000.0000",
                "w axis1.controller.config.control_mode 4",
                "w axis1.config.startup_closed_loop_control 1",
                "ss",
            ]
        );
    }

    #[test]
    fn reads_feedback_pair() {
        let mut link = link(&["10350.2 -3.5"]);
        let fb = link.read_feedback(1).unwrap();
        assert_eq!(fb.position, 10350.2);
        assert_eq!(fb.velocity, -3.5);
        assert_eq!(link.transport.lines_written(), vec!["f 1"]);
    }

    #[test]
    fn reads_state_and_flags() {
        let mut link = link(&["8", "1", "0"]);
        assert_eq!(link.current_state(0).unwrap(), AxisState::ClosedLoopControl);
        assert!(link.motor_calibrated(0).unwrap());
        assert!(!link.encoder_ready(0).unwrap());
    }

    #[test]
    fn empty_response_is_timeout() {
        let mut link = link(&[]);
        assert!(matches!(link.bus_voltage(), Err(LinkError::Timeout)));
    }

    #[test]
    fn garbage_response_is_invalid() {
        let mut link = link(&["nope"]);
        assert!(matches!(
            link.current_state(0),
            Err(LinkError::InvalidResponse(_))
        ));
    }
}
