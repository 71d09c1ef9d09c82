//! Scripted in-memory motion controller for tests.
//!
//! Records every command issued through [`MotionController`] and replays
//! scripted state/flag/feedback responses, so control logic can be
//! exercised without a serial link.

use std::collections::{HashMap, VecDeque};

use super::{
    AxisState, ControlMode, EncoderMode, Feedback, LinkResult, MotionController, MotorType,
};

/// One recorded controller command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetPosition { axis: u8, position: f32 },
    SetVelocity { axis: u8, velocity: f32 },
    SetCurrent { axis: u8, current: f32 },
    TrapezoidalMove { axis: u8, position: f32 },
    SetControlMode { axis: u8, mode: ControlMode },
    RequestState { axis: u8, state: AxisState },
    Configure { axis: u8, param: &'static str, value: f32 },
    ConfigureGlobal { param: &'static str, value: f32 },
    SetFlag { axis: u8, flag: &'static str, value: bool },
    Save,
    Erase,
    Reboot,
}

/// Recording mock with scripted responses.
///
/// State queries pop from a per-axis queue and fall back to a default once
/// the queue drains. Motor/encoder readiness flags flip to true when the
/// matching calibration state is requested, imitating a controller that
/// completes whatever it is asked to run.
#[derive(Default)]
pub struct MockController {
    pub commands: Vec<Command>,
    states: HashMap<u8, VecDeque<AxisState>>,
    default_state: HashMap<u8, AxisState>,
    motor_calibrated: HashMap<u8, bool>,
    encoder_ready: HashMap<u8, bool>,
    feedback: HashMap<u8, VecDeque<Feedback>>,
    last_feedback: HashMap<u8, Feedback>,
    pub bus_voltage: f32,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            bus_voltage: 24.0,
            ..Self::default()
        }
    }

    /// Queue a state to be reported by the next `current_state` poll.
    pub fn push_state(&mut self, axis: u8, state: AxisState) {
        self.states.entry(axis).or_default().push_back(state);
    }

    /// State reported once the queue drains (defaults to Idle).
    pub fn set_default_state(&mut self, axis: u8, state: AxisState) {
        self.default_state.insert(axis, state);
    }

    pub fn set_calibration_flags(&mut self, axis: u8, motor: bool, encoder: bool) {
        self.motor_calibrated.insert(axis, motor);
        self.encoder_ready.insert(axis, encoder);
    }

    /// Queue a feedback sample; the last sample repeats once drained.
    pub fn push_feedback(&mut self, axis: u8, position: f32, velocity: f32) {
        let fb = Feedback { position, velocity };
        self.feedback.entry(axis).or_default().push_back(fb);
        self.last_feedback.insert(axis, fb);
    }

    pub fn commands_for(&self, axis: u8) -> Vec<&Command> {
        self.commands
            .iter()
            .filter(|c| match c {
                Command::SetPosition { axis: a, .. }
                | Command::SetVelocity { axis: a, .. }
                | Command::SetCurrent { axis: a, .. }
                | Command::TrapezoidalMove { axis: a, .. }
                | Command::SetControlMode { axis: a, .. }
                | Command::RequestState { axis: a, .. }
                | Command::Configure { axis: a, .. }
                | Command::SetFlag { axis: a, .. } => *a == axis,
                _ => false,
            })
            .collect()
    }

    fn configure(&mut self, axis: u8, param: &'static str, value: f32) -> LinkResult<()> {
        self.commands.push(Command::Configure { axis, param, value });
        Ok(())
    }

    fn set_flag(&mut self, axis: u8, flag: &'static str, value: bool) -> LinkResult<()> {
        self.commands.push(Command::SetFlag { axis, flag, value });
        Ok(())
    }
}

impl MotionController for MockController {
    fn set_position(&mut self, axis: u8, position: f32) -> LinkResult<()> {
        self.commands.push(Command::SetPosition { axis, position });
        Ok(())
    }

    fn set_velocity(&mut self, axis: u8, velocity: f32) -> LinkResult<()> {
        self.commands.push(Command::SetVelocity { axis, velocity });
        Ok(())
    }

    fn set_current(&mut self, axis: u8, current: f32) -> LinkResult<()> {
        self.commands.push(Command::SetCurrent { axis, current });
        Ok(())
    }

    fn trapezoidal_move(&mut self, axis: u8, position: f32) -> LinkResult<()> {
        self.commands.push(Command::TrapezoidalMove { axis, position });
        Ok(())
    }

    fn read_feedback(&mut self, axis: u8) -> LinkResult<Feedback> {
        if let Some(fb) = self.feedback.entry(axis).or_default().pop_front() {
            return Ok(fb);
        }
        Ok(self
            .last_feedback
            .get(&axis)
            .copied()
            .unwrap_or(Feedback {
                position: 0.0,
                velocity: 0.0,
            }))
    }

    fn set_control_mode(&mut self, axis: u8, mode: ControlMode) -> LinkResult<()> {
        self.commands.push(Command::SetControlMode { axis, mode });
        Ok(())
    }

    fn request_state(&mut self, axis: u8, state: AxisState) -> LinkResult<()> {
        self.commands.push(Command::RequestState { axis, state });
        // The real controller completes the requested procedure; reflect
        // that in the readiness flags so re-classification sees progress.
        match state {
            AxisState::MotorCalibration => {
                self.motor_calibrated.insert(axis, true);
            }
            AxisState::EncoderOffsetCalibration => {
                self.encoder_ready.insert(axis, true);
            }
            _ => {}
        }
        Ok(())
    }

    fn current_state(&mut self, axis: u8) -> LinkResult<AxisState> {
        if let Some(state) = self.states.entry(axis).or_default().pop_front() {
            return Ok(state);
        }
        Ok(self
            .default_state
            .get(&axis)
            .copied()
            .unwrap_or(AxisState::Idle))
    }

    fn motor_calibrated(&mut self, axis: u8) -> LinkResult<bool> {
        Ok(self.motor_calibrated.get(&axis).copied().unwrap_or(false))
    }

    fn encoder_ready(&mut self, axis: u8) -> LinkResult<bool> {
        Ok(self.encoder_ready.get(&axis).copied().unwrap_or(false))
    }

    fn set_motor_pre_calibrated(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "motor_pre_calibrated", value)
    }

    fn set_encoder_pre_calibrated(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "encoder_pre_calibrated", value)
    }

    fn set_encoder_use_index(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "encoder_use_index", value)
    }

    fn configure_braking_resistance(&mut self, ohms: f32) -> LinkResult<()> {
        self.commands.push(Command::ConfigureGlobal {
            param: "brake_resistance",
            value: ohms,
        });
        Ok(())
    }

    fn configure_current_limit(&mut self, axis: u8, amps: f32) -> LinkResult<()> {
        self.configure(axis, "current_lim", amps)
    }

    fn configure_calibration_current(&mut self, axis: u8, amps: f32) -> LinkResult<()> {
        self.configure(axis, "calibration_current", amps)
    }

    fn configure_velocity_limit(&mut self, axis: u8, counts_per_s: f32) -> LinkResult<()> {
        self.configure(axis, "vel_limit", counts_per_s)
    }

    fn configure_pole_pairs(&mut self, axis: u8, pole_pairs: i32) -> LinkResult<()> {
        self.configure(axis, "pole_pairs", pole_pairs as f32)
    }

    fn configure_motor_type(&mut self, axis: u8, motor_type: MotorType) -> LinkResult<()> {
        self.configure(axis, "motor_type", motor_type.as_raw() as f32)
    }

    fn configure_cpr(&mut self, axis: u8, cpr: i32) -> LinkResult<()> {
        self.configure(axis, "cpr", cpr as f32)
    }

    fn configure_encoder_mode(&mut self, axis: u8, mode: EncoderMode) -> LinkResult<()> {
        self.configure(axis, "encoder_mode", mode.as_raw() as f32)
    }

    fn configure_encoder_bandwidth(&mut self, axis: u8, bandwidth: f32) -> LinkResult<()> {
        self.configure(axis, "encoder_bandwidth", bandwidth)
    }

    fn configure_traj_velocity_limit(&mut self, axis: u8, counts_per_s: f32) -> LinkResult<()> {
        self.configure(axis, "traj_vel_limit", counts_per_s)
    }

    fn configure_traj_accel_limit(&mut self, axis: u8, counts_per_s2: f32) -> LinkResult<()> {
        self.configure(axis, "traj_accel_limit", counts_per_s2)
    }

    fn configure_traj_decel_limit(&mut self, axis: u8, counts_per_s2: f32) -> LinkResult<()> {
        self.configure(axis, "traj_decel_limit", counts_per_s2)
    }

    fn configure_pos_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()> {
        self.configure(axis, "pos_gain", gain)
    }

    fn configure_vel_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()> {
        self.configure(axis, "vel_gain", gain)
    }

    fn configure_vel_integrator_gain(&mut self, axis: u8, gain: f32) -> LinkResult<()> {
        self.configure(axis, "vel_integrator_gain", gain)
    }

    fn set_startup_motor_calibration(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "startup_motor_calibration", value)
    }

    fn set_startup_encoder_index_search(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "startup_encoder_index_search", value)
    }

    fn set_startup_encoder_offset_calibration(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "startup_encoder_offset_calibration", value)
    }

    fn set_startup_closed_loop(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "startup_closed_loop", value)
    }

    fn set_startup_sensorless(&mut self, axis: u8, value: bool) -> LinkResult<()> {
        self.set_flag(axis, "startup_sensorless", value)
    }

    fn save_configuration(&mut self) -> LinkResult<()> {
        self.commands.push(Command::Save);
        Ok(())
    }

    fn erase_configuration(&mut self) -> LinkResult<()> {
        self.commands.push(Command::Erase);
        Ok(())
    }

    fn reboot(&mut self) -> LinkResult<()> {
        self.commands.push(Command::Reboot);
        Ok(())
    }

    fn bus_voltage(&mut self) -> LinkResult<f32> {
        Ok(self.bus_voltage)
    }
}
