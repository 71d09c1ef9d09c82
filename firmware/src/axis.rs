//! Per-axis control state machine.
//!
//! Each incoming motion message carries a control byte, a 16-bit target,
//! and a speed byte. The control byte selects a category through the
//! axis's [`ControlMap`]: an absolute move against one of two angular
//! range presets, a directional jog at a byte-graded velocity, a stop in
//! place, or a stop that also re-anchors the homing index. Dispatch is
//! edge triggered: a message identical to the previous one (same control
//! and target) issues nothing, so a host streaming at refresh rate does
//! not flood the controller link.

use hardware::odrive::{ControlMode, LinkResult, MotionController};
use tracing::{debug, trace};

use crate::config::{
    AxisConfig, ENCODER_CPR, HOMING_VELOCITY, HOST_COUNTS_PER_MOTOR_COUNT, JOG_VELOCITY_LIMIT,
    SPEED_ACCEL_SCALING, TRAJ_VEL_LIMIT, TRANSMISSION_RATIO,
};
use crate::startup::reindex;

/// What a control byte asks for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Category {
    /// Trajectory move to an absolute angle, scaled by a range preset.
    Absolute { scale: f32 },
    /// Hold the current position, wherever that is.
    StopInPlace,
    /// Stop and snap the homing anchor to the nearest lattice point,
    /// shedding accumulated slip.
    StopAndReindex,
    JogClockwise,
    JogCounterClockwise,
}

/// Grade a jog byte into a velocity strictly inside `(0, limit)`.
///
/// The sub-range spans `span + 1` bytes; dividing by `span + 2` keeps even
/// the top step short of the limit, and the `+ 1` keeps the bottom step
/// nonzero.
fn jog_velocity(range: (u8, u8), byte: u8) -> f32 {
    let step = (byte - range.0) as f32;
    let span = (range.1 - range.0) as f32;
    (step + 1.0) * JOG_VELOCITY_LIMIT / (span + 2.0)
}

fn categorize(config: &AxisConfig, control: u8) -> Category {
    let map = &config.control_map;
    if control == map.preset_a {
        Category::Absolute {
            scale: config.presets[0],
        }
    } else if control == map.preset_b {
        Category::Absolute {
            scale: config.presets[1],
        }
    } else if control == map.stop_in_place {
        Category::StopInPlace
    } else if control == map.stop_and_reindex {
        Category::StopAndReindex
    } else if (map.jog_cw.0..=map.jog_cw.1).contains(&control) {
        Category::JogClockwise
    } else if (map.jog_ccw.0..=map.jog_ccw.1).contains(&control) {
        Category::JogCounterClockwise
    } else {
        // Only reachable with a loaded map that escaped coverage
        // validation; hold position rather than jog at a garbage speed.
        Category::StopInPlace
    }
}

/// Control state for one motor axis.
pub struct AxisController {
    config: AxisConfig,
    /// Last (control, target) pair acted on.
    previous: Option<(u8, u16)>,
    previous_speed: Option<u8>,
    /// Whether the previous category was an absolute move, for the
    /// re-anchor edge.
    was_absolute: bool,
    start_index: i32,
    /// Homing anchor in motor encoder counts.
    index_offset: f32,
    mode: ControlMode,
}

impl AxisController {
    /// Build from the startup pass's homing result. The sequencer leaves
    /// the axis in trajectory mode.
    pub fn new(config: AxisConfig, start_index: i32) -> Self {
        Self {
            config,
            previous: None,
            previous_speed: None,
            was_absolute: false,
            start_index,
            index_offset: start_index as f32 * ENCODER_CPR as f32,
            mode: ControlMode::Trajectory,
        }
    }

    pub fn motor(&self) -> u8 {
        self.config.motor
    }

    pub fn index_offset(&self) -> f32 {
        self.index_offset
    }

    /// Act on one motion message.
    pub fn handle<M: MotionController>(
        &mut self,
        link: &mut M,
        control: u8,
        target: u16,
        speed: u8,
    ) -> LinkResult<()> {
        let motor = self.config.motor;

        // Speed changes reconfigure the trajectory ramps even when the
        // motion itself is a repeat.
        if self.previous_speed != Some(speed) {
            let ramp = (speed as f32 + 1.0) * SPEED_ACCEL_SCALING;
            link.configure_traj_accel_limit(motor, ramp)?;
            link.configure_traj_decel_limit(motor, ramp)?;
            self.previous_speed = Some(speed);
        }

        if self.previous == Some((control, target)) {
            return Ok(());
        }

        let category = categorize(&self.config, control);
        trace!(motor, control, target, ?category, "motion message");

        // Jogs and stops move the axis off the commanded angle, so the
        // next absolute move first re-anchors against accumulated drift.
        if matches!(category, Category::Absolute { .. }) && !self.was_absolute {
            self.reanchor(link)?;
        }

        match category {
            Category::Absolute { scale } => {
                self.ensure_mode(link, ControlMode::Trajectory)?;
                let centered = target as f32 - 32_768.0;
                let position = centered / HOST_COUNTS_PER_MOTOR_COUNT
                    * TRANSMISSION_RATIO
                    * scale
                    + self.index_offset;
                link.trapezoidal_move(motor, position)?;
            }
            Category::JogClockwise => {
                self.ensure_mode(link, ControlMode::Velocity)?;
                link.set_velocity(motor, jog_velocity(self.config.control_map.jog_cw, control))?;
            }
            Category::JogCounterClockwise => {
                self.ensure_mode(link, ControlMode::Velocity)?;
                link.set_velocity(motor, -jog_velocity(self.config.control_map.jog_ccw, control))?;
            }
            Category::StopInPlace => {
                self.ensure_mode(link, ControlMode::Velocity)?;
                link.set_velocity(motor, 0.0)?;
            }
            Category::StopAndReindex => {
                self.ensure_mode(link, ControlMode::Velocity)?;
                link.set_velocity(motor, 0.0)?;
                self.reanchor(link)?;
                // The re-home move runs at homing speed; the planner
                // latches its limits when a move is issued, so the normal
                // limit goes back right after.
                link.configure_traj_velocity_limit(motor, HOMING_VELOCITY)?;
                link.trapezoidal_move(motor, self.index_offset)?;
                link.configure_traj_velocity_limit(motor, TRAJ_VEL_LIMIT)?;
                self.ensure_mode(link, ControlMode::Position)?;
            }
        }

        self.was_absolute = matches!(category, Category::Absolute { .. });
        self.previous = Some((control, target));
        Ok(())
    }

    /// Snap the homing anchor onto the lattice nearest the axis's actual
    /// position.
    fn reanchor<M: MotionController>(&mut self, link: &mut M) -> LinkResult<()> {
        let feedback = link.read_feedback(self.config.motor)?;
        let turns = reindex(
            feedback.position,
            self.start_index,
            ENCODER_CPR as f32,
            TRANSMISSION_RATIO,
        );
        self.index_offset = turns * ENCODER_CPR as f32;
        debug!(
            motor = self.config.motor,
            index_offset = self.index_offset,
            "homing anchor re-established"
        );
        Ok(())
    }

    fn ensure_mode<M: MotionController>(
        &mut self,
        link: &mut M,
        mode: ControlMode,
    ) -> LinkResult<()> {
        if self.mode != mode {
            link.set_control_mode(self.config.motor, mode)?;
            self.mode = mode;
        }
        Ok(())
    }
}
