//! Controller calibration and homing sequencer.
//!
//! Runs once at startup: waits for the motion controller to come up,
//! classifies each axis's calibration state, runs whatever calibration is
//! missing, reapplies the startup behavior flags, and then discovers the
//! homing index that ties the motor's incremental encoder to the
//! fixture's mechanical zero.
//!
//! Every wait is an explicit sequencer state carrying its own deadline
//! and poll interval, driven from a single tick source — the sequencer
//! never sleeps on its own, so periodic work elsewhere in the control
//! loop keeps running during the multi-second calibration and homing
//! moves. All waits fail open: a timeout is logged and the sequencer
//! moves on with whatever state it actually observed. There is no abort
//! path once calibration has begun.

use std::time::{Duration, Instant};

use hardware::odrive::{AxisState, ControlMode, EncoderMode, Feedback, LinkResult};
use hardware::odrive::{MotionController, MotorType};
use hardware::quadrature::PositionSensor;
use tracing::{debug, info, warn};

use crate::config::{
    AxisConfig, FixtureConfig, BRAKING_RESISTANCE, CALIBRATION_CURRENT, CURRENT_LIMIT,
    ENCODER_BANDWIDTH, ENCODER_CPR, HOMING_VELOCITY, POLE_PAIRS, TRAJ_ACCEL_LIMIT,
    TRAJ_DECEL_LIMIT, TRAJ_VEL_LIMIT, TRANSMISSION_RATIO, VELOCITY_LIMIT,
};

/// Interval between state polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bound on every startup wait.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allowed for the controller to come back after a reboot.
pub const REBOOT_DELAY: Duration = Duration::from_secs(2);
/// Dwell before the first settle poll of a homing move.
pub const HOMING_DWELL: Duration = Duration::from_secs(4);
/// Interval between settle polls.
pub const SETTLE_POLL: Duration = Duration::from_millis(250);
/// Feedback velocity below which a homing move counts as settled.
pub const SETTLE_VELOCITY: f32 = 2.0;

// Startup behavior flag defaults reapplied on every boot.
const STARTUP_MOTOR_CALIBRATION: bool = false;
const STARTUP_ENCODER_INDEX_SEARCH: bool = true;
const STARTUP_ENCODER_OFFSET_CALIBRATION: bool = false;
const STARTUP_CLOSED_LOOP: bool = true;
const STARTUP_SENSORLESS: bool = false;

/// Nearest whole motor rotation to an encoder position.
///
/// Positive positions truncate `turns + 0.5`, negative positions truncate
/// `turns - 0.5`. The sign-split rule matches the shipped controller;
/// tests document the tie behavior at exactly ±half rather than replacing
/// the split with a single rounding call.
pub fn nearest_turns(position: f32, cpr: f32) -> i32 {
    let turns = position / cpr;
    if turns >= 0.0 {
        (turns + 0.5) as i32
    } else {
        (turns - 0.5) as i32
    }
}

/// Snap a feedback position back onto the homing lattice.
///
/// The motor encoder slips against the mechanical load over time. Valid
/// homing positions are `start_index` plus whole multiples of the
/// transmission ratio; the nearest rotation to the feedback position is
/// pulled onto that lattice, rejecting accumulated slip without a full
/// homing pass. Returns the snapped index in motor turns.
pub fn reindex(position: f32, start_index: i32, cpr: f32, ratio: f32) -> f32 {
    let rotation = nearest_turns(position, cpr);
    let offset = (rotation - start_index) as f32 % ratio;
    let half = (ratio / 2.0).ceil();
    if offset.abs() < half {
        rotation as f32 - offset
    } else if offset >= 0.0 {
        rotation as f32 - offset + ratio
    } else {
        rotation as f32 - offset - ratio
    }
}

/// What classification decided an axis needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPlan {
    /// Motor and encoder both ready; only the startup flags get rewritten.
    ReapplyFlags,
    /// Motor calibrated but the encoder needs index search and offset
    /// calibration.
    EncoderThenFlags,
    /// Full parameter configuration plus motor and encoder calibration.
    Full,
}

/// Per-axis outcome of the startup pass.
#[derive(Debug, Clone)]
pub struct AxisReport {
    pub motor: u8,
    pub plan: CalibrationPlan,
    pub ready_timed_out: bool,
    /// Whether the homing search actually saw the index reference, or
    /// gave up at the timeout.
    pub index_found: bool,
    pub start_index: i32,
    pub index_offset: f32,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    WaitReady {
        axis: usize,
        deadline: Instant,
    },
    Classify {
        axis: usize,
    },
    MotorCalibration {
        axis: usize,
        deadline: Instant,
    },
    EncoderIndexSearch {
        axis: usize,
        deadline: Instant,
    },
    EncoderOffsetCalibration {
        axis: usize,
        deadline: Instant,
    },
    ApplyStartupFlags {
        axis: usize,
    },
    MaybeReboot,
    RebootWait {
        deadline: Instant,
    },
    HomingStart {
        axis: usize,
    },
    HomingSearch {
        axis: usize,
        deadline: Instant,
        initial_negative: Option<bool>,
    },
    HomingSettle {
        axis: usize,
        deadline: Instant,
    },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerStatus {
    InProgress,
    Complete,
}

struct AxisEntry {
    config: AxisConfig,
    plan: CalibrationPlan,
    ready_timed_out: bool,
    index_found: bool,
    start_index: i32,
    index_offset: f32,
}

/// Steppable startup state machine.
pub struct Sequencer {
    axes: Vec<AxisEntry>,
    phase: Phase,
    next_poll: Instant,
    needs_reconfig: bool,
    rebooted: bool,
}

fn ok_or_warn<T>(result: LinkResult<T>, what: &'static str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, what, "controller link fault; continuing");
            None
        }
    }
}

impl Sequencer {
    pub fn new(config: &FixtureConfig, now: Instant) -> Self {
        let axes = config
            .axes
            .iter()
            .map(|axis| AxisEntry {
                config: axis.clone(),
                plan: CalibrationPlan::ReapplyFlags,
                ready_timed_out: false,
                index_found: false,
                start_index: 0,
                index_offset: 0.0,
            })
            .collect();
        Self {
            axes,
            phase: Phase::WaitReady {
                axis: 0,
                deadline: now + STARTUP_TIMEOUT,
            },
            next_poll: now,
            needs_reconfig: false,
            rebooted: false,
        }
    }

    pub fn reports(&self) -> Vec<AxisReport> {
        self.axes
            .iter()
            .map(|entry| AxisReport {
                motor: entry.config.motor,
                plan: entry.plan,
                ready_timed_out: entry.ready_timed_out,
                index_found: entry.index_found,
                start_index: entry.start_index,
                index_offset: entry.index_offset,
            })
            .collect()
    }

    /// Advance the sequencer. Immediate steps chain within one tick;
    /// a step that needs to wait schedules its next poll and returns.
    pub fn tick<M: MotionController, S: PositionSensor>(
        &mut self,
        link: &mut M,
        sensor: &mut S,
        now: Instant,
    ) -> SequencerStatus {
        if now < self.next_poll {
            return SequencerStatus::InProgress;
        }

        loop {
            match self.phase {
                Phase::WaitReady { axis, deadline } => {
                    let motor = self.axes[axis].config.motor;
                    let state = ok_or_warn(link.current_state(motor), "read state");
                    match state {
                        Some(AxisState::ClosedLoopControl) | Some(AxisState::Idle) => {
                            debug!(motor, ?state, "controller axis ready");
                            self.phase = Phase::Classify { axis };
                        }
                        _ if now >= deadline => {
                            warn!(motor, "timed out waiting for controller ready state");
                            self.axes[axis].ready_timed_out = true;
                            self.phase = Phase::Classify { axis };
                        }
                        _ => {
                            self.next_poll = now + POLL_INTERVAL;
                            return SequencerStatus::InProgress;
                        }
                    }
                }

                Phase::Classify { axis } => {
                    let motor = self.axes[axis].config.motor;
                    let motor_cal =
                        ok_or_warn(link.motor_calibrated(motor), "read motor flag").unwrap_or(false);
                    let encoder_ok =
                        ok_or_warn(link.encoder_ready(motor), "read encoder flag").unwrap_or(false);
                    let plan = match (motor_cal, encoder_ok) {
                        (true, true) => CalibrationPlan::ReapplyFlags,
                        (true, false) => CalibrationPlan::EncoderThenFlags,
                        (false, _) => CalibrationPlan::Full,
                    };
                    info!(motor, ?plan, "axis calibration classified");
                    self.axes[axis].plan = plan;
                    if plan != CalibrationPlan::ReapplyFlags {
                        self.needs_reconfig = true;
                    }
                    match plan {
                        CalibrationPlan::ReapplyFlags => {
                            self.phase = Phase::ApplyStartupFlags { axis };
                        }
                        CalibrationPlan::EncoderThenFlags => {
                            self.begin_encoder_calibration(link, axis, now);
                            return SequencerStatus::InProgress;
                        }
                        CalibrationPlan::Full => {
                            let config = self.axes[axis].config.clone();
                            ok_or_warn(configure_parameters(link, &config), "configure parameters");
                            ok_or_warn(
                                link.request_state(motor, AxisState::MotorCalibration),
                                "request motor calibration",
                            );
                            self.phase = Phase::MotorCalibration {
                                axis,
                                deadline: now + STARTUP_TIMEOUT,
                            };
                            self.next_poll = now + POLL_INTERVAL;
                            return SequencerStatus::InProgress;
                        }
                    }
                }

                Phase::MotorCalibration { axis, deadline } => {
                    let motor = self.axes[axis].config.motor;
                    if !self.poll_idle(link, motor, deadline, now, "motor calibration") {
                        return SequencerStatus::InProgress;
                    }
                    ok_or_warn(link.set_motor_pre_calibrated(motor, true), "motor flag");
                    self.begin_encoder_calibration(link, axis, now);
                    return SequencerStatus::InProgress;
                }

                Phase::EncoderIndexSearch { axis, deadline } => {
                    let motor = self.axes[axis].config.motor;
                    if !self.poll_idle(link, motor, deadline, now, "encoder index search") {
                        return SequencerStatus::InProgress;
                    }
                    ok_or_warn(
                        link.request_state(motor, AxisState::EncoderOffsetCalibration),
                        "request offset calibration",
                    );
                    self.phase = Phase::EncoderOffsetCalibration {
                        axis,
                        deadline: now + STARTUP_TIMEOUT,
                    };
                    self.next_poll = now + POLL_INTERVAL;
                    return SequencerStatus::InProgress;
                }

                Phase::EncoderOffsetCalibration { axis, deadline } => {
                    let motor = self.axes[axis].config.motor;
                    if !self.poll_idle(link, motor, deadline, now, "encoder offset calibration") {
                        return SequencerStatus::InProgress;
                    }
                    ok_or_warn(link.set_encoder_pre_calibrated(motor, true), "encoder flag");
                    ok_or_warn(
                        link.configure_encoder_bandwidth(motor, ENCODER_BANDWIDTH),
                        "encoder bandwidth",
                    );
                    self.phase = Phase::ApplyStartupFlags { axis };
                }

                Phase::ApplyStartupFlags { axis } => {
                    let motor = self.axes[axis].config.motor;
                    ok_or_warn(apply_startup_flags(link, motor), "startup flags");
                    ok_or_warn(
                        link.set_control_mode(motor, ControlMode::Position),
                        "position mode",
                    );
                    if axis + 1 < self.axes.len() {
                        self.phase = Phase::WaitReady {
                            axis: axis + 1,
                            deadline: now + STARTUP_TIMEOUT,
                        };
                    } else {
                        self.phase = Phase::MaybeReboot;
                    }
                }

                Phase::MaybeReboot => {
                    if self.needs_reconfig && !self.rebooted {
                        info!("saving controller configuration and rebooting");
                        ok_or_warn(link.save_configuration(), "save configuration");
                        ok_or_warn(link.reboot(), "reboot");
                        self.rebooted = true;
                        self.needs_reconfig = false;
                        let deadline = now + REBOOT_DELAY;
                        self.phase = Phase::RebootWait { deadline };
                        self.next_poll = deadline;
                        return SequencerStatus::InProgress;
                    }
                    if self.needs_reconfig {
                        warn!("calibration incomplete after reboot; continuing");
                    }
                    self.phase = Phase::HomingStart { axis: 0 };
                }

                Phase::RebootWait { deadline } => {
                    if now < deadline {
                        self.next_poll = deadline;
                        return SequencerStatus::InProgress;
                    }
                    // Re-run the readiness and classification pass for
                    // every axis on the rebooted controller.
                    self.phase = Phase::WaitReady {
                        axis: 0,
                        deadline: now + STARTUP_TIMEOUT,
                    };
                }

                Phase::HomingStart { axis } => {
                    let motor = self.axes[axis].config.motor;
                    ok_or_warn(
                        link.configure_traj_velocity_limit(motor, HOMING_VELOCITY),
                        "homing velocity",
                    );
                    ok_or_warn(
                        link.set_control_mode(motor, ControlMode::Trajectory),
                        "trajectory mode",
                    );
                    ok_or_warn(
                        link.trapezoidal_move(motor, ENCODER_CPR as f32 * TRANSMISSION_RATIO),
                        "homing spin",
                    );
                    info!(motor, "homing spin started");
                    self.phase = Phase::HomingSearch {
                        axis,
                        deadline: now + STARTUP_TIMEOUT,
                        initial_negative: None,
                    };
                    self.next_poll = now + POLL_INTERVAL;
                    return SequencerStatus::InProgress;
                }

                Phase::HomingSearch {
                    axis,
                    deadline,
                    initial_negative,
                } => {
                    let motor = self.axes[axis].config.motor;
                    let mut found = false;
                    let mut initial = initial_negative;
                    match sensor.signed_count() {
                        Ok(count) => match initial {
                            None => initial = Some(count < 0),
                            Some(was_negative) => {
                                if count != 0 && (count < 0) != was_negative {
                                    info!(motor, count, "index reference detected");
                                    found = true;
                                }
                            }
                        },
                        Err(e) => warn!(error = %e, "position sensor fault; continuing"),
                    }

                    if !found && now < deadline {
                        self.phase = Phase::HomingSearch {
                            axis,
                            deadline,
                            initial_negative: initial,
                        };
                        self.next_poll = now + POLL_INTERVAL;
                        return SequencerStatus::InProgress;
                    }
                    if !found {
                        warn!(motor, "homing search timed out without an index reference");
                    }
                    self.axes[axis].index_found = found;
                    self.establish_index(link, axis, now);
                    return SequencerStatus::InProgress;
                }

                Phase::HomingSettle { axis, deadline } => {
                    let motor = self.axes[axis].config.motor;
                    let feedback = ok_or_warn(link.read_feedback(motor), "settle feedback")
                        .unwrap_or(Feedback {
                            position: 0.0,
                            velocity: 0.0,
                        });
                    if feedback.velocity.abs() >= SETTLE_VELOCITY && now < deadline {
                        self.next_poll = now + SETTLE_POLL;
                        return SequencerStatus::InProgress;
                    }
                    if feedback.velocity.abs() >= SETTLE_VELOCITY {
                        warn!(motor, "homing move did not settle before the timeout");
                    } else {
                        info!(motor, "axis homed");
                    }
                    ok_or_warn(
                        link.configure_traj_velocity_limit(motor, TRAJ_VEL_LIMIT),
                        "restore trajectory velocity",
                    );
                    if axis + 1 < self.axes.len() {
                        self.phase = Phase::HomingStart { axis: axis + 1 };
                    } else {
                        self.phase = Phase::Done;
                    }
                }

                Phase::Done => return SequencerStatus::Complete,
            }
        }
    }

    /// Kick off the encoder calibration sub-sequence: index pulse usage,
    /// then a blocking index search request polled to completion.
    fn begin_encoder_calibration<M: MotionController>(
        &mut self,
        link: &mut M,
        axis: usize,
        now: Instant,
    ) {
        let motor = self.axes[axis].config.motor;
        ok_or_warn(link.set_encoder_use_index(motor, true), "encoder use index");
        ok_or_warn(
            link.request_state(motor, AxisState::EncoderIndexSearch),
            "request index search",
        );
        self.phase = Phase::EncoderIndexSearch {
            axis,
            deadline: now + STARTUP_TIMEOUT,
        };
        self.next_poll = now + POLL_INTERVAL;
    }

    /// One poll of a blocking motion request. Returns true when the axis
    /// is back to Idle or the deadline passed (fail open).
    fn poll_idle<M: MotionController>(
        &mut self,
        link: &mut M,
        motor: u8,
        deadline: Instant,
        now: Instant,
        what: &'static str,
    ) -> bool {
        let state = ok_or_warn(link.current_state(motor), "read state");
        if state == Some(AxisState::Idle) {
            debug!(motor, what, "motion request complete");
            return true;
        }
        if now >= deadline {
            warn!(motor, what, "motion request timed out");
            return true;
        }
        self.next_poll = now + POLL_INTERVAL;
        false
    }

    /// Read feedback, derive the homing index, and start the homing move.
    fn establish_index<M: MotionController>(&mut self, link: &mut M, axis: usize, now: Instant) {
        let entry = &self.axes[axis];
        let motor = entry.config.motor;
        let home_offset = entry.config.home_offset_turns;

        let feedback = ok_or_warn(link.read_feedback(motor), "homing feedback").unwrap_or(
            Feedback {
                position: 0.0,
                velocity: 0.0,
            },
        );
        let rotation = nearest_turns(feedback.position, ENCODER_CPR as f32);
        let start_index = rotation - home_offset;
        let index_offset = start_index as f32 * ENCODER_CPR as f32;
        info!(motor, start_index, index_offset, "homing index established");

        let entry = &mut self.axes[axis];
        entry.start_index = start_index;
        entry.index_offset = index_offset;

        ok_or_warn(link.trapezoidal_move(motor, index_offset), "homing move");
        self.phase = Phase::HomingSettle {
            axis,
            deadline: now + STARTUP_TIMEOUT,
        };
        self.next_poll = now + HOMING_DWELL;
    }
}

/// Full parameter configuration for an uncalibrated axis.
fn configure_parameters<M: MotionController>(link: &mut M, config: &AxisConfig) -> LinkResult<()> {
    let motor = config.motor;
    link.set_control_mode(motor, ControlMode::Trajectory)?;

    link.configure_braking_resistance(BRAKING_RESISTANCE)?;
    link.configure_current_limit(motor, CURRENT_LIMIT)?;
    link.configure_calibration_current(motor, CALIBRATION_CURRENT)?;
    link.configure_velocity_limit(motor, VELOCITY_LIMIT)?;
    link.configure_pole_pairs(motor, POLE_PAIRS)?;
    link.configure_motor_type(motor, MotorType::HighCurrent)?;
    link.configure_cpr(motor, ENCODER_CPR)?;
    link.configure_encoder_mode(motor, EncoderMode::Incremental)?;

    link.configure_traj_velocity_limit(motor, TRAJ_VEL_LIMIT)?;
    link.configure_traj_accel_limit(motor, TRAJ_ACCEL_LIMIT)?;
    link.configure_traj_decel_limit(motor, TRAJ_DECEL_LIMIT)?;

    link.configure_pos_gain(motor, config.gains.pos)?;
    link.configure_vel_gain(motor, config.gains.vel)?;
    link.configure_vel_integrator_gain(motor, config.gains.vel_integrator)?;
    Ok(())
}

fn apply_startup_flags<M: MotionController>(link: &mut M, motor: u8) -> LinkResult<()> {
    link.set_startup_motor_calibration(motor, STARTUP_MOTOR_CALIBRATION)?;
    link.set_startup_encoder_index_search(motor, STARTUP_ENCODER_INDEX_SEARCH)?;
    link.set_startup_encoder_offset_calibration(motor, STARTUP_ENCODER_OFFSET_CALIBRATION)?;
    link.set_startup_closed_loop(motor, STARTUP_CLOSED_LOOP)?;
    link.set_startup_sensorless(motor, STARTUP_SENSORLESS)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FixtureConfig, Profile};
    use hardware::odrive::mock::{Command, MockController};
    use hardware::quadrature::MockSensor;

    #[test]
    fn nearest_turns_rounds_by_sign() {
        let cpr = 8192.0;
        assert_eq!(nearest_turns(0.0, cpr), 0);
        assert_eq!(nearest_turns(8191.0, cpr), 1);
        assert_eq!(nearest_turns(12_288.0, cpr), 2); // exactly 1.5 turns
        assert_eq!(nearest_turns(-8191.0, cpr), -1);
        assert_eq!(nearest_turns(-12_288.0, cpr), -2); // exactly -1.5 turns
        // The tie at ±half rounds away from zero on both sides; the rule
        // is written as a sign split, so both branches get pinned here.
        assert_eq!(nearest_turns(4096.0, cpr), 1);
        assert_eq!(nearest_turns(-4096.0, cpr), -1);
    }

    #[test]
    fn reindex_snaps_within_half_ratio() {
        let cpr = 8192.0;
        let ratio = TRANSMISSION_RATIO;
        let bound = (ratio / 2.0).ceil();
        for start_index in [-3i32, 0, 5] {
            for rotation in -20..=20 {
                let position = rotation as f32 * cpr;
                let snapped = reindex(position, start_index, cpr, ratio);
                assert!(
                    (snapped - rotation as f32).abs() <= bound,
                    "rotation {rotation} start {start_index} snapped {snapped}"
                );
                // Snapped value sits on the homing lattice.
                let steps = (snapped - start_index as f32) / ratio;
                assert!(
                    (steps - steps.round()).abs() < 1e-3,
                    "snapped {snapped} off lattice"
                );
            }
        }
    }

    #[test]
    fn reindex_ties_snap_consistently() {
        // Integer ratio makes the tie exact: offset == ceil(N/2) snaps to
        // the adjacent multiple, in the offset's own direction.
        let cpr = 8192.0;
        let up = reindex(6.0 * cpr, 0, cpr, 4.0);
        assert_eq!(up, 8.0);
        let down = reindex(-6.0 * cpr, 0, cpr, 4.0);
        assert_eq!(down, -8.0);
    }

    fn run_to_completion(
        seq: &mut Sequencer,
        link: &mut MockController,
        sensor: &mut MockSensor,
    ) -> Vec<AxisReport> {
        let mut now = Instant::now();
        for _ in 0..100_000 {
            if seq.tick(link, sensor, now) == SequencerStatus::Complete {
                return seq.reports();
            }
            now += Duration::from_millis(100);
        }
        panic!("sequencer never completed");
    }

    #[test]
    fn calibrated_axis_only_reapplies_flags() {
        let config = FixtureConfig::for_profile(Profile::Body);
        let motor = config.axes[0].motor;
        let mut link = MockController::new();
        link.set_default_state(motor, AxisState::ClosedLoopControl);
        link.set_calibration_flags(motor, true, true);
        let mut sensor = MockSensor::new(&[100, -100]);

        let mut seq = Sequencer::new(&config, Instant::now());
        let reports = run_to_completion(&mut seq, &mut link, &mut sensor);

        assert_eq!(reports[0].plan, CalibrationPlan::ReapplyFlags);
        assert!(reports[0].index_found);

        // No calibration requests, no parameter writes, no reboot.
        assert!(!link
            .commands
            .iter()
            .any(|c| matches!(c, Command::RequestState { .. })));
        assert!(!link
            .commands
            .iter()
            .any(|c| matches!(c, Command::Configure { param: "pole_pairs", .. })));
        assert!(!link.commands.contains(&Command::Save));
        assert!(!link.commands.contains(&Command::Reboot));

        // The five startup flags were rewritten.
        let flags: Vec<_> = link
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::SetFlag { flag, value, .. } if flag.starts_with("startup_") => {
                    Some((*flag, *value))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            flags,
            vec![
                ("startup_motor_calibration", false),
                ("startup_encoder_index_search", true),
                ("startup_encoder_offset_calibration", false),
                ("startup_closed_loop", true),
                ("startup_sensorless", false),
            ]
        );
    }

    #[test]
    fn uncalibrated_axis_runs_full_sequence_and_reboots() {
        let config = FixtureConfig::for_profile(Profile::Body);
        let motor = config.axes[0].motor;
        let mut link = MockController::new();
        link.set_calibration_flags(motor, false, false);
        let mut sensor = MockSensor::new(&[50, -50]);

        let mut seq = Sequencer::new(&config, Instant::now());
        let reports = run_to_completion(&mut seq, &mut link, &mut sensor);

        assert_eq!(reports[0].plan, CalibrationPlan::ReapplyFlags);

        let requests: Vec<_> = link
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::RequestState { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            requests,
            vec![
                AxisState::MotorCalibration,
                AxisState::EncoderIndexSearch,
                AxisState::EncoderOffsetCalibration,
            ]
        );

        // Reconfiguration persists and reboots exactly once.
        assert_eq!(link.commands.iter().filter(|c| **c == Command::Save).count(), 1);
        assert_eq!(
            link.commands.iter().filter(|c| **c == Command::Reboot).count(),
            1
        );

        // Parameters were configured before calibrating.
        let save_at = link.commands.iter().position(|c| *c == Command::Save);
        let pole_at = link
            .commands
            .iter()
            .position(|c| matches!(c, Command::Configure { param: "pole_pairs", .. }));
        assert!(pole_at.unwrap() < save_at.unwrap());
    }

    #[test]
    fn encoder_only_plan_skips_motor_calibration() {
        let config = FixtureConfig::for_profile(Profile::Head);
        let motor = config.axes[0].motor;
        let mut link = MockController::new();
        link.set_calibration_flags(motor, true, false);
        let mut sensor = MockSensor::new(&[-10, 10]);

        let mut seq = Sequencer::new(&config, Instant::now());
        run_to_completion(&mut seq, &mut link, &mut sensor);

        let requests: Vec<_> = link
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::RequestState { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            requests,
            vec![
                AxisState::EncoderIndexSearch,
                AxisState::EncoderOffsetCalibration,
            ]
        );
    }

    #[test]
    fn homing_derives_index_from_feedback() {
        let config = FixtureConfig::for_profile(Profile::Body);
        let axis = &config.axes[0];
        let motor = axis.motor;
        let mut link = MockController::new();
        link.set_default_state(motor, AxisState::ClosedLoopControl);
        link.set_calibration_flags(motor, true, true);
        // Homing stops near 3 motor turns; sensor crosses zero.
        link.push_feedback(motor, 3.2 * ENCODER_CPR as f32, 0.0);
        let mut sensor = MockSensor::new(&[200, -200]);

        let mut seq = Sequencer::new(&config, Instant::now());
        let reports = run_to_completion(&mut seq, &mut link, &mut sensor);

        let expected_index = 3 - axis.home_offset_turns;
        assert_eq!(reports[0].start_index, expected_index);
        assert_eq!(
            reports[0].index_offset,
            expected_index as f32 * ENCODER_CPR as f32
        );

        // The homing move targeted the derived offset.
        assert!(link.commands.iter().any(|c| matches!(
            c,
            Command::TrapezoidalMove { position, .. }
                if (*position - reports[0].index_offset).abs() < 1e-3
        )));
    }

    #[test]
    fn homing_search_times_out_fail_open() {
        let config = FixtureConfig::for_profile(Profile::Body);
        let motor = config.axes[0].motor;
        let mut link = MockController::new();
        link.set_default_state(motor, AxisState::ClosedLoopControl);
        link.set_calibration_flags(motor, true, true);
        // Sensor never changes sign.
        let mut sensor = MockSensor::new(&[500]);

        let mut seq = Sequencer::new(&config, Instant::now());
        let reports = run_to_completion(&mut seq, &mut link, &mut sensor);

        assert!(!reports[0].index_found);
        // Index still derived from whatever feedback said.
        assert_eq!(reports[0].start_index, -config.axes[0].home_offset_turns);
    }
}
