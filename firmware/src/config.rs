//! Fixture configuration.
//!
//! The original controller selected its axis complement (body-only,
//! head-only, or both motors on one controller for bench testing) with
//! compile-time switches. Here the active axis set is plain data: a
//! [`FixtureConfig`] built from a [`Profile`] at startup, or loaded from a
//! JSON file so a bench setup can tweak sentinel bytes and gains without a
//! rebuild.

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

// Controller limits.
pub const BRAKING_RESISTANCE: f32 = 2.0; // ohms
pub const CURRENT_LIMIT: f32 = 10.0; // amps
pub const CALIBRATION_CURRENT: f32 = 15.0; // amps
pub const VELOCITY_LIMIT: f32 = 300_000.0; // counts/s
pub const POLE_PAIRS: i32 = 7;
pub const ENCODER_CPR: i32 = 8192; // counts/revolution
pub const ENCODER_BANDWIDTH: f32 = 1000.0; // Hz, signal filter constant

// Trajectory control limits.
pub const TRAJ_VEL_LIMIT: f32 = 128_000.0; // divides evenly across the speed byte
pub const TRAJ_ACCEL_LIMIT: f32 = 202_400.0;
pub const TRAJ_DECEL_LIMIT: f32 = 202_400.0;

// Velocity control limit; jog mapping spreads the sub-range across it.
pub const JOG_VELOCITY_LIMIT: f32 = 103_320.0;

pub const HOMING_VELOCITY: f32 = 4096.0; // counts/s

/// Motor revolutions per mechanical (system) revolution across the belt
/// transmission.
pub const TRANSMISSION_RATIO: f32 = 4.2;

/// Host target full-scale (65536) counts per motor encoder count.
pub const HOST_COUNTS_PER_MOTOR_COUNT: f32 = 65_536.0 / ENCODER_CPR as f32;

/// Linear map from the 8-bit speed byte to trajectory accel/decel counts/s².
pub const SPEED_ACCEL_SCALING: f32 = 790.0;

/// Which fixture build this process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// Pan (body) axis only.
    Body,
    /// Tilt (head) axis only.
    Head,
    /// Both motors on a single controller, bench testing only.
    BothForTesting,
}

/// Which host message stream an axis listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisRole {
    Body,
    Head,
}

/// Position/velocity/integrator gains for one axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGains {
    pub pos: f32,
    pub vel: f32,
    pub vel_integrator: f32,
}

pub const BODY_GAINS: PidGains = PidGains {
    pos: 20.0,
    vel: 0.0005,
    vel_integrator: 0.001,
};

pub const HEAD_GAINS: PidGains = PidGains {
    pos: 50.0,
    vel: 0.0005,
    vel_integrator: 0.0025,
};

/// Control-byte partition for one axis. Sentinel values differ slightly
/// between the pan and tilt conventions; the category semantics do not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlMap {
    /// Absolute move scaled for the wide range preset.
    pub preset_a: u8,
    /// Absolute move scaled for the narrow range preset.
    pub preset_b: u8,
    /// Inclusive clockwise jog sub-range.
    pub jog_cw: (u8, u8),
    pub stop_in_place: u8,
    pub stop_and_reindex: u8,
    /// Inclusive counter-clockwise jog sub-range.
    pub jog_ccw: (u8, u8),
}

impl ControlMap {
    /// Whether `byte` falls in any category.
    pub fn covers(&self, byte: u8) -> bool {
        byte == self.preset_a
            || byte == self.preset_b
            || byte == self.stop_in_place
            || byte == self.stop_and_reindex
            || (self.jog_cw.0..=self.jog_cw.1).contains(&byte)
            || (self.jog_ccw.0..=self.jog_ccw.1).contains(&byte)
    }
}

/// Pan-axis convention.
pub const BODY_CONTROL_MAP: ControlMap = ControlMap {
    preset_a: 0,
    preset_b: 1,
    jog_cw: (2, 127),
    stop_in_place: 128,
    stop_and_reindex: 129,
    jog_ccw: (130, 255),
};

/// Tilt-axis convention: the stop sentinels sit one slot lower.
pub const HEAD_CONTROL_MAP: ControlMap = ControlMap {
    preset_a: 0,
    preset_b: 1,
    jog_cw: (2, 126),
    stop_in_place: 127,
    stop_and_reindex: 128,
    jog_ccw: (129, 255),
};

/// Angular span scale factors for the range presets, relative to one full
/// mechanical rotation.
pub const SCALE_540: f32 = 1.5;
pub const SCALE_360: f32 = 1.0;
pub const SCALE_270: f32 = 0.75;

/// Everything the control core needs to know about one axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    pub role: AxisRole,
    /// Controller motor number.
    pub motor: u8,
    /// Angular scale for preset A and preset B.
    pub presets: [f32; 2],
    pub control_map: ControlMap,
    /// Whole rotations between the index sensor's physical location and
    /// true mechanical zero.
    pub home_offset_turns: i32,
    pub gains: PidGains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureConfig {
    /// Byte written back to the host on an Identify request.
    pub identifier: u8,
    pub axes: Vec<AxisConfig>,
}

fn body_axis() -> AxisConfig {
    AxisConfig {
        role: AxisRole::Body,
        motor: 1,
        presets: [SCALE_540, SCALE_360],
        control_map: BODY_CONTROL_MAP,
        home_offset_turns: 1,
        gains: BODY_GAINS,
    }
}

fn head_axis() -> AxisConfig {
    AxisConfig {
        role: AxisRole::Head,
        motor: 0,
        presets: [SCALE_540, SCALE_270],
        control_map: HEAD_CONTROL_MAP,
        home_offset_turns: 1,
        gains: HEAD_GAINS,
    }
}

impl FixtureConfig {
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Body => Self {
                identifier: 0xAF,
                axes: vec![body_axis()],
            },
            Profile::Head => Self {
                identifier: 0x50,
                axes: vec![head_axis()],
            },
            Profile::BothForTesting => Self {
                identifier: 0xB7,
                axes: vec![body_axis(), head_axis()],
            },
        }
    }

    pub fn axis(&self, role: AxisRole) -> Option<&AxisConfig> {
        self.axes.iter().find(|a| a.role == role)
    }

    /// Every host control byte must land in a category on every axis; a
    /// gap would leave valid host commands with no meaning.
    pub fn validate(&self) -> Result<(), String> {
        for axis in &self.axes {
            if let Some(byte) = (0..=255u8).find(|b| !axis.control_map.covers(*b)) {
                return Err(format!(
                    "control map for {:?} axis does not cover byte {byte}",
                    axis.role
                ));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json).map_err(std::io::Error::other)?;
        config.validate().map_err(std::io::Error::other)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
