//! Enumerations mirroring the ODrive firmware's numeric parameter spaces.

/// Axis state machine values reported by `axisN.current_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    /// Falls through to idle.
    Undefined,
    /// PWM disabled, motor unpowered.
    Idle,
    /// Runs the sequence selected by the `startup_*` config flags.
    StartupSequence,
    /// All calibration procedures, then idle.
    FullCalibrationSequence,
    MotorCalibration,
    SensorlessControl,
    EncoderIndexSearch,
    EncoderOffsetCalibration,
    ClosedLoopControl,
    LockinSpin,
    EncoderDirFind,
    /// A state value this driver does not recognize.
    Unknown(i32),
}

impl AxisState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => AxisState::Undefined,
            1 => AxisState::Idle,
            2 => AxisState::StartupSequence,
            3 => AxisState::FullCalibrationSequence,
            4 => AxisState::MotorCalibration,
            5 => AxisState::SensorlessControl,
            6 => AxisState::EncoderIndexSearch,
            7 => AxisState::EncoderOffsetCalibration,
            8 => AxisState::ClosedLoopControl,
            9 => AxisState::LockinSpin,
            10 => AxisState::EncoderDirFind,
            other => AxisState::Unknown(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            AxisState::Undefined => 0,
            AxisState::Idle => 1,
            AxisState::StartupSequence => 2,
            AxisState::FullCalibrationSequence => 3,
            AxisState::MotorCalibration => 4,
            AxisState::SensorlessControl => 5,
            AxisState::EncoderIndexSearch => 6,
            AxisState::EncoderOffsetCalibration => 7,
            AxisState::ClosedLoopControl => 8,
            AxisState::LockinSpin => 9,
            AxisState::EncoderDirFind => 10,
            AxisState::Unknown(other) => other,
        }
    }
}

/// Controller control-mode values written to `controller.config.control_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Voltage,
    Current,
    Velocity,
    Position,
    Trajectory,
}

impl ControlMode {
    pub fn as_raw(self) -> i32 {
        match self {
            ControlMode::Voltage => 0,
            ControlMode::Current => 1,
            ControlMode::Velocity => 2,
            ControlMode::Position => 3,
            ControlMode::Trajectory => 4,
        }
    }
}

/// Motor type values for `motor.config.motor_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorType {
    HighCurrent,
    LowCurrent,
    Gimbal,
}

impl MotorType {
    pub fn as_raw(self) -> i32 {
        match self {
            MotorType::HighCurrent => 0,
            MotorType::LowCurrent => 1,
            MotorType::Gimbal => 2,
        }
    }
}

/// Encoder mode values for `encoder.config.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMode {
    Incremental,
    Hall,
}

impl EncoderMode {
    pub fn as_raw(self) -> i32 {
        match self {
            EncoderMode::Incremental => 0,
            EncoderMode::Hall => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for raw in 0..=10 {
            assert_eq!(AxisState::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(AxisState::from_raw(42), AxisState::Unknown(42));
    }
}
