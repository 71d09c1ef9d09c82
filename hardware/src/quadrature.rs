//! LS7366R quadrature counter driver.
//!
//! The fixture's absolute position reference is a magnetic quadrature
//! sensor accumulated by an LS7366R counter chip on a register bus. Two
//! board revisions exist: one reports a two's-complement count directly,
//! the other reports a magnitude with the sign carried in the status
//! register. [`PositionSensor`] hides the difference behind a single
//! signed-count read.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::trace;

/// Read-counter opcode (RD | CNTR).
const OP_READ_COUNTER: u8 = 0x60;
/// Read-status opcode (RD | STR).
const OP_READ_STATUS: u8 = 0x70;
/// Sign flag bit in the status register.
const STATUS_SIGN_BIT: u8 = 0x01;
/// The counter accumulates four bytes.
const COUNTER_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("register bus error: {0}")]
    Bus(String),
}

pub type SensorResult<T> = Result<T, SensorError>;

/// Register-level access to the counter chip. The SPI plumbing behind
/// this trait is board-specific and lives with the binary.
pub trait RegisterBus {
    /// Issue `opcode` and read `out.len()` bytes back.
    fn read_register(&mut self, opcode: u8, out: &mut [u8]) -> SensorResult<()>;
}

/// The single operation the control core consumes: a signed accumulated
/// count, regardless of how the hardware encodes the sign.
pub trait PositionSensor {
    fn signed_count(&mut self) -> SensorResult<i32>;
}

/// How the counter encodes negative counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMode {
    /// Counter register is natively two's-complement.
    TwosComplement,
    /// Counter register holds a magnitude; the status register's sign
    /// flag says which direction.
    StatusFlag,
}

/// LS7366R driver over any register bus.
pub struct Ls7366r<B> {
    bus: B,
    sign_mode: SignMode,
}

impl<B: RegisterBus> Ls7366r<B> {
    pub fn new(bus: B, sign_mode: SignMode) -> Self {
        Self { bus, sign_mode }
    }

    fn read_counter_raw(&mut self) -> SensorResult<u32> {
        let mut bytes = [0u8; COUNTER_BYTES];
        self.bus.read_register(OP_READ_COUNTER, &mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl<B: RegisterBus> PositionSensor for Ls7366r<B> {
    fn signed_count(&mut self) -> SensorResult<i32> {
        let raw = self.read_counter_raw()?;
        let count = match self.sign_mode {
            SignMode::TwosComplement => raw as i32,
            SignMode::StatusFlag => {
                let mut status = [0u8];
                self.bus.read_register(OP_READ_STATUS, &mut status)?;
                let magnitude = raw as i32;
                if status[0] & STATUS_SIGN_BIT != 0 {
                    -magnitude
                } else {
                    magnitude
                }
            }
        };
        trace!(count, "quadrature read");
        Ok(count)
    }
}

/// Scripted sensor for tests: replays a queue of counts, repeating the
/// last one once drained.
#[derive(Default)]
pub struct MockSensor {
    counts: VecDeque<i32>,
    last: i32,
}

impl MockSensor {
    pub fn new(counts: &[i32]) -> Self {
        Self {
            counts: counts.iter().copied().collect(),
            last: counts.last().copied().unwrap_or(0),
        }
    }

    pub fn push(&mut self, count: i32) {
        self.counts.push_back(count);
        self.last = count;
    }
}

impl PositionSensor for MockSensor {
    fn signed_count(&mut self) -> SensorResult<i32> {
        Ok(self.counts.pop_front().unwrap_or(self.last))
    }
}
