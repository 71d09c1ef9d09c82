//! StormBreaker host link framing.
//!
//! The host speaks a two-byte-header binary protocol: a signed type tag,
//! a declared payload size, then the payload. 16-bit fields are
//! big-endian. The framer is push-based: bytes read from the host port
//! are pushed into a buffer and complete messages are extracted one at a
//! time, so the control loop never blocks waiting for a payload — a
//! partial message that sits too long is dropped as starvation instead.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Fixed payload sizes.
pub const SIZE_IDENTIFY: u8 = 0;
pub const SIZE_BODY: u8 = 5;
pub const SIZE_HEAD: u8 = 11;
/// Head payload with the trailing RGB LED extension.
pub const SIZE_HEAD_LED: u8 = 14;

/// How long a partial message may wait for its remaining bytes.
pub const DEFAULT_STARVATION_BOUND: Duration = Duration::from_secs(1);

/// Signed message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error,
    Warning,
    Ok,
    ArtNetBody,
    ArtNetHead,
    Identify,
}

impl MessageType {
    pub fn from_tag(tag: i8) -> Option<Self> {
        match tag {
            -2 => Some(MessageType::Error),
            -1 => Some(MessageType::Warning),
            0 => Some(MessageType::Ok),
            1 => Some(MessageType::ArtNetBody),
            2 => Some(MessageType::ArtNetHead),
            99 => Some(MessageType::Identify),
            _ => None,
        }
    }

    pub fn tag(self) -> i8 {
        match self {
            MessageType::Error => -2,
            MessageType::Warning => -1,
            MessageType::Ok => 0,
            MessageType::ArtNetBody => 1,
            MessageType::ArtNetHead => 2,
            MessageType::Identify => 99,
        }
    }

    /// Valid payload sizes for this type.
    pub fn payload_sizes(self) -> &'static [u8] {
        match self {
            MessageType::Error | MessageType::Warning | MessageType::Ok => &[0],
            MessageType::ArtNetBody => &[SIZE_BODY],
            MessageType::ArtNetHead => &[SIZE_HEAD, SIZE_HEAD_LED],
            MessageType::Identify => &[SIZE_IDENTIFY],
        }
    }
}

/// Pan-axis command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtNetBody {
    pub pan: u16,
    pub pan_control: u8,
    pub pan_tilt_speed: u8,
    pub power_special_functions: u8,
}

impl ArtNetBody {
    pub fn encode(&self) -> [u8; 7] {
        let pan = self.pan.to_be_bytes();
        [
            MessageType::ArtNetBody.tag() as u8,
            SIZE_BODY,
            pan[0],
            pan[1],
            self.pan_control,
            self.pan_tilt_speed,
            self.power_special_functions,
        ]
    }
}

/// Tilt-axis command payload, with optics fields and an optional RGB LED
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtNetHead {
    pub strobe_shutter: u8,
    pub iris: u8,
    pub zoom: u16,
    pub focus: u16,
    pub tilt: u16,
    pub tilt_control: u8,
    pub pan_tilt_speed: u8,
    pub power_special_functions: u8,
    pub led: Option<[u8; 3]>,
}

impl ArtNetHead {
    pub fn encode(&self) -> Vec<u8> {
        let size = if self.led.is_some() {
            SIZE_HEAD_LED
        } else {
            SIZE_HEAD
        };
        let mut bytes = Vec::with_capacity(2 + size as usize);
        bytes.push(MessageType::ArtNetHead.tag() as u8);
        bytes.push(size);
        bytes.push(self.strobe_shutter);
        bytes.push(self.iris);
        bytes.extend_from_slice(&self.zoom.to_be_bytes());
        bytes.extend_from_slice(&self.focus.to_be_bytes());
        bytes.extend_from_slice(&self.tilt.to_be_bytes());
        bytes.push(self.tilt_control);
        bytes.push(self.pan_tilt_speed);
        bytes.push(self.power_special_functions);
        if let Some(led) = self.led {
            bytes.extend_from_slice(&led);
        }
        bytes
    }
}

/// One decoded host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Error/Warning/Ok — status only, no payload, no action.
    Status(MessageType),
    Identify,
    Body(ArtNetBody),
    Head(ArtNetHead),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unrecognized message type tag {0}")]
    UnknownType(i8),

    #[error("declared size {declared} does not match {mtype:?}")]
    SizeMismatch { mtype: MessageType, declared: u8 },

    #[error("host link starved mid-message, dropped {dropped} buffered bytes")]
    Starvation { dropped: usize },
}

/// Push-based message framer.
///
/// Resynchronization policy: an unknown type tag consumes exactly one
/// byte (the declared-size byte of a misaligned stream is not trusted);
/// a size mismatch on a known type trusts the declared size and skips
/// that many payload bytes.
pub struct MessageFramer {
    buffer: Vec<u8>,
    partial_since: Option<Instant>,
    starvation_bound: Duration,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            partial_since: None,
            starvation_bound: DEFAULT_STARVATION_BOUND,
        }
    }

    pub fn with_starvation_bound(mut self, bound: Duration) -> Self {
        self.starvation_bound = bound;
        self
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract the next message, if a complete one is buffered.
    ///
    /// `now` drives the starvation clock: a partial message that has
    /// waited longer than the bound is discarded and reported.
    pub fn next_message(&mut self, now: Instant) -> Option<Result<Message, ProtocolError>> {
        if self.buffer.is_empty() {
            self.partial_since = None;
            return None;
        }

        let tag = self.buffer[0] as i8;
        let Some(mtype) = MessageType::from_tag(tag) else {
            self.consume(1);
            return Some(Err(ProtocolError::UnknownType(tag)));
        };

        if self.buffer.len() < 2 {
            return self.starve(now);
        }

        let declared = self.buffer[1];
        let total = 2 + declared as usize;

        if !mtype.payload_sizes().contains(&declared) {
            if self.buffer.len() < total {
                return self.starve(now);
            }
            self.consume(total);
            return Some(Err(ProtocolError::SizeMismatch { mtype, declared }));
        }

        if self.buffer.len() < total {
            return self.starve(now);
        }

        let message = decode(mtype, &self.buffer[2..total]);
        self.consume(total);
        Some(Ok(message))
    }

    fn consume(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.partial_since = None;
    }

    fn starve(&mut self, now: Instant) -> Option<Result<Message, ProtocolError>> {
        match self.partial_since {
            None => {
                self.partial_since = Some(now);
                None
            }
            Some(since) if now.duration_since(since) >= self.starvation_bound => {
                let dropped = self.buffer.len();
                self.buffer.clear();
                self.partial_since = None;
                Some(Err(ProtocolError::Starvation { dropped }))
            }
            Some(_) => None,
        }
    }
}

fn be_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([payload[at], payload[at + 1]])
}

/// Decode a size-validated payload.
fn decode(mtype: MessageType, payload: &[u8]) -> Message {
    match mtype {
        MessageType::Error | MessageType::Warning | MessageType::Ok => Message::Status(mtype),
        MessageType::Identify => Message::Identify,
        MessageType::ArtNetBody => Message::Body(ArtNetBody {
            pan: be_u16(payload, 0),
            pan_control: payload[2],
            pan_tilt_speed: payload[3],
            power_special_functions: payload[4],
        }),
        MessageType::ArtNetHead => Message::Head(ArtNetHead {
            strobe_shutter: payload[0],
            iris: payload[1],
            zoom: be_u16(payload, 2),
            focus: be_u16(payload, 4),
            tilt: be_u16(payload, 6),
            tilt_control: payload[8],
            pan_tilt_speed: payload[9],
            power_special_functions: payload[10],
            led: if payload.len() == SIZE_HEAD_LED as usize {
                Some([payload[11], payload[12], payload[13]])
            } else {
                None
            },
        }),
    }
}
