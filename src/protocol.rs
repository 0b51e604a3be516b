//! Wire protocol of the walker force sensor.
//!
//! The device streams newline-terminated ASCII over a serial line at 57600 baud.
//! Each line is either a boot sentinel or one sample of the four load cells:
//!
//! ```text
//! Starting...
//! Finished Setup!
//! 1234.5,987.0,-12.3,45.6
//! ```
//!
//! Sample fields are in fixed channel order: right-rear, right-front,
//! left-rear, left-front.
//!
//! # Framing
//!
//! Serial reads return arbitrary chunks, so a line may arrive split across
//! several reads or several lines may arrive in one read. [`LineAssembler`]
//! buffers bytes until a terminator is seen and hands out complete lines.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate of the sensor firmware.
pub const BAUD_RATE: u32 = 57_600;

/// Sentinel printed by the firmware when it boots.
pub const SENTINEL_STARTING: &str = "Starting...";

/// Sentinel printed once the load cell amplifiers are initialised.
pub const SENTINEL_READY: &str = "Finished Setup!";

/// Number of load cell channels in a frame.
pub const CHANNEL_COUNT: usize = 4;

/// Readings beyond this magnitude are treated as line corruption.
pub const MAX_MAGNITUDE: f64 = 1_000_000.0;

/// Pending bytes allowed without a line terminator before the buffer is dropped.
pub const MAX_PENDING_BYTES: usize = 4096;

// ============================================================================
// Channels
// ============================================================================

/// One load cell of the walker, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    RightRear = 0,
    RightFront = 1,
    LeftRear = 2,
    LeftFront = 3,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::RightRear,
        Channel::RightFront,
        Channel::LeftRear,
        Channel::LeftFront,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Two-letter code used on the wire and in exports.
    pub fn code(self) -> &'static str {
        match self {
            Channel::RightRear => "rr",
            Channel::RightFront => "rf",
            Channel::LeftRear => "lr",
            Channel::LeftFront => "lf",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Channel::RightRear => "Right-Rear",
            Channel::RightFront => "Right-Front",
            Channel::LeftRear => "Left-Rear",
            Channel::LeftFront => "Left-Front",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Channel {
    type Err = String;

    /// Accepts the wire code (`rr`), the label (`right-rear`) or the index (`0`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        if let Ok(index) = needle.parse::<usize>() {
            return Self::from_index(index)
                .ok_or_else(|| format!("channel index {index} out of range (0-3)"));
        }
        Self::ALL
            .into_iter()
            .find(|ch| ch.code() == needle || ch.label().to_ascii_lowercase() == needle)
            .ok_or_else(|| format!("unknown channel '{s}' (expected rr, rf, lr or lf)"))
    }
}

// ============================================================================
// Frames
// ============================================================================

/// A validated sample straight off the wire, before tare and scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFrame {
    /// Readings in [`Channel`] order.
    pub values: [f64; CHANNEL_COUNT],
    /// Host instant at which the line was read.
    pub at: Instant,
}

impl RawFrame {
    /// Validate a line and stamp it with its acquisition instant.
    pub fn parse(line: &str, at: Instant) -> Result<Self, FrameRejection> {
        parse_frame(line).map(|values| Self { values, at })
    }

    #[inline]
    pub fn value(&self, channel: Channel) -> f64 {
        self.values[channel.index()]
    }
}

/// A sample after tare subtraction and scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub values: [f64; CHANNEL_COUNT],
    pub at: Instant,
}

impl Frame {
    #[inline]
    pub fn value(&self, channel: Channel) -> f64 {
        self.values[channel.index()]
    }
}

/// Why a line was not accepted as a frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameRejection {
    #[error("expected 4 comma-separated fields, found {0}")]
    WrongFieldCount(usize),
    #[error("malformed decimal point in field {field}: '{text}'")]
    MalformedDecimal { field: usize, text: String },
    #[error("field {field} is not a finite number: '{text}'")]
    Unparseable { field: usize, text: String },
    #[error("field {field} magnitude {value} exceeds sanity bound")]
    OutOfRange { field: usize, value: f64 },
}

/// Parse a data line into channel readings.
///
/// Rules are applied in order and the first failure rejects the line:
/// exactly three separators, at most one decimal point per field, a finite
/// number, and a magnitude within [`MAX_MAGNITUDE`].
pub fn parse_frame(line: &str) -> Result<[f64; CHANNEL_COUNT], FrameRejection> {
    let separators = line.matches(',').count();
    if separators != CHANNEL_COUNT - 1 {
        return Err(FrameRejection::WrongFieldCount(separators + 1));
    }

    let mut values = [0.0; CHANNEL_COUNT];
    for (field, (slot, text)) in values.iter_mut().zip(line.split(',')).enumerate() {
        let text = text.trim();
        if text.matches('.').count() > 1 || text.contains("..") {
            return Err(FrameRejection::MalformedDecimal {
                field,
                text: text.to_string(),
            });
        }
        let value = match text.parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                return Err(FrameRejection::Unparseable {
                    field,
                    text: text.to_string(),
                })
            }
        };
        if value.abs() > MAX_MAGNITUDE {
            return Err(FrameRejection::OutOfRange { field, value });
        }
        *slot = value;
    }
    Ok(values)
}

/// Boot sentinels recognised on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Starting,
    FinishedSetup,
}

impl Sentinel {
    pub fn detect(line: &str) -> Option<Self> {
        match line {
            SENTINEL_STARTING => Some(Sentinel::Starting),
            SENTINEL_READY => Some(Sentinel::FinishedSetup),
            _ => None,
        }
    }
}

// ============================================================================
// Line Assembly
// ============================================================================

/// Reassembles newline-terminated text lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
    decode_errors: u64,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the device.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_PENDING_BYTES && !self.pending.contains(&b'\n') {
            log::warn!(
                "discarding {} pending bytes without a line terminator",
                self.pending.len()
            );
            self.pending.clear();
            self.decode_errors += 1;
        }
    }

    /// Iterate over the complete lines buffered so far.
    ///
    /// Lines are trimmed and empty lines skipped. Bytes after the last
    /// terminator stay buffered for the next [`feed`](Self::feed).
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { assembler: self }
    }

    /// Drop any partial line, e.g. after the transport was reopened.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of times buffered text was discarded as undecodable.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }
}

/// Lazy iterator over complete lines, see [`LineAssembler::lines`].
pub struct Lines<'a> {
    assembler: &'a mut LineAssembler,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let pending = &mut self.assembler.pending;
            let end = pending.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = pending.drain(..=end).collect();
            match std::str::from_utf8(&raw) {
                Ok(text) => {
                    let line = text.trim();
                    if !line.is_empty() {
                        return Some(line.to_string());
                    }
                }
                Err(e) => {
                    log::debug!("undecodable line ({e}), dropping pending buffer");
                    self.assembler.pending.clear();
                    self.assembler.decode_errors += 1;
                    return None;
                }
            }
        }
    }
}
