//! Driver for a four-channel walker force sensor streaming over serial.
//!
//! The device prints one line per sample, `rr,rf,lr,lf`, at 57600 baud, and
//! announces boots with `Starting...` followed by `Finished Setup!`. This crate
//! turns that stream into calibrated frames:
//!
//! 1. [`protocol::LineAssembler`] splits raw bytes into trimmed lines.
//! 2. [`handshake::Handshake`] gates everything on the boot sentinels.
//! 3. [`protocol::parse_frame`] rejects anything that is not four finite decimals.
//! 4. [`calibration::transform`] applies tare offsets and per-channel scales.
//! 5. Frames fan out to the [`recorder::Recorder`] and the [`live::LiveFeed`].
//!
//! [`session::SerialSession`] runs the pipeline on a background reader thread
//! and provides the tare and calibration routines that sample the raw stream
//! directly.
//!
//! # Timing
//!
//! The device does not timestamp samples. Each frame carries the host
//! [`std::time::Instant`] of the read that produced it, so every line from one
//! read shares a timestamp. Recorded and live times are seconds since the
//! start of the recording or live view.

pub mod calibration;
pub mod config;
pub mod errors;
pub mod handshake;
pub mod live;
pub mod logging;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod status;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use calibration::{transform, CalibrationProfile, ProfileStore};
pub use config::SessionConfig;
pub use errors::*;
pub use handshake::{Handshake, HandshakeState};
pub use live::{LiveFeed, LiveRingBuffer, LiveView};
pub use protocol::{parse_frame, Channel, Frame, LineAssembler, RawFrame};
pub use recorder::{Recorder, RecordingSession};
pub use session::{CalibrateOutcome, IngestStats, SerialSession, TareOutcome};
pub use status::{LogStatusSink, QueueStatusSink, Status, StatusSink};
pub use transport::{list_ports, Connector, SerialConnector, Transport};
