//! Boot handshake tracking.
//!
//! The firmware prints `Starting...` on reset and `Finished Setup!` once its
//! amplifiers are initialised. Anything else before that is noise from the
//! bootloader or a half-written line and is not worth reporting.

use std::fmt;

use crate::protocol::Sentinel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Port open, nothing recognised yet.
    #[default]
    AwaitingDevice,
    /// `Starting...` seen; device is booting.
    DeviceStarting,
    /// `Finished Setup!` seen; frames are trustworthy.
    Ready,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::AwaitingDevice => "awaiting device",
            HandshakeState::DeviceStarting => "device starting",
            HandshakeState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// A state change triggered by a sentinel line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HandshakeState,
    pub to: HandshakeState,
}

#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Feed a line; returns the transition if it was a sentinel.
    ///
    /// There is no terminal state: a restart sentinel moves a ready device
    /// back to [`HandshakeState::DeviceStarting`], and a repeated
    /// `Finished Setup!` re-enters `Ready` so the profile is reloaded.
    pub fn observe(&mut self, line: &str) -> Option<Transition> {
        let to = match Sentinel::detect(line)? {
            Sentinel::Starting => HandshakeState::DeviceStarting,
            Sentinel::FinishedSetup => HandshakeState::Ready,
        };
        let from = std::mem::replace(&mut self.state, to);
        log::debug!("handshake: {from} -> {to}");
        Some(Transition { from, to })
    }
}
