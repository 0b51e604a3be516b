//! Human-readable status updates for whatever front end drives the session.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::protocol::Channel;

#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Connecting { port: String },
    Connected { port: String },
    ConnectFailed { reason: String },
    Disconnected { reason: String },
    DeviceStarting,
    Ready,
    Recording,
    RecordingStopped { samples: usize },
    Taring,
    TareProgress { remaining: Duration, samples: usize, rejected: usize },
    Tared,
    Calibrating { channel: Channel, weight_grams: f64 },
    CalibrateProgress { remaining: Duration, samples: usize, rejected: usize },
    Calibrated { channel: Channel },
    /// Calibration applied in memory but the profile could not be written.
    SaveFailed { reason: String },
    ProfileReset,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Connecting { port } => write!(f, "Connecting to {port}.."),
            Status::Connected { port } => write!(f, "Connected to {port}!"),
            Status::ConnectFailed { reason } => write!(f, "Failed to connect: {reason}"),
            Status::Disconnected { reason } => {
                write!(f, "Serial port closed ({reason}). Trying to reconnect...")
            }
            Status::DeviceStarting => f.write_str("Starting device"),
            Status::Ready => f.write_str("Ready!"),
            Status::Recording => f.write_str("Recording"),
            Status::RecordingStopped { samples } => {
                write!(f, "Recording stopped ({samples} samples)")
            }
            Status::Taring => f.write_str("Zeroing"),
            Status::TareProgress {
                remaining,
                samples,
                rejected,
            } => write!(
                f,
                "Zeroing: {:.1}s left, {samples} samples, {rejected} rejected",
                remaining.as_secs_f64()
            ),
            Status::Tared => f.write_str("Tared!"),
            Status::Calibrating {
                channel,
                weight_grams,
            } => write!(f, "Calibrating {channel} with {weight_grams} g"),
            Status::CalibrateProgress {
                remaining,
                samples,
                rejected,
            } => write!(
                f,
                "Calibrating: {:.1}s left, {samples} samples, {rejected} rejected",
                remaining.as_secs_f64()
            ),
            Status::Calibrated { channel } => write!(f, "Calibrated {channel}!"),
            Status::SaveFailed { reason } => {
                write!(f, "Calibration applied, but saving the profile failed: {reason}")
            }
            Status::ProfileReset => f.write_str("Calibration reset to defaults"),
            Status::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

/// Receives status updates; called from the reader thread as well as callers.
pub trait StatusSink: Send + Sync {
    fn publish(&self, status: Status);
}

impl<F> StatusSink for F
where
    F: Fn(Status) + Send + Sync,
{
    fn publish(&self, status: Status) {
        self(status)
    }
}

/// Writes statuses to the log; failures at warn, progress at debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, status: Status) {
        match status {
            Status::Error(_) | Status::ConnectFailed { .. } | Status::SaveFailed { .. } => {
                log::warn!("{status}")
            }
            Status::TareProgress { .. } | Status::CalibrateProgress { .. } => {
                log::debug!("{status}")
            }
            _ => log::info!("{status}"),
        }
    }
}

/// Buffers statuses for a consumer that polls, e.g. a GUI timer.
#[derive(Debug)]
pub struct QueueStatusSink {
    tx: Sender<Status>,
    rx: Receiver<Status>,
    last: Mutex<Option<Status>>,
}

impl Default for QueueStatusSink {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            last: Mutex::new(None),
        }
    }
}

impl QueueStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published since the previous call, oldest first.
    pub fn take(&self) -> Vec<Status> {
        self.rx.try_iter().collect()
    }

    /// Most recent status, even if already taken.
    pub fn last(&self) -> Option<Status> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

impl StatusSink for QueueStatusSink {
    fn publish(&self, status: Status) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(status.clone());
        }
        let _ = self.tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_text_has_remaining_time_and_counts() {
        let s = Status::TareProgress {
            remaining: Duration::from_millis(7_240),
            samples: 412,
            rejected: 3,
        };
        assert_eq!(s.to_string(), "Zeroing: 7.2s left, 412 samples, 3 rejected");
    }

    #[test]
    fn queue_sink_keeps_order_and_last() {
        let sink = QueueStatusSink::new();
        sink.publish(Status::DeviceStarting);
        sink.publish(Status::Ready);
        assert_eq!(sink.take(), vec![Status::DeviceStarting, Status::Ready]);
        assert!(sink.take().is_empty());
        assert_eq!(sink.last(), Some(Status::Ready));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |s: Status| seen.lock().unwrap().push(s.to_string());
        sink.publish(Status::Tared);
        assert_eq!(seen.lock().unwrap().as_slice(), ["Tared!"]);
    }
}
