use std::io;
use thiserror::Error;

use crate::handshake::HandshakeState;
use crate::protocol::Channel;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("device not connected")]
    NotConnected,
    #[error("device not ready: handshake is {0}")]
    NotReady(HandshakeState),
    #[error("device busy: {0}")]
    Busy(&'static str),
    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("profile persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("session state lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("no valid data received during the sampling window")]
    NoValidData,
    #[error("average reading on {channel} was exactly zero")]
    ZeroReading { channel: Channel },
    #[error("calibration weight must be a positive number of grams, got {0}")]
    InvalidWeight(f64),
    #[error("cancelled by user")]
    Cancelled,
    #[error("device restarted during the sampling window")]
    DeviceRestarted,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("profile io error: {0}")]
    Io(#[from] io::Error),
    #[error("profile record malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error("no application data directory available on this platform")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, DriverError>;
