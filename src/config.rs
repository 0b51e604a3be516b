//! Session tuning parameters.
//!
//! Everything has a sensible default; a JSON file can override any subset of
//! fields. Durations are stored in milliseconds so the file stays readable.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::live::DEFAULT_RING_CAPACITY;
use crate::protocol::BAUD_RATE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub baud_rate: u32,
    /// Blocking read timeout of the serial port.
    pub read_timeout_ms: u64,
    /// Pause between reader loop iterations.
    pub reader_idle_ms: u64,
    /// Pause before retrying after a failed reconnect.
    pub reconnect_delay_ms: u64,
    pub tare_window_ms: u64,
    pub calibrate_window_ms: u64,
    /// Minimum spacing of tare/calibrate progress updates.
    pub progress_interval_ms: u64,
    pub live_queue_capacity: usize,
    pub live_ring_capacity: usize,
    /// Samples moved into the rings per display tick.
    pub live_drain_batch: usize,
    pub live_tick_ms: u64,
    /// Log every accepted raw frame at info level.
    pub echo_raw: bool,
    /// Override of the calibration profile location.
    pub profile_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            read_timeout_ms: 1_000,
            reader_idle_ms: 2,
            reconnect_delay_ms: 1_000,
            tare_window_ms: 10_000,
            calibrate_window_ms: 5_000,
            progress_interval_ms: 500,
            live_queue_capacity: 256,
            live_ring_capacity: DEFAULT_RING_CAPACITY,
            live_drain_batch: 32,
            live_tick_ms: 50,
            echo_raw: false,
            profile_path: None,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file, falling back to defaults if it is missing or invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reader_idle(&self) -> Duration {
        Duration::from_millis(self.reader_idle_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn tare_window(&self) -> Duration {
        Duration::from_millis(self.tare_window_ms)
    }

    pub fn calibrate_window(&self) -> Duration {
        Duration::from_millis(self.calibrate_window_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn live_tick(&self) -> Duration {
        Duration::from_millis(self.live_tick_ms.max(1))
    }
}
