//! Tare and scale calibration of the load cells.
//!
//! A profile holds one additive tare offset and one scale divisor per channel.
//! Raw readings are converted to grams as `(raw - tare) / scale`, always in
//! that order. Profiles are persisted as a small JSON record in the
//! application data directory and reloaded each time the device reports ready.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{CalibrationError, PersistenceError};
use crate::protocol::{Channel, Frame, RawFrame, CHANNEL_COUNT};

/// File name of the persisted profile inside the data directory.
pub const PROFILE_FILE_NAME: &str = "calibration.json";

// ============================================================================
// Profile
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationProfile {
    /// Per-channel offset subtracted from raw readings.
    pub tare: [f64; CHANNEL_COUNT],
    /// Per-channel divisor in raw units per gram.
    pub scale: [f64; CHANNEL_COUNT],
    pub is_tared: bool,
    pub is_calibrated: bool,
    /// Unix time of the last save, if the profile came from disk.
    pub saved_at: Option<f64>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationProfile {
    /// Zero tare, unit scale, nothing applied.
    pub fn identity() -> Self {
        Self {
            tare: [0.0; CHANNEL_COUNT],
            scale: [1.0; CHANNEL_COUNT],
            is_tared: false,
            is_calibrated: false,
            saved_at: None,
        }
    }

    pub fn apply_tare(&mut self, tare: [f64; CHANNEL_COUNT]) {
        self.tare = tare;
        self.is_tared = true;
    }

    /// Install the scale of a single channel, leaving the others untouched.
    pub fn apply_scale(&mut self, channel: Channel, scale: f64) {
        self.scale[channel.index()] = scale;
        self.is_calibrated = true;
    }

    /// Tare offset to subtract on `channel`, zero while untared.
    #[inline]
    pub fn offset(&self, channel: Channel) -> f64 {
        if self.is_tared {
            self.tare[channel.index()]
        } else {
            0.0
        }
    }

    /// Convert one raw channel reading.
    #[inline]
    pub fn convert(&self, channel: Channel, raw: f64) -> f64 {
        let tared = raw - self.offset(channel);
        if self.is_calibrated {
            tared / self.scale[channel.index()]
        } else {
            tared
        }
    }
}

/// Apply tare then scale to every channel of a frame.
pub fn transform(raw: &RawFrame, profile: &CalibrationProfile) -> Frame {
    let mut values = raw.values;
    for ch in Channel::ALL {
        values[ch.index()] = profile.convert(ch, raw.value(ch));
    }
    Frame { values, at: raw.at }
}

// ============================================================================
// Accumulators
// ============================================================================

/// Running per-channel sum over a tare window.
#[derive(Debug, Default)]
pub struct TareAccumulator {
    sums: [f64; CHANNEL_COUNT],
    count: usize,
}

impl TareAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, raw: &RawFrame) {
        for (sum, value) in self.sums.iter_mut().zip(raw.values) {
            *sum += value;
        }
        self.count += 1;
    }

    /// Per-channel mean, or `NoValidData` for an empty window.
    pub fn finish(&self) -> Result<[f64; CHANNEL_COUNT], CalibrationError> {
        if self.count == 0 {
            return Err(CalibrationError::NoValidData);
        }
        let n = self.count as f64;
        Ok(self.sums.map(|sum| sum / n))
    }
}

/// Running sum of tared readings on one channel over a calibration window.
#[derive(Debug)]
pub struct ScaleAccumulator {
    channel: Channel,
    offset: f64,
    sum: f64,
    count: usize,
}

impl ScaleAccumulator {
    /// `profile` supplies the tare to apply; its scale is ignored.
    pub fn new(channel: Channel, profile: &CalibrationProfile) -> Self {
        Self {
            channel,
            offset: profile.offset(channel),
            sum: 0.0,
            count: 0,
        }
    }

    pub fn add(&mut self, raw: &RawFrame) {
        self.sum += raw.value(self.channel) - self.offset;
        self.count += 1;
    }

    /// Scale factor for `weight_grams`, rejecting empty windows and zero averages.
    pub fn finish(&self, weight_grams: f64) -> Result<f64, CalibrationError> {
        validate_weight(weight_grams)?;
        if self.count == 0 {
            return Err(CalibrationError::NoValidData);
        }
        let avg = self.sum / self.count as f64;
        if avg == 0.0 {
            return Err(CalibrationError::ZeroReading {
                channel: self.channel,
            });
        }
        Ok(avg / weight_grams)
    }
}

/// The reference weight is operator input; only positivity is enforced.
pub fn validate_weight(weight_grams: f64) -> Result<(), CalibrationError> {
    if weight_grams.is_finite() && weight_grams > 0.0 {
        Ok(())
    } else {
        Err(CalibrationError::InvalidWeight(weight_grams))
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// On-disk layout of a saved profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileRecord {
    calibration_values: [f64; CHANNEL_COUNT],
    tare_values: [f64; CHANNEL_COUNT],
    timestamp: f64,
    is_calibrated: bool,
    is_tared: bool,
}

impl ProfileRecord {
    fn from_profile(profile: &CalibrationProfile, timestamp: f64) -> Self {
        Self {
            calibration_values: profile.scale,
            tare_values: profile.tare,
            timestamp,
            is_calibrated: profile.is_calibrated,
            is_tared: profile.is_tared,
        }
    }

    fn into_profile(self) -> CalibrationProfile {
        let mut profile = CalibrationProfile {
            tare: self.tare_values,
            scale: self.calibration_values,
            is_tared: self.is_tared,
            is_calibrated: self.is_calibrated,
            saved_at: Some(self.timestamp),
        };
        // A hand-edited record must not reintroduce a zero divisor.
        for ch in Channel::ALL {
            let scale = profile.scale[ch.index()];
            if scale == 0.0 || !scale.is_finite() {
                warn!("stored scale for {ch} is {scale}, using 1.0");
                profile.scale[ch.index()] = 1.0;
            }
        }
        profile
    }
}

/// Location of the persisted calibration profile.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store inside `dir` using the standard file name.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(PROFILE_FILE_NAME))
    }

    /// Store in the per-user application data directory.
    pub fn default_location() -> Result<Self, PersistenceError> {
        let dirs =
            ProjectDirs::from("", "", "forcewalker").ok_or(PersistenceError::NoDataDir)?;
        Ok(Self::in_dir(dirs.data_dir()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved profile; `Ok(None)` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<CalibrationProfile>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no calibration profile at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let record: ProfileRecord = serde_json::from_str(&contents)?;
        info!("loaded calibration profile from {}", self.path.display());
        Ok(Some(record.into_profile()))
    }

    /// Write the profile atomically and return the stored timestamp.
    ///
    /// The record goes to a sibling temp file first, then replaces the
    /// previous one by rename.
    pub fn save(&self, profile: &CalibrationProfile) -> Result<f64, PersistenceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let timestamp = unix_now();
        let record = ProfileRecord::from_profile(profile, timestamp);
        let json = serde_json::to_string_pretty(&record)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        debug!("saved calibration profile to {}", self.path.display());
        Ok(timestamp)
    }

    /// Remove the saved profile; `Ok(false)` when there was none.
    pub fn delete(&self) -> Result<bool, PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn raw(values: [f64; 4]) -> RawFrame {
        RawFrame {
            values,
            at: Instant::now(),
        }
    }

    #[test]
    fn identity_profile_passes_values_through() {
        let frame = transform(&raw([1.5, -2.0, 3.0, 4.0]), &CalibrationProfile::identity());
        assert_eq!(frame.values, [1.5, -2.0, 3.0, 4.0]);
    }

    #[test]
    fn tare_only_subtracts() {
        let mut profile = CalibrationProfile::identity();
        profile.apply_tare([10.0, 20.0, 30.0, 40.0]);
        profile.scale = [2.0; 4]; // ignored while uncalibrated
        let frame = transform(&raw([15.0, 25.0, 35.0, 45.0]), &profile);
        assert_eq!(frame.values, [5.0; 4]);
    }

    #[test]
    fn tare_is_applied_before_scale() {
        let mut profile = CalibrationProfile::identity();
        profile.apply_tare([10.0, 0.0, 0.0, 0.0]);
        profile.apply_scale(Channel::RightRear, 0.5);
        let frame = transform(&raw([35.0, 8.0, 8.0, 8.0]), &profile);
        assert_eq!(frame.values[0], 50.0);
        assert_eq!(frame.values[1..], [8.0, 8.0, 8.0]);
    }

    #[test]
    fn tare_window_averages_each_channel() {
        let mut acc = TareAccumulator::new();
        assert_eq!(acc.finish(), Err(CalibrationError::NoValidData));
        acc.add(&raw([10.0, 0.0, 4.0, -2.0]));
        acc.add(&raw([20.0, 2.0, 4.0, -4.0]));
        assert_eq!(acc.finish().unwrap(), [15.0, 1.0, 4.0, -3.0]);
    }

    #[test]
    fn scale_uses_tared_single_channel() {
        let mut profile = CalibrationProfile::identity();
        profile.apply_tare([10.0, 10.0, 10.0, 10.0]);
        let mut acc = ScaleAccumulator::new(Channel::RightRear, &profile);
        for _ in 0..20 {
            acc.add(&raw([60.0, 999.0, 999.0, 999.0]));
        }
        assert_eq!(acc.finish(100.0).unwrap(), 0.5);
    }

    #[test]
    fn scale_rejects_zero_average_and_bad_weight() {
        let profile = CalibrationProfile::identity();
        let mut acc = ScaleAccumulator::new(Channel::LeftFront, &profile);
        assert_eq!(acc.finish(100.0), Err(CalibrationError::NoValidData));
        acc.add(&raw([5.0, 5.0, 5.0, 3.0]));
        acc.add(&raw([5.0, 5.0, 5.0, -3.0]));
        assert_eq!(
            acc.finish(100.0),
            Err(CalibrationError::ZeroReading {
                channel: Channel::LeftFront
            })
        );
        assert_eq!(acc.finish(0.0), Err(CalibrationError::InvalidWeight(0.0)));
        assert!(validate_weight(f64::NAN).is_err());
        assert!(validate_weight(-5.0).is_err());
    }

    #[test]
    fn calibrating_one_channel_keeps_others() {
        let mut profile = CalibrationProfile::identity();
        profile.apply_scale(Channel::LeftRear, 3.0);
        profile.apply_scale(Channel::RightFront, 2.0);
        assert_eq!(profile.scale, [1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn profile_round_trips_through_store() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path().join("nested"));
        assert!(store.load().unwrap().is_none());

        let mut profile = CalibrationProfile::identity();
        profile.apply_tare([1.25, -3.5, 0.0, 7.0]);
        profile.apply_scale(Channel::RightFront, 45.4545);
        let ts = store.save(&profile).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.tare, profile.tare);
        assert_eq!(loaded.scale, profile.scale);
        assert!(loaded.is_tared);
        assert!(loaded.is_calibrated);
        assert_eq!(loaded.saved_at, Some(ts));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn record_uses_documented_field_names() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path());
        store.save(&CalibrationProfile::identity()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        for key in [
            "calibration_values",
            "tare_values",
            "timestamp",
            "is_calibrated",
            "is_tared",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn zero_scale_on_disk_is_replaced() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path());
        fs::write(
            store.path(),
            r#"{"calibration_values":[0.0,2.0,1.0,1.0],"tare_values":[0,0,0,0],
               "timestamp":1.0,"is_calibrated":true,"is_tared":false}"#,
        )
        .unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.scale, [1.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn malformed_record_is_an_error() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(PersistenceError::Format(_))));
    }

    #[test]
    fn delete_reports_missing_record() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path());
        assert!(!store.delete().unwrap());
        store.save(&CalibrationProfile::identity()).unwrap();
        assert!(store.delete().unwrap());
        assert!(store.load().unwrap().is_none());
    }
}
