//! In-memory accumulation of a recording session.

use std::time::Instant;

use crate::protocol::{Channel, Frame, CHANNEL_COUNT};

/// `(seconds since session start, value)` pairs for one channel.
pub type Series = Vec<(f64, f64)>;

/// A recording handed to exporters: one ordered series per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingSession {
    pub channels: [Series; CHANNEL_COUNT],
}

impl RecordingSession {
    pub fn channel(&self, channel: Channel) -> &[(f64, f64)] {
        &self.channels[channel.index()]
    }

    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elapsed time of the last sample.
    pub fn duration(&self) -> f64 {
        self.channels[0].last().map_or(0.0, |&(t, _)| t)
    }

    pub fn summary(&self, channel: Channel) -> Option<ChannelSummary> {
        ChannelSummary::of(self.channel(channel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl ChannelSummary {
    fn of(series: &[(f64, f64)]) -> Option<Self> {
        if series.is_empty() {
            return None;
        }
        let (mut sum, mut min, mut max) = (0.0, f64::INFINITY, f64::NEG_INFINITY);
        for &(_, v) in series {
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        Some(Self {
            count: series.len(),
            mean: sum / series.len() as f64,
            min,
            max,
        })
    }
}

/// Accumulates transformed frames between `start` and `stop`.
#[derive(Debug, Default)]
pub struct Recorder {
    session: RecordingSession,
    started: Option<Instant>,
    active: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the previous recording and begin a new one at `at`.
    pub fn start(&mut self, at: Instant) {
        for series in &mut self.session.channels {
            series.clear();
        }
        self.started = Some(at);
        self.active = true;
    }

    /// Append all four channels of `frame`; ignored while inactive.
    ///
    /// Frames stamped before the session start are clamped to zero elapsed.
    pub fn append(&mut self, frame: &Frame) -> bool {
        let Some(started) = self.started.filter(|_| self.active) else {
            return false;
        };
        let elapsed = frame.at.saturating_duration_since(started).as_secs_f64();
        for (series, value) in self.session.channels.iter_mut().zip(frame.values) {
            series.push((elapsed, value));
        }
        true
    }

    /// Freeze the session; data stays readable until the next `start`.
    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True once a session has been started and holds samples.
    pub fn has_recording(&self) -> bool {
        self.started.is_some() && !self.session.is_empty()
    }

    pub fn len(&self) -> usize {
        self.session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_empty()
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn snapshot(&self) -> RecordingSession {
        self.session.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn frame(at: Instant, v: f64) -> Frame {
        Frame {
            values: [v, v + 1.0, v + 2.0, v + 3.0],
            at,
        }
    }

    #[test]
    fn inactive_recorder_ignores_frames() {
        let mut rec = Recorder::new();
        assert!(!rec.append(&frame(Instant::now(), 1.0)));
        assert!(rec.is_empty());
        assert!(!rec.has_recording());
    }

    #[test]
    fn appends_all_channels_with_elapsed_time() {
        let t0 = Instant::now();
        let mut rec = Recorder::new();
        rec.start(t0);
        rec.append(&frame(t0 + Duration::from_millis(10), 1.0));
        rec.append(&frame(t0 + Duration::from_millis(20), 2.0));
        let session = rec.session();
        assert_eq!(session.len(), 2);
        for ch in Channel::ALL {
            let series = session.channel(ch);
            assert_eq!(series.len(), 2);
            assert!((series[0].0 - 0.010).abs() < 1e-9);
            assert!((series[1].0 - 0.020).abs() < 1e-9);
        }
        assert_eq!(session.channel(Channel::LeftFront)[1].1, 5.0);
    }

    #[test]
    fn elapsed_is_non_negative_and_non_decreasing() {
        let t0 = Instant::now();
        let mut rec = Recorder::new();
        rec.start(t0 + Duration::from_millis(5));
        rec.append(&frame(t0, 0.0));
        for ms in [5, 5, 9, 30] {
            rec.append(&frame(t0 + Duration::from_millis(ms), 0.0));
        }
        let times: Vec<f64> = rec.session().channel(Channel::RightRear).iter().map(|p| p.0).collect();
        assert_eq!(times[0], 0.0);
        assert!(times.iter().all(|&t| t >= 0.0));
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stop_freezes_and_restart_clears() {
        let t0 = Instant::now();
        let mut rec = Recorder::new();
        rec.start(t0);
        rec.append(&frame(t0, 1.0));
        rec.stop();
        assert!(!rec.append(&frame(t0, 2.0)));
        assert_eq!(rec.len(), 1);
        assert!(rec.has_recording());

        rec.start(t0);
        assert!(rec.is_empty());
        for ch in Channel::ALL {
            assert!(rec.session().channel(ch).is_empty());
        }
    }

    #[test]
    fn summary_reports_extremes() {
        let t0 = Instant::now();
        let mut rec = Recorder::new();
        rec.start(t0);
        for v in [2.0, -4.0, 8.0] {
            rec.append(&frame(t0, v));
        }
        let s = rec.snapshot().summary(Channel::RightRear).unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.min, -4.0);
        assert_eq!(s.max, 8.0);
        assert!(RecordingSession::default().summary(Channel::RightRear).is_none());
    }
}
