//! Device session: background ingestion, fan-out and calibration routines.
//!
//! # Locking
//!
//! Two mutexes are shared between the reader thread and callers:
//!
//! - the **link** (transport + line assembler), taken around every raw read;
//! - the **device** ([`DeviceSession`]: handshake, profile, recorder, counters).
//!
//! The reader takes the link for a single read, releases it, then takes the
//! device to process the lines. Tare and calibrate hold the link for their
//! whole sampling window (10 s / 5 s by default), so ingestion, recording and
//! the live view stall for that long. Lock order is always link, then device.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::calibration::{
    transform, validate_weight, CalibrationProfile, ProfileStore, ScaleAccumulator,
    TareAccumulator,
};
use crate::config::SessionConfig;
use crate::errors::{CalibrationError, DriverError, Result};
use crate::handshake::{Handshake, HandshakeState, Transition};
use crate::live::{LiveFeed, LiveView};
use crate::protocol::{
    Channel, Frame, FrameRejection, LineAssembler, RawFrame, Sentinel, CHANNEL_COUNT,
};
use crate::recorder::{RecordingSession, Recorder};
use crate::status::{Status, StatusSink};
use crate::transport::{Connector, Transport};

const READ_CHUNK: usize = 1024;
const READY_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Device State
// ============================================================================

/// Pipeline counters since the session was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub frames: u64,
    pub rejected: u64,
    pub sentinels: u64,
    pub decode_errors: u64,
    /// Live samples dropped because the display fell behind.
    pub live_dropped: u64,
}

/// What happened to one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Sentinel(Transition),
    Frame(Frame),
    Rejected(FrameRejection),
}

/// Collaborators a line may touch on its way through the pipeline.
pub struct PipelineContext<'a> {
    pub store: &'a ProfileStore,
    pub live: &'a LiveFeed,
    pub status: &'a dyn StatusSink,
    pub echo_raw: bool,
}

/// Everything known about the attached device, guarded as one unit.
#[derive(Debug, Default)]
pub struct DeviceSession {
    handshake: Handshake,
    profile: CalibrationProfile,
    recorder: Recorder,
    stats: IngestStats,
}

impl DeviceSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Reject operations that need a booted device.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.handshake.is_ready() {
            Ok(())
        } else {
            Err(DriverError::NotReady(self.handshake.state()))
        }
    }

    /// Run one trimmed, non-empty line through handshake, validation,
    /// transform and fan-out.
    pub fn ingest(&mut self, line: &str, at: Instant, ctx: &PipelineContext<'_>) -> Ingested {
        self.stats.lines += 1;

        if let Some(transition) = self.handshake.observe(line) {
            self.stats.sentinels += 1;
            self.apply_transition(transition, ctx);
            return Ingested::Sentinel(transition);
        }

        let raw = match RawFrame::parse(line, at) {
            Ok(raw) => raw,
            Err(rejection) => {
                self.stats.rejected += 1;
                if self.handshake.is_ready() {
                    debug!("Received data not in expected format: {line:?} ({rejection})");
                }
                return Ingested::Rejected(rejection);
            }
        };
        self.stats.frames += 1;
        if ctx.echo_raw {
            let [rr, rf, lr, lf] = raw.values;
            info!("RR: {rr} RF: {rf} LR: {lr} LF: {lf}");
        }

        let frame = transform(&raw, &self.profile);
        self.recorder.append(&frame);
        ctx.live.publish(&frame);
        Ingested::Frame(frame)
    }

    fn apply_transition(&mut self, transition: Transition, ctx: &PipelineContext<'_>) {
        match transition.to {
            HandshakeState::DeviceStarting => {
                if self.recorder.is_active() {
                    warn!(
                        "device restarted mid-recording; keeping {} samples",
                        self.recorder.len()
                    );
                    self.recorder.stop();
                }
                ctx.live.close();
                ctx.status.publish(Status::DeviceStarting);
            }
            HandshakeState::Ready => {
                self.profile = match ctx.store.load() {
                    Ok(Some(profile)) => profile,
                    Ok(None) => {
                        info!("no saved calibration, using identity profile");
                        CalibrationProfile::identity()
                    }
                    Err(e) => {
                        warn!("could not load calibration profile: {e}; using identity profile");
                        CalibrationProfile::identity()
                    }
                };
                ctx.status.publish(Status::Ready);
            }
            HandshakeState::AwaitingDevice => {}
        }
    }
}

// ============================================================================
// Device Link
// ============================================================================

struct DeviceLink {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    assembler: LineAssembler,
    buf: Vec<u8>,
}

impl DeviceLink {
    fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            transport: None,
            assembler: LineAssembler::new(),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    fn open(&mut self) -> Result<()> {
        if self.transport.is_none() {
            self.transport = Some(self.connector.open()?);
            self.assembler.reset();
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("closed transport to {}", self.connector.describe());
        }
    }

    /// One blocking read; returns the complete lines it produced.
    ///
    /// A read timeout yields no lines. Any other IO error closes the
    /// transport so the next access reopens it.
    fn read_lines(&mut self) -> Result<Vec<String>> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(DriverError::NotConnected);
        };
        match transport.read(&mut self.buf) {
            Ok(0) => Ok(Vec::new()),
            Ok(n) => {
                self.assembler.feed(&self.buf[..n]);
                Ok(self.assembler.lines().collect())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(e) => {
                self.close();
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct Shared {
    link: Mutex<DeviceLink>,
    device: Mutex<DeviceSession>,
    live: Arc<LiveFeed>,
    store: ProfileStore,
    status: Arc<dyn StatusSink>,
    config: SessionConfig,
    running: AtomicBool,
    calibrating: AtomicBool,
    cancel: AtomicBool,
}

impl Shared {
    fn context(&self) -> PipelineContext<'_> {
        PipelineContext {
            store: &self.store,
            live: &self.live,
            status: &*self.status,
            echo_raw: self.config.echo_raw,
        }
    }

    fn lock_link(&self) -> Result<MutexGuard<'_, DeviceLink>> {
        self.link.lock().map_err(|_| DriverError::Poisoned)
    }

    fn lock_device(&self) -> Result<MutexGuard<'_, DeviceSession>> {
        self.device.lock().map_err(|_| DriverError::Poisoned)
    }

    fn ingest_batch(&self, lines: &[String], decode_errors: Option<u64>) -> Result<()> {
        let at = Instant::now();
        let mut device = self.lock_device()?;
        if let Some(decode_errors) = decode_errors {
            device.stats.decode_errors = decode_errors;
        }
        let ctx = self.context();
        for line in lines {
            device.ingest(line, at, &ctx);
        }
        Ok(())
    }
}

/// Reader loop - reads lines and pushes them through the pipeline.
///
/// Runs until `running` is cleared. The flag is checked once per iteration,
/// so stopping takes at most one read timeout.
fn reader_loop(shared: Arc<Shared>) {
    info!("Reader thread started");
    let idle = shared.config.reader_idle();
    let reconnect_delay = shared.config.reconnect_delay();

    while shared.running.load(Ordering::Relaxed) {
        let batch = {
            let Ok(mut link) = shared.link.lock() else {
                error!("Reader: link mutex poisoned, exiting");
                break;
            };
            if !link.is_open() {
                if let Err(e) = link.open() {
                    drop(link);
                    debug!("reconnect failed: {e}");
                    thread::sleep(reconnect_delay);
                    continue;
                }
                shared.status.publish(Status::Connected {
                    port: link.connector.describe(),
                });
            }
            let lines = link.read_lines();
            let decode_errors = link.assembler.decode_errors();
            lines.map(move |lines| (lines, decode_errors))
        };

        match batch {
            Ok((lines, decode_errors)) => {
                if !lines.is_empty() {
                    if let Err(e) = shared.ingest_batch(&lines, Some(decode_errors)) {
                        error!("Reader: {e}, exiting");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("Serial error: {e}");
                shared.status.publish(Status::Disconnected {
                    reason: e.to_string(),
                });
                thread::sleep(reconnect_delay);
            }
        }

        thread::sleep(idle);
    }

    info!("Reader thread exiting");
}

// ============================================================================
// Serial Session
// ============================================================================

/// Result of a completed tare.
#[derive(Debug, Clone, PartialEq)]
pub struct TareOutcome {
    pub tare: [f64; CHANNEL_COUNT],
    pub samples: usize,
    pub rejected: usize,
    /// False when the profile was applied but could not be written to disk.
    pub saved: bool,
}

/// Result of a completed single-channel calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrateOutcome {
    pub channel: Channel,
    pub scale: f64,
    pub samples: usize,
    pub rejected: usize,
    pub saved: bool,
}

#[derive(Debug, Clone, Copy)]
enum WindowKind {
    Tare,
    Calibrate,
}

#[derive(Debug, Default)]
struct WindowReport {
    accepted: usize,
    rejected: usize,
}

/// Clears the in-progress flag when a tare/calibrate routine ends.
struct RoutineGuard<'a>(&'a AtomicBool);

impl Drop for RoutineGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A connected device with its background reader.
///
/// # Example
/// ```ignore
/// let store = ProfileStore::default_location()?;
/// let session = SerialSession::connect(
///     SerialConnector::new("/dev/ttyACM0"),
///     store,
///     Arc::new(LogStatusSink),
///     SessionConfig::default(),
/// )?;
/// session.wait_until_ready(Duration::from_secs(10))?;
/// session.tare()?;
/// session.start_recording()?;
/// ```
pub struct SerialSession {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl SerialSession {
    /// Open the device and start the reader thread.
    pub fn connect<C>(
        connector: C,
        store: ProfileStore,
        status: Arc<dyn StatusSink>,
        config: SessionConfig,
    ) -> Result<Self>
    where
        C: Connector + 'static,
    {
        let port = connector.describe();
        status.publish(Status::Connecting { port: port.clone() });

        let mut link = DeviceLink::new(Box::new(connector));
        if let Err(e) = link.open() {
            status.publish(Status::ConnectFailed {
                reason: e.to_string(),
            });
            return Err(e);
        }
        status.publish(Status::Connected { port });

        let shared = Arc::new(Shared {
            link: Mutex::new(link),
            device: Mutex::new(DeviceSession::new()),
            live: Arc::new(LiveFeed::new(config.live_queue_capacity)),
            store,
            status,
            config,
            running: AtomicBool::new(true),
            calibrating: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("forcewalker-reader".into())
            .spawn(move || reader_loop(reader_shared))?;

        Ok(Self {
            shared,
            reader: Some(reader),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &ProfileStore {
        &self.shared.store
    }

    pub fn handshake_state(&self) -> Result<HandshakeState> {
        Ok(self.shared.lock_device()?.handshake_state())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.handshake_state(), Ok(HandshakeState::Ready))
    }

    /// Block until the device has finished its boot handshake.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.handshake_state()?;
            if state == HandshakeState::Ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::NotReady(state));
            }
            thread::sleep(READY_POLL);
        }
    }

    pub fn profile(&self) -> Result<CalibrationProfile> {
        Ok(self.shared.lock_device()?.profile().clone())
    }

    pub fn stats(&self) -> Result<IngestStats> {
        let mut stats = self.shared.lock_device()?.stats();
        stats.live_dropped = self.shared.live.dropped();
        Ok(stats)
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    /// Start a new recording, discarding the previous one.
    pub fn start_recording(&self) -> Result<()> {
        let mut device = self.shared.lock_device()?;
        device.ensure_ready()?;
        if self.shared.calibrating.load(Ordering::Acquire) {
            return Err(DriverError::Busy("calibration in progress"));
        }
        if device.recorder.is_active() {
            return Err(DriverError::Busy("already recording"));
        }
        device.recorder.start(Instant::now());
        drop(device);
        self.shared.status.publish(Status::Recording);
        Ok(())
    }

    /// Stop recording; returns the number of samples captured.
    pub fn stop_recording(&self) -> Result<usize> {
        let mut device = self.shared.lock_device()?;
        if !device.recorder.is_active() {
            return Ok(device.recorder.len());
        }
        device.recorder.stop();
        let samples = device.recorder.len();
        drop(device);
        self.shared
            .status
            .publish(Status::RecordingStopped { samples });
        Ok(samples)
    }

    pub fn is_recording(&self) -> bool {
        self.shared
            .lock_device()
            .map(|d| d.recorder.is_active())
            .unwrap_or(false)
    }

    /// Copy of the current (or last finished) recording.
    pub fn recording(&self) -> Result<RecordingSession> {
        Ok(self.shared.lock_device()?.recorder.snapshot())
    }

    // ------------------------------------------------------------------------
    // Live View
    // ------------------------------------------------------------------------

    /// Begin a live session; frames are queued until the view is dropped.
    pub fn open_live_view(&self) -> Result<LiveView> {
        let device = self.shared.lock_device()?;
        device.ensure_ready()?;
        Ok(self.shared.live.open(self.shared.config.live_ring_capacity))
    }

    pub fn live_feed(&self) -> Arc<LiveFeed> {
        Arc::clone(&self.shared.live)
    }

    // ------------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------------

    /// Measure the no-load baseline of every channel and persist it.
    pub fn tare(&self) -> Result<TareOutcome> {
        let _guard = self.begin_routine()?;
        self.shared.status.publish(Status::Taring);

        let mut acc = TareAccumulator::new();
        let outcome = self
            .sample_window(WindowKind::Tare, |raw| acc.add(raw))
            .and_then(|report| {
                let tare = acc.finish()?;
                Ok((tare, report))
            });
        let (tare, report) = outcome.inspect_err(|e| self.report_failure("Tare", e))?;

        info!(
            "Tare values: {:?} ({} samples, {} rejected)",
            tare, report.accepted, report.rejected
        );
        let saved = self.update_profile(|profile| profile.apply_tare(tare))?;
        self.shared.status.publish(Status::Tared);
        Ok(TareOutcome {
            tare,
            samples: report.accepted,
            rejected: report.rejected,
            saved,
        })
    }

    /// Derive the scale of one channel from a known reference weight.
    pub fn calibrate(&self, channel: Channel, weight_grams: f64) -> Result<CalibrateOutcome> {
        if let Err(e) = validate_weight(weight_grams) {
            let e = DriverError::from(e);
            self.report_failure("Calibration", &e);
            return Err(e);
        }
        let _guard = self.begin_routine()?;
        let profile = self.profile()?;
        self.shared.status.publish(Status::Calibrating {
            channel,
            weight_grams,
        });

        let mut acc = ScaleAccumulator::new(channel, &profile);
        let outcome = self
            .sample_window(WindowKind::Calibrate, |raw| acc.add(raw))
            .and_then(|report| {
                let scale = acc.finish(weight_grams)?;
                Ok((scale, report))
            });
        let (scale, report) = outcome.inspect_err(|e| self.report_failure("Calibration", e))?;

        info!(
            "Calibration value for {channel}: {scale} ({} samples, {} rejected)",
            report.accepted, report.rejected
        );
        let saved = self.update_profile(|profile| profile.apply_scale(channel, scale))?;
        self.shared.status.publish(Status::Calibrated { channel });
        Ok(CalibrateOutcome {
            channel,
            scale,
            samples: report.accepted,
            rejected: report.rejected,
            saved,
        })
    }

    /// Ask a running tare/calibrate to give up at its next read.
    pub fn cancel_calibration(&self) {
        if self.shared.calibrating.load(Ordering::Acquire) {
            self.shared.cancel.store(true, Ordering::Release);
        }
    }

    /// Restore identity calibration and forget the saved profile.
    pub fn reset_calibration(&self) -> Result<()> {
        self.shared.lock_device()?.profile = CalibrationProfile::identity();
        match self.shared.store.delete() {
            Ok(true) => info!("deleted {}", self.shared.store.path().display()),
            Ok(false) => debug!("no saved profile to delete"),
            Err(e) => warn!("failed to delete saved profile: {e}"),
        }
        self.shared.status.publish(Status::ProfileReset);
        Ok(())
    }

    /// Claim the routine slot. Checked and claimed under the device lock so
    /// it cannot interleave with `start_recording`.
    fn begin_routine(&self) -> Result<RoutineGuard<'_>> {
        let device = self.shared.lock_device()?;
        device.ensure_ready()?;
        if device.recorder.is_active() {
            return Err(DriverError::Busy("recording in progress"));
        }
        self.shared
            .calibrating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DriverError::Busy("calibration already running"))?;
        drop(device);
        self.shared.cancel.store(false, Ordering::Release);
        Ok(RoutineGuard(&self.shared.calibrating))
    }

    /// Read validated frames directly from the link for the routine's window.
    ///
    /// The link stays locked for the whole window. A restart sentinel aborts
    /// the window and is handed to the handshake.
    fn sample_window(
        &self,
        kind: WindowKind,
        mut on_frame: impl FnMut(&RawFrame),
    ) -> Result<WindowReport> {
        let config = &self.shared.config;
        let window = match kind {
            WindowKind::Tare => config.tare_window(),
            WindowKind::Calibrate => config.calibrate_window(),
        };
        let progress_interval = config.progress_interval();

        let mut link = self.shared.lock_link()?;
        link.open()?;

        let started = Instant::now();
        let mut last_progress = started;
        let mut report = WindowReport::default();

        while started.elapsed() < window {
            if self.shared.cancel.swap(false, Ordering::AcqRel) {
                return Err(CalibrationError::Cancelled.into());
            }
            let lines = match link.read_lines() {
                Ok(lines) => lines,
                Err(e) => {
                    self.shared.status.publish(Status::Disconnected {
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            };
            let at = Instant::now();
            for (i, line) in lines.iter().enumerate() {
                match Sentinel::detect(line) {
                    Some(Sentinel::Starting) => {
                        // The rest of this read belongs to the new boot.
                        drop(link);
                        self.shared.ingest_batch(&lines[i..], None)?;
                        return Err(CalibrationError::DeviceRestarted.into());
                    }
                    Some(Sentinel::FinishedSetup) => {
                        self.shared.ingest_batch(std::slice::from_ref(line), None)?;
                        continue;
                    }
                    None => {}
                }
                match RawFrame::parse(line, at) {
                    Ok(raw) => {
                        on_frame(&raw);
                        report.accepted += 1;
                    }
                    Err(_) => report.rejected += 1,
                }
            }

            if last_progress.elapsed() >= progress_interval {
                last_progress = Instant::now();
                let remaining = window.saturating_sub(started.elapsed());
                let (samples, rejected) = (report.accepted, report.rejected);
                self.shared.status.publish(match kind {
                    WindowKind::Tare => Status::TareProgress {
                        remaining,
                        samples,
                        rejected,
                    },
                    WindowKind::Calibrate => Status::CalibrateProgress {
                        remaining,
                        samples,
                        rejected,
                    },
                });
            }
        }
        Ok(report)
    }

    /// Apply a profile change and persist it. A failed save keeps the change.
    fn update_profile(&self, change: impl FnOnce(&mut CalibrationProfile)) -> Result<bool> {
        let mut device = self.shared.lock_device()?;
        change(&mut device.profile);
        let saved = self.shared.store.save(&device.profile);
        match saved {
            Ok(timestamp) => {
                device.profile.saved_at = Some(timestamp);
                Ok(true)
            }
            Err(e) => {
                drop(device);
                warn!("failed to save calibration profile: {e}");
                self.shared.status.publish(Status::SaveFailed {
                    reason: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    fn report_failure(&self, what: &str, e: &DriverError) {
        warn!("{what} failed: {e}");
        self.shared
            .status
            .publish(Status::Error(format!("{what} failed: {e}")));
    }

    /// Stop the reader thread and close the device.
    pub fn close(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.cancel.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("reader thread panicked");
            }
        }
        self.shared.live.close();
        if let Ok(mut link) = self.shared.link.lock() {
            link.close();
        }
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.close();
    }
}
