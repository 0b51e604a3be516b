//! End-to-end session tests over the scripted in-memory transport.

use std::fs;
use std::io;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use forcewalker::transport::mock::{ScriptedConnector, ScriptedTransport};
use forcewalker::{
    CalibrationError, CalibrationProfile, Channel, DriverError, HandshakeState, ProfileStore,
    QueueStatusSink, SerialSession, SessionConfig, Status,
};
use tempfile::TempDir;

const READY_TIMEOUT: Duration = Duration::from_secs(2);
/// Delay before lines meant for a tare/calibrate window are injected, so the
/// routine already holds the link when they arrive.
const WINDOW_LEAD: Duration = Duration::from_millis(100);

fn fast_config() -> SessionConfig {
    SessionConfig {
        tare_window_ms: 400,
        calibrate_window_ms: 400,
        progress_interval_ms: 100,
        reconnect_delay_ms: 20,
        ..SessionConfig::default()
    }
}

struct Rig {
    dir: TempDir,
    transport: ScriptedTransport,
    connector: Arc<ScriptedConnector>,
    status: Arc<QueueStatusSink>,
    session: SerialSession,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path());
        Self::with_store(dir, store)
    }

    fn with_config(config: SessionConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::in_dir(dir.path());
        Self::build(dir, store, config)
    }

    fn with_store(dir: TempDir, store: ProfileStore) -> Self {
        Self::build(dir, store, fast_config())
    }

    fn build(dir: TempDir, store: ProfileStore, config: SessionConfig) -> Self {
        let transport = ScriptedTransport::new();
        let connector = Arc::new(ScriptedConnector::new(transport.clone()));
        let status = Arc::new(QueueStatusSink::new());
        let session = SerialSession::connect(
            Arc::clone(&connector),
            store,
            status.clone(),
            config,
        )
        .unwrap();
        Self {
            dir,
            transport,
            connector,
            status,
            session,
        }
    }

    fn booted() -> Self {
        let rig = Self::new();
        rig.boot();
        rig
    }

    fn boot(&self) {
        self.transport.inject(b"Starting...\r\nFinished Setup!\r\n");
        self.session.wait_until_ready(READY_TIMEOUT).unwrap();
    }

    fn store(&self) -> ProfileStore {
        ProfileStore::in_dir(self.dir.path())
    }

    /// Inject `count` copies of `line` once a routine has started sampling.
    fn inject_during_window(&self, line: &str, count: usize) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let line = line.to_string();
        thread::spawn(move || {
            thread::sleep(WINDOW_LEAD);
            transport.inject_repeated(&line, count);
        })
    }

    fn record_one(&self, line: &str) -> [f64; 4] {
        self.session.start_recording().unwrap();
        self.transport.inject_line(line);
        assert!(wait_for(|| self.session.recording().unwrap().len() == 1));
        self.session.stop_recording().unwrap();
        let recording = self.session.recording().unwrap();
        Channel::ALL.map(|c| recording.channel(c)[0].1)
    }

    fn statuses(&self) -> Vec<Status> {
        self.status.take()
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn operations_are_gated_until_setup_finishes() {
    let rig = Rig::new();
    assert_eq!(
        rig.session.handshake_state().unwrap(),
        HandshakeState::AwaitingDevice
    );

    rig.transport.inject_line("Starting...");
    assert!(wait_for(|| {
        rig.session.handshake_state().unwrap() == HandshakeState::DeviceStarting
    }));
    assert!(matches!(
        rig.session.start_recording(),
        Err(DriverError::NotReady(HandshakeState::DeviceStarting))
    ));
    assert!(matches!(
        rig.session.open_live_view(),
        Err(DriverError::NotReady(_))
    ));
    assert!(matches!(rig.session.tare(), Err(DriverError::NotReady(_))));

    rig.transport.inject_line("Finished Setup!");
    rig.session.wait_until_ready(READY_TIMEOUT).unwrap();
    assert_eq!(rig.session.profile().unwrap(), CalibrationProfile::identity());

    let statuses = rig.statuses();
    assert!(statuses.contains(&Status::DeviceStarting));
    assert_eq!(statuses.last(), Some(&Status::Ready));
}

#[test]
fn ready_loads_persisted_profile() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProfileStore::in_dir(dir.path());
    let mut saved = CalibrationProfile::identity();
    saved.apply_tare([2.0, 4.0, 6.0, 8.0]);
    saved.apply_scale(Channel::LeftFront, 0.25);
    store.save(&saved).unwrap();

    let rig = Rig::with_store(dir, store);
    rig.boot();
    let profile = rig.session.profile().unwrap();
    assert_eq!(profile.tare, [2.0, 4.0, 6.0, 8.0]);
    assert_eq!(profile.scale, [1.0, 1.0, 1.0, 0.25]);
    assert!(profile.saved_at.is_some());

    assert_eq!(rig.record_one("4,4,6,10"), [2.0, 0.0, 0.0, 8.0]);
}

#[test]
fn tare_zeroes_subsequent_frames() {
    let rig = Rig::booted();
    let injector = rig.inject_during_window("10,10,10,10", 50);
    let outcome = rig.session.tare().unwrap();
    injector.join().unwrap();

    assert_eq!(outcome.tare, [10.0; 4]);
    assert_eq!(outcome.samples, 50);
    assert_eq!(outcome.rejected, 0);
    assert!(outcome.saved);

    let stored = rig.store().load().unwrap().unwrap();
    assert!(stored.is_tared);
    assert_eq!(stored.tare, [10.0; 4]);

    assert_eq!(rig.record_one("15,15,15,15"), [5.0; 4]);

    let statuses = rig.statuses();
    assert!(statuses.contains(&Status::Taring));
    assert!(statuses
        .iter()
        .any(|s| matches!(s, Status::TareProgress { .. })));
    assert!(statuses.contains(&Status::Tared));
}

#[test]
fn calibrate_derives_scale_from_reference_weight() {
    let rig = Rig::booted();
    let injector = rig.inject_during_window("50,1,1,1", 20);
    let outcome = rig.session.calibrate(Channel::RightRear, 100.0).unwrap();
    injector.join().unwrap();

    assert_eq!(outcome.channel, Channel::RightRear);
    assert_eq!(outcome.scale, 0.5);
    assert_eq!(outcome.samples, 20);
    assert!(outcome.saved);

    let profile = rig.session.profile().unwrap();
    assert_eq!(profile.scale, [0.5, 1.0, 1.0, 1.0]);
    assert!(profile.is_calibrated);
    assert!(!profile.is_tared);

    assert_eq!(rig.record_one("25,0,0,0"), [50.0, 0.0, 0.0, 0.0]);
}

#[test]
fn calibrate_uses_tared_readings() {
    let rig = Rig::booted();
    let injector = rig.inject_during_window("10,10,10,10", 10);
    rig.session.tare().unwrap();
    injector.join().unwrap();

    let injector = rig.inject_during_window("10,10,210,10", 10);
    let outcome = rig.session.calibrate(Channel::LeftRear, 400.0).unwrap();
    injector.join().unwrap();
    assert_eq!(outcome.scale, 0.5);
}

#[test]
fn invalid_weight_is_rejected_before_sampling() {
    let rig = Rig::booted();
    for weight in [0.0, -5.0, f64::NAN, f64::INFINITY] {
        let err = rig.session.calibrate(Channel::RightFront, weight).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Calibration(CalibrationError::InvalidWeight(_))
        ));
    }
    assert_eq!(rig.session.profile().unwrap(), CalibrationProfile::identity());
}

#[test]
fn window_without_data_leaves_profile_untouched() {
    let rig = Rig::booted();
    let injector = rig.inject_during_window("garbage", 5);
    let err = rig.session.tare().unwrap_err();
    injector.join().unwrap();

    assert!(matches!(
        err,
        DriverError::Calibration(CalibrationError::NoValidData)
    ));
    assert!(!rig.session.profile().unwrap().is_tared);
    assert!(rig.store().load().unwrap().is_none());
    assert!(rig
        .statuses()
        .iter()
        .any(|s| matches!(s, Status::Error(_))));
}

#[test]
fn zero_average_reading_fails_calibration() {
    let rig = Rig::booted();
    let injector = rig.inject_during_window("0,5,5,5", 10);
    let err = rig.session.calibrate(Channel::RightRear, 100.0).unwrap_err();
    injector.join().unwrap();
    assert!(matches!(
        err,
        DriverError::Calibration(CalibrationError::ZeroReading {
            channel: Channel::RightRear
        })
    ));
    assert!(!rig.session.profile().unwrap().is_calibrated);
}

#[test]
fn restart_during_tare_aborts_and_resets_handshake() {
    let rig = Rig::booted();
    let transport = rig.transport.clone();
    let injector = thread::spawn(move || {
        thread::sleep(WINDOW_LEAD);
        transport.inject(b"5,5,5,5\n5,5,5,5\nStarting...\n");
    });
    let err = rig.session.tare().unwrap_err();
    injector.join().unwrap();

    assert!(matches!(
        err,
        DriverError::Calibration(CalibrationError::DeviceRestarted)
    ));
    assert_eq!(
        rig.session.handshake_state().unwrap(),
        HandshakeState::DeviceStarting
    );
    assert!(!rig.session.profile().unwrap().is_tared);
}

#[test]
fn restart_and_setup_in_one_read_during_tare_reaches_ready() {
    let rig = Rig::booted();
    rig.status.take();
    let transport = rig.transport.clone();
    let injector = thread::spawn(move || {
        thread::sleep(WINDOW_LEAD);
        transport.inject(b"5,5,5,5\nStarting...\nFinished Setup!\n1,1,1,1\n");
    });
    let err = rig.session.tare().unwrap_err();
    injector.join().unwrap();

    assert!(matches!(
        err,
        DriverError::Calibration(CalibrationError::DeviceRestarted)
    ));
    assert_eq!(rig.session.handshake_state().unwrap(), HandshakeState::Ready);
    assert!(!rig.session.profile().unwrap().is_tared);
    let statuses = rig.status.take();
    assert!(statuses.contains(&Status::DeviceStarting));
    assert!(statuses.contains(&Status::Ready));

    // Nothing stays blocked after the reboot.
    assert_eq!(rig.record_one("1,2,3,4"), [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn setup_sentinel_during_tare_reloads_the_saved_profile() {
    let rig = Rig::booted();
    let mut saved = CalibrationProfile::identity();
    saved.apply_scale(Channel::RightFront, 0.5);
    rig.store().save(&saved).unwrap();

    let transport = rig.transport.clone();
    let injector = thread::spawn(move || {
        thread::sleep(WINDOW_LEAD);
        transport.inject(b"Finished Setup!\n10,10,10,10\n10,10,10,10\n");
    });
    let outcome = rig.session.tare().unwrap();
    injector.join().unwrap();

    assert_eq!(outcome.samples, 2);
    assert_eq!(outcome.rejected, 0);
    let profile = rig.session.profile().unwrap();
    assert_eq!(profile.tare, [10.0; 4]);
    assert_eq!(profile.scale, [1.0, 0.5, 1.0, 1.0]);
    assert_eq!(rig.session.stats().unwrap().sentinels, 3);
}

#[test]
fn cancel_stops_a_running_tare() {
    let rig = Rig::booted();
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(WINDOW_LEAD);
            rig.session.cancel_calibration();
        });
        rig.session.tare()
    });
    assert!(matches!(
        result,
        Err(DriverError::Calibration(CalibrationError::Cancelled))
    ));
    assert!(!rig.session.profile().unwrap().is_tared);

    // The session stays usable after a cancelled routine.
    assert_eq!(rig.record_one("1,2,3,4"), [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn tare_is_refused_while_recording() {
    let rig = Rig::booted();
    rig.session.start_recording().unwrap();
    assert!(matches!(rig.session.tare(), Err(DriverError::Busy(_))));
    assert!(matches!(
        rig.session.start_recording(),
        Err(DriverError::Busy(_))
    ));
}

#[test]
fn tare_and_recording_never_run_together() {
    let rig = Rig::with_config(SessionConfig {
        tare_window_ms: 150,
        ..fast_config()
    });
    rig.boot();
    for _ in 0..10 {
        let start = Barrier::new(2);
        let (tare, recording) = thread::scope(|scope| {
            let tare = scope.spawn(|| {
                start.wait();
                rig.session.tare()
            });
            let recording = scope.spawn(|| {
                start.wait();
                rig.session.start_recording()
            });
            (tare.join().unwrap(), recording.join().unwrap())
        });
        let tare_ran = !matches!(tare, Err(DriverError::Busy(_)));
        assert!(
            !(tare_ran && recording.is_ok()),
            "tare {tare:?} overlapped a recording"
        );
        if recording.is_ok() {
            rig.session.stop_recording().unwrap();
        }
    }
}

#[test]
fn failed_save_keeps_calibration_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"not a directory").unwrap();
    let store = ProfileStore::in_dir(&blocker);

    let rig = Rig::with_store(dir, store);
    rig.boot();
    let injector = rig.inject_during_window("3,3,3,3", 10);
    let outcome = rig.session.tare().unwrap();
    injector.join().unwrap();

    assert!(!outcome.saved);
    let profile = rig.session.profile().unwrap();
    assert!(profile.is_tared);
    assert!(profile.saved_at.is_none());
    assert!(rig
        .statuses()
        .iter()
        .any(|s| matches!(s, Status::SaveFailed { .. })));
}

#[test]
fn invalid_lines_never_reach_consumers() {
    let rig = Rig::booted();
    let mut view = rig.session.open_live_view().unwrap();
    rig.session.start_recording().unwrap();

    rig.transport
        .inject(b"1,2,3\na,b,c,d\n1,2,3,4,5\n1..5,2,3,4\n9e9,0,0,0\n7,7,7,7\n");
    assert!(wait_for(|| {
        let stats = rig.session.stats().unwrap();
        stats.frames == 1 && stats.rejected == 5
    }));

    let recording = rig.session.recording().unwrap();
    assert_eq!(recording.len(), 1);
    assert_eq!(recording.channel(Channel::LeftFront)[0].1, 7.0);
    assert_eq!(view.drain(100), Some([7.0; 4]));
    assert_eq!(view.rings().len(), 1);
}

#[test]
fn starting_a_recording_discards_the_previous_one() {
    let rig = Rig::booted();
    assert_eq!(rig.record_one("1,1,1,1"), [1.0; 4]);

    rig.session.start_recording().unwrap();
    assert!(rig.session.recording().unwrap().is_empty());
    rig.transport.inject_line("2,2,2,2");
    assert!(wait_for(|| rig.session.recording().unwrap().len() == 1));
    assert_eq!(rig.session.stop_recording().unwrap(), 1);
    let recording = rig.session.recording().unwrap();
    assert_eq!(recording.channel(Channel::RightRear)[0].1, 2.0);
    assert!(rig.statuses().contains(&Status::RecordingStopped { samples: 1 }));
}

#[test]
fn restart_mid_recording_stops_the_recording() {
    let rig = Rig::booted();
    rig.session.start_recording().unwrap();
    rig.transport.inject(b"1,1,1,1\nStarting...\n");
    assert!(wait_for(|| !rig.session.is_recording()));
    assert_eq!(rig.session.recording().unwrap().len(), 1);
    assert!(rig.session.open_live_view().is_err());
}

#[test]
fn reconnects_after_transport_error() {
    let rig = Rig::booted();
    assert_eq!(rig.connector.opens(), 1);

    rig.transport.inject_error(io::ErrorKind::BrokenPipe);
    assert!(wait_for(|| rig.connector.opens() == 2));
    assert!(rig
        .statuses()
        .iter()
        .any(|s| matches!(s, Status::Disconnected { .. })));

    assert!(rig.session.is_ready());
    assert_eq!(rig.record_one("3,3,3,3"), [3.0; 4]);
}

#[test]
fn reset_restores_identity_and_deletes_profile() {
    let rig = Rig::booted();
    let injector = rig.inject_during_window("4,4,4,4", 10);
    rig.session.tare().unwrap();
    injector.join().unwrap();
    assert!(rig.store().load().unwrap().is_some());

    rig.session.reset_calibration().unwrap();
    assert_eq!(rig.session.profile().unwrap(), CalibrationProfile::identity());
    assert!(rig.store().load().unwrap().is_none());
    assert!(rig.statuses().contains(&Status::ProfileReset));
}
