//! Python bindings (`python` feature).
//!
//! Every call that touches the session releases the GIL first: the reader
//! thread may hold a session lock while forwarding a log record to Python.

use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::calibration::{CalibrationProfile, ProfileStore};
use crate::config::SessionConfig;
use crate::errors::{CalibrationError, DriverError};
use crate::live::LiveView;
use crate::logging;
use crate::protocol::Channel;
use crate::session::SerialSession;
use crate::status::QueueStatusSink;
use crate::transport::{list_ports, SerialConnector};

// ============================================================================
// Error Mapping
// ============================================================================

fn to_py_err(e: DriverError) -> PyErr {
    let msg = e.to_string();
    match e {
        DriverError::Io(_)
        | DriverError::Serial(_)
        | DriverError::NotConnected
        | DriverError::Persistence(_) => PyIOError::new_err(msg),
        DriverError::Calibration(CalibrationError::InvalidWeight(_)) => {
            PyValueError::new_err(msg)
        }
        DriverError::Calibration(_)
        | DriverError::NotReady(_)
        | DriverError::Busy(_)
        | DriverError::Poisoned => PyRuntimeError::new_err(msg),
    }
}

fn profile_dict<'py>(
    py: Python<'py>,
    profile: &CalibrationProfile,
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("tare_values", profile.tare.to_vec())?;
    dict.set_item("calibration_values", profile.scale.to_vec())?;
    dict.set_item("is_tared", profile.is_tared)?;
    dict.set_item("is_calibrated", profile.is_calibrated)?;
    dict.set_item("timestamp", profile.saved_at)?;
    Ok(dict)
}

// ============================================================================
// Session
// ============================================================================

/// Four-channel walker force sensor attached over a serial port.
///
/// The device is read on a background thread as soon as the session is
/// created. Recording, tare, calibration and the live view become available
/// once the device reports that it finished its setup.
///
/// Example:
///     >>> s = ForceSession("/dev/ttyACM0")
///     >>> s.wait_until_ready(10.0)
///     >>> s.tare()
///     >>> s.start_recording()
///     >>> ...
///     >>> s.stop_recording()
///     >>> data = s.recording()
#[pyclass(name = "ForceSession")]
struct PyForceSession {
    session: Option<SerialSession>,
    status: Arc<QueueStatusSink>,
    live: Option<LiveView>,
}

impl PyForceSession {
    fn session(&self) -> PyResult<&SerialSession> {
        self.session
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("session is closed"))
    }
}

#[pymethods]
impl PyForceSession {
    /// Open `port` and start reading.
    ///
    /// Args:
    ///     port: Serial device path, e.g. "/dev/ttyACM0" or "COM3".
    ///     profile_path: Calibration file; defaults to the user data directory.
    ///     config_path: Optional JSON file with session settings.
    #[new]
    #[pyo3(signature = (port, profile_path=None, config_path=None))]
    fn new(
        py: Python<'_>,
        port: &str,
        profile_path: Option<String>,
        config_path: Option<String>,
    ) -> PyResult<Self> {
        let config = config_path
            .map(SessionConfig::load_from_file)
            .unwrap_or_default();
        let store = match profile_path.or_else(|| {
            config
                .profile_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
        }) {
            Some(path) => ProfileStore::new(path),
            None => ProfileStore::default_location()
                .map_err(|e| to_py_err(DriverError::from(e)))?,
        };
        let connector = SerialConnector::new(port)
            .with_baud_rate(config.baud_rate)
            .with_timeout(config.read_timeout());

        let status = Arc::new(QueueStatusSink::new());
        let sink = Arc::clone(&status);
        let session = py
            .detach(move || SerialSession::connect(connector, store, sink, config))
            .map_err(to_py_err)?;
        Ok(Self {
            session: Some(session),
            status,
            live: None,
        })
    }

    /// Handshake state: "awaiting device", "device starting" or "ready".
    #[getter]
    fn state(&self, py: Python<'_>) -> PyResult<String> {
        let session = self.session()?;
        let state = py
            .detach(|| session.handshake_state())
            .map_err(to_py_err)?;
        Ok(state.to_string())
    }

    #[getter]
    fn is_ready(&self, py: Python<'_>) -> PyResult<bool> {
        let session = self.session()?;
        Ok(py.detach(|| session.is_ready()))
    }

    #[getter]
    fn is_recording(&self, py: Python<'_>) -> PyResult<bool> {
        let session = self.session()?;
        Ok(py.detach(|| session.is_recording()))
    }

    /// Block until the device is ready or `timeout` seconds pass.
    #[pyo3(signature = (timeout=10.0))]
    fn wait_until_ready(&self, py: Python<'_>, timeout: f64) -> PyResult<()> {
        let session = self.session()?;
        let timeout = Duration::try_from_secs_f64(timeout)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        py.detach(|| session.wait_until_ready(timeout))
            .map_err(to_py_err)
    }

    /// Status messages published since the previous call, oldest first.
    fn status_messages(&self) -> Vec<String> {
        self.status.take().iter().map(ToString::to_string).collect()
    }

    /// Most recent status message.
    #[getter]
    fn last_status(&self) -> Option<String> {
        self.status.last().map(|s| s.to_string())
    }

    fn start_recording(&self, py: Python<'_>) -> PyResult<()> {
        let session = self.session()?;
        py.detach(|| session.start_recording()).map_err(to_py_err)
    }

    /// Stop recording and return the number of samples captured.
    fn stop_recording(&self, py: Python<'_>) -> PyResult<usize> {
        let session = self.session()?;
        py.detach(|| session.stop_recording()).map_err(to_py_err)
    }

    /// The current or last recording as `{label: [(seconds, value), ...]}`.
    fn recording<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let session = self.session()?;
        let recording = py.detach(|| session.recording()).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        for channel in Channel::ALL {
            dict.set_item(channel.label(), recording.channel(channel).to_vec())?;
        }
        Ok(dict)
    }

    /// Zero all channels over the tare window. Releases the GIL while sampling.
    fn tare<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let session = self.session()?;
        let outcome = py.detach(|| session.tare()).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("tare_values", outcome.tare.to_vec())?;
        dict.set_item("samples", outcome.samples)?;
        dict.set_item("rejected", outcome.rejected)?;
        dict.set_item("saved", outcome.saved)?;
        Ok(dict)
    }

    /// Calibrate one channel ("rr", "Right-Front", "2", ...) with a known weight in grams.
    fn calibrate<'py>(
        &self,
        py: Python<'py>,
        channel: &str,
        weight: f64,
    ) -> PyResult<Bound<'py, PyDict>> {
        let channel: Channel = channel.parse().map_err(PyValueError::new_err)?;
        let session = self.session()?;
        let outcome = py
            .detach(|| session.calibrate(channel, weight))
            .map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("channel", outcome.channel.label())?;
        dict.set_item("scale", outcome.scale)?;
        dict.set_item("samples", outcome.samples)?;
        dict.set_item("rejected", outcome.rejected)?;
        dict.set_item("saved", outcome.saved)?;
        Ok(dict)
    }

    /// Abort a tare or calibration running on another thread.
    fn cancel_calibration(&self) -> PyResult<()> {
        self.session()?.cancel_calibration();
        Ok(())
    }

    /// Back to identity calibration; deletes the saved profile.
    fn reset_calibration(&self, py: Python<'_>) -> PyResult<()> {
        let session = self.session()?;
        py.detach(|| session.reset_calibration()).map_err(to_py_err)
    }

    fn profile<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let session = self.session()?;
        let profile = py.detach(|| session.profile()).map_err(to_py_err)?;
        profile_dict(py, &profile)
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let session = self.session()?;
        let stats = py.detach(|| session.stats()).map_err(to_py_err)?;
        let dict = PyDict::new(py);
        dict.set_item("lines", stats.lines)?;
        dict.set_item("frames", stats.frames)?;
        dict.set_item("rejected", stats.rejected)?;
        dict.set_item("sentinels", stats.sentinels)?;
        dict.set_item("decode_errors", stats.decode_errors)?;
        dict.set_item("live_dropped", stats.live_dropped)?;
        Ok(dict)
    }

    /// Start (or restart) the live view.
    fn open_live(&mut self, py: Python<'_>) -> PyResult<()> {
        self.live = None;
        let session = self.session()?;
        let view = py
            .detach(|| session.open_live_view())
            .map_err(to_py_err)?;
        self.live = Some(view);
        Ok(())
    }

    /// Move queued live samples into the rings; returns the newest values.
    #[pyo3(signature = (max_items=None))]
    fn drain_live(&mut self, max_items: Option<usize>) -> PyResult<Option<Vec<f64>>> {
        let batch = match max_items {
            Some(n) => n,
            None => self.session()?.config().live_drain_batch,
        };
        let view = self
            .live
            .as_mut()
            .ok_or_else(|| PyRuntimeError::new_err("live view is not open"))?;
        Ok(view.drain(batch).map(|values| values.to_vec()))
    }

    /// Ring contents as `{"time": [...], label: [...], ...}`.
    fn live_rings<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let view = self
            .live
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("live view is not open"))?;
        let rings = view.rings();
        let dict = PyDict::new(py);
        dict.set_item("time", rings.time().iter().copied().collect::<Vec<_>>())?;
        for channel in Channel::ALL {
            let values: Vec<f64> = rings.channel(channel).iter().copied().collect();
            dict.set_item(channel.label(), values)?;
        }
        Ok(dict)
    }

    fn clear_live(&mut self) {
        if let Some(view) = self.live.as_mut() {
            view.clear();
        }
    }

    fn close_live(&mut self) {
        self.live = None;
    }

    /// Stop the reader thread and release the port.
    fn close(&mut self, py: Python<'_>) {
        self.live = None;
        if let Some(mut session) = self.session.take() {
            py.detach(move || session.close());
        }
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __exit__(
        &mut self,
        py: Python<'_>,
        _exc_type: Option<Bound<'_, PyAny>>,
        _exc_value: Option<Bound<'_, PyAny>>,
        _traceback: Option<Bound<'_, PyAny>>,
    ) -> bool {
        self.close(py);
        false
    }

    fn __repr__(&self, py: Python<'_>) -> String {
        match &self.session {
            Some(session) => format!(
                "ForceSession(state={:?})",
                py.detach(|| session.handshake_state())
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            ),
            None => "ForceSession(closed)".to_string(),
        }
    }
}

/// Serial ports present on this machine.
#[pyfunction(name = "list_ports")]
fn py_list_ports() -> PyResult<Vec<String>> {
    list_ports().map_err(to_py_err)
}

/// Forward driver logs to Python's `logging`, optionally at `level`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level(py, level)
}

#[pymodule]
fn forcewalker(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;
    m.add_class::<PyForceSession>()?;
    m.add_function(wrap_pyfunction!(py_list_ports, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    m.add("BAUD_RATE", crate::protocol::BAUD_RATE)?;
    m.add(
        "CHANNELS",
        Channel::ALL.iter().map(|c| c.label()).collect::<Vec<_>>(),
    )?;
    Ok(())
}
