//! Logging setup.
//!
//! The CLI logs to stderr through `env_logger`. With the `python` feature the
//! extension module can instead forward records into Python's `logging`, so a
//! host application sees driver messages under the `forcewalker.*` loggers.
//!
//! The level comes from `FORCEWALKER_LOG`, then `RUST_LOG`, defaulting to info.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

pub(crate) fn env_level() -> LevelFilter {
    std::env::var("FORCEWALKER_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

pub(crate) fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize stderr logging for binaries; later calls are no-ops.
pub fn init_rust_logging() {
    init_rust_logging_with(None);
}

/// Like [`init_rust_logging`], with an explicit level taking precedence over
/// the environment.
pub fn init_rust_logging_with(level: Option<LevelFilter>) {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(env_level().as_str().to_ascii_lowercase());
        let mut builder = env_logger::Builder::from_env(env);
        if let Some(level) = level {
            builder.filter_level(level);
        }
        let result = builder
            .format_timestamp_millis()
            .format_module_path(false)
            .format_target(true)
            .try_init();
        if result.is_err() {
            log::debug!("logger already installed");
        }
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule};

    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`.
    struct PyLogger {
        max_level: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn py_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self.loggers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn forward(&self, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            Python::attach(|py| {
                let logger = self.logger_for(py, &target)?;
                let logger = logger.bind(py);
                let level = py_level(record.level());
                if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                    logger.call_method1("log", (level, message))?;
                }
                Ok(())
            })
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            let max = *self.max_level.lock().unwrap_or_else(|e| e.into_inner());
            metadata.level().to_level_filter() <= max
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            if let Err(e) = self.forward(record) {
                Python::attach(|py| e.print(py));
            }
        }

        fn flush(&self) {}
    }

    /// Install the bridge; safe to call more than once.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = super::env_level();
        PY_LOGGER.get_or_try_init(|| -> PyResult<&'static PyLogger> {
            let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                max_level: Mutex::new(level),
                logging_mod: py.import("logging")?.unbind(),
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(logger).is_ok() {
                log::set_max_level(level);
            }
            Ok(logger)
        })?;
        Ok(())
    }

    /// Change the forwarded level; `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = level
            .and_then(super::parse_level)
            .unwrap_or_else(super::env_level);
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *logger.max_level.lock().unwrap_or_else(|e| e.into_inner()) = level;
            logger
                .loggers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
        log::set_max_level(level);
        Ok(())
    }
}
