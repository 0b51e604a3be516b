//! Device transports.
//!
//! The session only needs a byte stream with a read timeout, so any
//! `Read + Write + Send` type can stand in for the serial port. A
//! [`Connector`] knows how to (re)open one.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::errors::Result;
use crate::protocol::BAUD_RATE;

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Opens a fresh transport; called on connect and on every reconnect attempt.
pub trait Connector: Send + Sync {
    fn open(&self) -> Result<Box<dyn Transport>>;

    /// Human-readable endpoint name for status messages.
    fn describe(&self) -> String;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn open(&self) -> Result<Box<dyn Transport>> {
        self.as_ref().open()
    }

    fn describe(&self) -> String {
        self.as_ref().describe()
    }
}

/// Serial port connector (8N1, no flow control).
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub path: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: BAUD_RATE,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for SerialConnector {
    fn open(&self) -> Result<Box<dyn Transport>> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        info!("Opened serial port: {} at {} baud", self.path, self.baud_rate);
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Names of the serial ports present on this machine.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    debug!("found {} serial ports", ports.len());
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// In-memory transport for tests and offline demos.
pub mod mock {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::thread;
    use std::time::Duration;

    use super::{Connector, Transport};
    use crate::errors::{DriverError, Result};

    enum Chunk {
        Data(Vec<u8>),
        Fail(io::ErrorKind),
    }

    struct Inner {
        chunks: VecDeque<Chunk>,
    }

    /// Replays injected chunks; when empty, behaves like a read timeout.
    ///
    /// Clones share the same script, so a test can keep a handle and inject
    /// lines while a session reads from another clone.
    #[derive(Clone)]
    pub struct ScriptedTransport {
        inner: Arc<Mutex<Inner>>,
        idle: Duration,
    }

    impl Default for ScriptedTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Inner {
                    chunks: VecDeque::new(),
                })),
                idle: Duration::from_millis(2),
            }
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Queue raw bytes to be returned by a single read.
        pub fn inject(&self, bytes: &[u8]) {
            self.lock().chunks.push_back(Chunk::Data(bytes.to_vec()));
        }

        /// Queue one newline-terminated line.
        pub fn inject_line(&self, line: &str) {
            self.inject(format!("{line}\n").as_bytes());
        }

        /// Queue the same line `count` times, delivered in one read.
        pub fn inject_repeated(&self, line: &str, count: usize) {
            self.inject(format!("{line}\n").repeat(count).as_bytes());
        }

        /// Make a future read fail with `kind`.
        pub fn inject_error(&self, kind: io::ErrorKind) {
            self.lock().chunks.push_back(Chunk::Fail(kind));
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let next = self.lock().chunks.pop_front();
            match next {
                Some(Chunk::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        let rest = data.split_off(n);
                        self.lock().chunks.push_front(Chunk::Data(rest));
                    }
                    Ok(n)
                }
                Some(Chunk::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
                None => {
                    thread::sleep(self.idle);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "no scripted data"))
                }
            }
        }
    }

    // The firmware takes no commands; writes are discarded.
    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Hands out clones of one [`ScriptedTransport`].
    pub struct ScriptedConnector {
        transport: ScriptedTransport,
        opens: AtomicUsize,
        failures: AtomicUsize,
    }

    impl ScriptedConnector {
        pub fn new(transport: ScriptedTransport) -> Self {
            Self {
                transport,
                opens: AtomicUsize::new(0),
                failures: AtomicUsize::new(0),
            }
        }

        /// Make the next `count` opens fail.
        pub fn fail_next(&self, count: usize) {
            self.failures.store(count, Ordering::SeqCst);
        }

        /// Successful opens so far.
        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl Connector for ScriptedConnector {
        fn open(&self) -> Result<Box<dyn Transport>> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DriverError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "scripted open failure",
                )));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(self.transport.clone()))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

}
