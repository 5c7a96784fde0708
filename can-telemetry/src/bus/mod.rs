//! Frame acquisition
//!
//! `BusReader` owns at most one open `BusHandle` and guards it with a mutex, so
//! open, poll and close from different threads cannot corrupt connection state.
//! The lock is held only for the duration of a single backend call.
//!
//! Backends implement [`BusBackend`]:
//! - `SocketCanBus` - real SocketCAN device (Linux, `socketcan` feature)
//! - `SimulatedBus` - synthetic frames from a [`FrameGenerator`]
//! - candump replay - a `SimulatedBus` scripted from a log file
//!
//! Nothing in this module retries; failures go straight back to the caller.

pub mod replay;
pub mod simulated;
#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;

pub use replay::{load_candump, parse_candump_line};
pub use simulated::{DemoGenerator, FrameGenerator, ScriptedGenerator, SimulatedBus};

use crate::config::InterfaceConfig;
use crate::types::{BusError, RawFrame};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A frame source
pub trait BusBackend: Send {
    /// Wait up to `timeout` for the next frame; a zero timeout never blocks.
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>, BusError>;

    /// Release the underlying connection. Called exactly once.
    fn close(&mut self) {}

    /// Name of the underlying connection, for logs and status
    fn name(&self) -> &str;
}

/// An open connection to a frame source
///
/// Dropping the handle closes the backend, so every exit path releases it.
pub struct BusHandle {
    backend: Box<dyn BusBackend>,
    opened_at: Instant,
    frames_received: u64,
}

impl BusHandle {
    fn new(backend: Box<dyn BusBackend>) -> Self {
        log::info!("Bus opened: {}", backend.name());
        Self {
            backend,
            opened_at: Instant::now(),
            frames_received: 0,
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
        let frame = self.backend.poll(timeout)?;
        if frame.is_some() {
            self.frames_received += 1;
        }
        Ok(frame)
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.backend.close();
        log::info!(
            "Bus closed: {} ({} frames in {:.1}s)",
            self.backend.name(),
            self.frames_received,
            self.opened_at.elapsed().as_secs_f64()
        );
    }
}

/// Build the backend an interface configuration describes
pub fn open_backend(config: &InterfaceConfig) -> Result<Box<dyn BusBackend>, BusError> {
    match config {
        InterfaceConfig::SocketCan { channel } => open_socketcan(channel),
        InterfaceConfig::Virtual { period_ms } => {
            let mut bus = SimulatedBus::new(DemoGenerator::new());
            if *period_ms > 0 {
                bus = bus.with_period(Duration::from_millis(*period_ms));
            }
            Ok(Box::new(bus))
        }
        InterfaceConfig::Replay { path, looped } => {
            let frames = load_candump(path)?;
            let name = format!("replay:{}", path.display());
            let generator = ScriptedGenerator::new(frames).looped(*looped);
            Ok(Box::new(SimulatedBus::new(generator).with_name(name)))
        }
    }
}

#[cfg(all(feature = "socketcan", target_os = "linux"))]
fn open_socketcan(channel: &str) -> Result<Box<dyn BusBackend>, BusError> {
    Ok(Box::new(self::socketcan::SocketCanBus::open(channel)?))
}

#[cfg(not(all(feature = "socketcan", target_os = "linux")))]
fn open_socketcan(channel: &str) -> Result<Box<dyn BusBackend>, BusError> {
    Err(BusError::DeviceUnavailable {
        interface: channel.to_string(),
        reason: "built without SocketCAN support (enable the `socketcan` feature on Linux)".to_string(),
    })
}

/// Thread-safe reader over one bus connection
///
/// State machine: `Closed -> Open -> Closed`. A reader can be reopened after
/// it was closed.
#[derive(Default)]
pub struct BusReader {
    handle: Mutex<Option<BusHandle>>,
}

impl BusReader {
    /// Create a reader in the `Closed` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the interface described by `config`
    pub fn open(&self, config: &InterfaceConfig) -> Result<(), BusError> {
        let mut handle = self.handle.lock();
        if let Some(existing) = handle.as_ref() {
            return Err(BusError::AlreadyOpen(existing.name().to_string()));
        }
        *handle = Some(BusHandle::new(open_backend(config)?));
        Ok(())
    }

    /// Open a caller-supplied backend
    pub fn open_with(&self, backend: Box<dyn BusBackend>) -> Result<(), BusError> {
        let mut handle = self.handle.lock();
        if let Some(existing) = handle.as_ref() {
            return Err(BusError::AlreadyOpen(existing.name().to_string()));
        }
        *handle = Some(BusHandle::new(backend));
        Ok(())
    }

    /// Poll for one frame, waiting at most `timeout` (zero = non-blocking).
    ///
    /// Fails with `NotOpen` if the reader is closed.
    pub fn poll_frame(&self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
        match self.handle.lock().as_mut() {
            Some(handle) => handle.poll(timeout),
            None => Err(BusError::NotOpen),
        }
    }

    /// Close the connection. Closing a closed reader is a no-op.
    pub fn close(&self) {
        let handle = self.handle.lock().take();
        // Dropped outside the lock
        drop(handle);
    }

    pub fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Name of the open connection
    pub fn interface(&self) -> Option<String> {
        self.handle.lock().as_ref().map(|h| h.name().to_string())
    }

    /// Iterate over every frame queued right now, without blocking.
    ///
    /// The iterator ends when the queue is empty; call again to resume.
    pub fn drain(&self) -> Frames<'_> {
        Frames {
            reader: self,
            timeout: Duration::ZERO,
            until_idle: true,
            done: false,
        }
    }

    /// Iterate over frames as they arrive, waiting up to `timeout` per poll.
    ///
    /// Idle polls are skipped; the iterator ends once the reader is closed.
    pub fn frames(&self, timeout: Duration) -> Frames<'_> {
        Frames {
            reader: self,
            timeout,
            until_idle: false,
            done: false,
        }
    }
}

impl Drop for BusReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lazy sequence of frames read from a [`BusReader`]
pub struct Frames<'a> {
    reader: &'a BusReader,
    timeout: Duration,
    until_idle: bool,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<RawFrame, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.reader.poll_frame(self.timeout) {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) if self.until_idle => self.done = true,
                Ok(None) => continue,
                // A closed reader simply ends a streaming iterator
                Err(BusError::NotOpen) if !self.until_idle => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
