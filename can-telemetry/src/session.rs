//! Monitoring session
//!
//! A [`Monitor`] owns at most one running session. Starting a session loads the
//! signal database and DTC table, opens the bus, creates the logger and spawns a
//! worker thread. Every poll interval the worker drains the queued frames,
//! decodes them, resolves fault codes, appends the samples to the log and
//! publishes them to the last-value cache and to subscribers.
//!
//! The presentation layer only ever reads: [`Monitor::status`],
//! [`Monitor::latest_sample`], [`Monitor::subscribe`] and [`Monitor::stats`].

use crate::bus::BusReader;
use crate::config::MonitorConfig;
use crate::decoder::FrameDecoder;
use crate::dtc::{DtcInfo, DtcResolver};
use crate::logger::TelemetryLogger;
use crate::signals::SignalDatabase;
use crate::types::{DecodeError, DecodedSample, RawFrame, SessionError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Upper bound on frames handled in one poll cycle
const MAX_FRAMES_PER_CYCLE: usize = 10_000;

/// Lifecycle of a [`Monitor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    /// No session has run yet
    Ready,
    /// The worker is polling the bus
    Monitoring,
    /// The last session was stopped on request
    Stopped,
    /// The last session failed to start or aborted
    Error(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Ready => write!(f, "Ready"),
            SessionStatus::Monitoring => write!(f, "Monitoring"),
            SessionStatus::Stopped => write!(f, "Stopped"),
            SessionStatus::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

/// Counters of the current (or last) session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub cycles: u64,
    pub frames_received: u64,
    pub frames_filtered: u64,
    pub samples_decoded: u64,
    pub unknown_frames: u64,
    pub truncated_frames: u64,
    pub non_data_frames: u64,
    pub dtcs_reported: u64,
    pub records_logged: u64,
    pub samples_dropped: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    frames_received: AtomicU64,
    frames_filtered: AtomicU64,
    samples_decoded: AtomicU64,
    unknown_frames: AtomicU64,
    truncated_frames: AtomicU64,
    non_data_frames: AtomicU64,
    dtcs_reported: AtomicU64,
    records_logged: AtomicU64,
    samples_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn all(&self) -> [&AtomicU64; 10] {
        [
            &self.cycles,
            &self.frames_received,
            &self.frames_filtered,
            &self.samples_decoded,
            &self.unknown_frames,
            &self.truncated_frames,
            &self.non_data_frames,
            &self.dtcs_reported,
            &self.records_logged,
            &self.samples_dropped,
        ]
    }

    fn reset(&self) {
        for counter in self.all() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> SessionStats {
        let [cycles, frames_received, frames_filtered, samples_decoded, unknown_frames, truncated_frames, non_data_frames, dtcs_reported, records_logged, samples_dropped] =
            self.all().map(|c| c.load(Ordering::Relaxed));
        SessionStats {
            cycles,
            frames_received,
            frames_filtered,
            samples_decoded,
            unknown_frames,
            truncated_frames,
            non_data_frames,
            dtcs_reported,
            records_logged,
            samples_dropped,
        }
    }
}

/// State shared between the monitor and its worker
struct Shared {
    status: Mutex<SessionStatus>,
    latest: Mutex<Option<DecodedSample>>,
    subscribers: Mutex<Vec<SyncSender<DecodedSample>>>,
    subscriber_capacity: AtomicUsize,
    resolver: Mutex<Option<Arc<DtcResolver>>>,
    /// Every code reported during the session, keyed by code
    active_dtcs: Mutex<BTreeMap<String, DtcInfo>>,
    counters: Counters,
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        log::debug!("Session status: {}", status);
        *self.status.lock() = status;
    }

    /// Hand a sample to the cache and to every live subscriber
    fn publish(&self, sample: &DecodedSample) {
        *self.latest.lock() = Some(sample.clone());

        self.subscribers.lock().retain(|tx| match tx.try_send(sample.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                bump(&self.counters.samples_dropped);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

struct ActiveSession {
    stop_tx: Sender<()>,
    worker: JoinHandle<()>,
    bus: Arc<BusReader>,
}

impl ActiveSession {
    /// Signal the worker, wait for it and release the bus
    fn shutdown(self) {
        // The worker may already be gone
        let _ = self.stop_tx.send(());
        if self.worker.join().is_err() {
            log::error!("Polling worker panicked");
        }
        self.bus.close();
    }
}

/// Owner of the monitoring session
pub struct Monitor {
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveSession>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(SessionStatus::Ready),
                latest: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                subscriber_capacity: AtomicUsize::new(MonitorConfig::default().subscriber_capacity),
                resolver: Mutex::new(None),
                active_dtcs: Mutex::new(BTreeMap::new()),
                counters: Counters::default(),
            }),
            active: Mutex::new(None),
        }
    }

    /// Start a session.
    ///
    /// On failure nothing stays open and the status becomes `Error`.
    pub fn start_session(&self, config: MonitorConfig) -> Result<(), SessionError> {
        let mut active = self.active.lock();
        if let Some(session) = active.as_ref() {
            if !session.worker.is_finished() {
                return Err(SessionError::AlreadyRunning);
            }
        }
        // Reap a worker that ended on its own
        if let Some(finished) = active.take() {
            finished.shutdown();
        }

        log::info!(
            "Starting {} session on {} ({} bit/s)",
            config.protocol,
            config.interface.describe(),
            config.protocol.bitrate()
        );

        match self.spawn_session(config) {
            Ok(session) => {
                *active = Some(session);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start session: {}", e);
                self.shared.set_status(SessionStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn spawn_session(&self, config: MonitorConfig) -> Result<ActiveSession, SessionError> {
        let db = SignalDatabase::load(config.protocol, &config.db_dir)?;
        let resolver = Arc::new(DtcResolver::load(config.protocol, &config.db_dir)?);

        let mut logger = TelemetryLogger::new(&config.log_dir)?.with_prefix(config.log_prefix.as_str());
        if let Some(days) = config.retention_days {
            logger = logger.with_retention_days(days);
        }

        let bus = Arc::new(BusReader::new());
        bus.open(&config.interface)?;

        self.shared.counters.reset();
        self.shared.active_dtcs.lock().clear();
        *self.shared.latest.lock() = None;
        *self.shared.resolver.lock() = Some(Arc::clone(&resolver));
        self.shared
            .subscriber_capacity
            .store(config.subscriber_capacity.max(1), Ordering::Relaxed);
        self.shared.set_status(SessionStatus::Monitoring);

        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            bus: Arc::clone(&bus),
            db,
            resolver,
            logger,
            config,
            stop_rx,
        };

        let handle = thread::Builder::new()
            .name("can-telemetry-poll".to_string())
            .spawn(move || worker.run())
            .map_err(SessionError::Spawn)?;

        Ok(ActiveSession {
            stop_tx,
            worker: handle,
            bus,
        })
    }

    /// Stop the session. Stopping a stopped monitor is a no-op.
    pub fn stop_session(&self) {
        let Some(session) = self.active.lock().take() else {
            return;
        };
        session.shutdown();

        let mut status = self.shared.status.lock();
        if *status == SessionStatus::Monitoring {
            *status = SessionStatus::Stopped;
        }
        log::info!("Session stopped: {:?}", self.shared.counters.snapshot());
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.lock().clone()
    }

    /// True while the worker is polling
    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|session| !session.worker.is_finished())
    }

    /// Most recent decoded sample
    pub fn latest_sample(&self) -> Option<DecodedSample> {
        self.shared.latest.lock().clone()
    }

    /// Receive every sample published from now on.
    ///
    /// The channel is bounded; samples that do not fit are dropped for that
    /// subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<DecodedSample> {
        let capacity = self.shared.subscriber_capacity.load(Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(capacity);
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Describe a trouble code with the table of the current (or last) session
    pub fn resolve_dtc(&self, code: &str) -> DtcInfo {
        match self.shared.resolver.lock().as_ref() {
            Some(resolver) => resolver.resolve(code),
            None => DtcInfo::unknown(code.trim()),
        }
    }

    /// Codes reported since the session started, ordered by code
    pub fn active_dtcs(&self) -> Vec<DtcInfo> {
        self.shared.active_dtcs.lock().values().cloned().collect()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_session();
    }
}

/// Polling loop state, owned by the worker thread
struct Worker {
    shared: Arc<Shared>,
    bus: Arc<BusReader>,
    db: SignalDatabase,
    resolver: Arc<DtcResolver>,
    logger: TelemetryLogger,
    config: MonitorConfig,
    stop_rx: Receiver<()>,
}

impl Worker {
    fn run(self) {
        let interval = self.config.poll_interval();
        log::debug!("Polling worker started, interval {:?}", interval);

        loop {
            let started = Instant::now();
            if let Err(e) = self.cycle() {
                log::error!("Monitoring session aborted: {}", e);
                self.shared.set_status(SessionStatus::Error(e.to_string()));
                break;
            }

            let remaining = interval.saturating_sub(started.elapsed());
            match self.stop_rx.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.bus.close();
        if let Err(e) = self.logger.sync() {
            log::warn!("Failed to sync telemetry log: {}", e);
        }
        log::debug!("Polling worker finished");
    }

    /// Drain the bus once
    fn cycle(&self) -> Result<(), SessionError> {
        bump(&self.shared.counters.cycles);
        for frame in self.bus.drain().take(MAX_FRAMES_PER_CYCLE) {
            self.handle_frame(&frame?)?;
        }
        Ok(())
    }

    fn handle_frame(&self, frame: &RawFrame) -> Result<(), SessionError> {
        let counters = &self.shared.counters;
        bump(&counters.frames_received);

        if !self.config.should_process_message(frame.can_id) {
            bump(&counters.frames_filtered);
            return Ok(());
        }

        let sample = match FrameDecoder::decode(frame, &self.db) {
            Ok(sample) => sample,
            Err(DecodeError::UnknownIdentifier { .. }) => {
                bump(&counters.unknown_frames);
                if self.config.log_unknown_frames {
                    self.logger.append_sample(&DecodedSample {
                        can_id: frame.can_id,
                        timestamp: frame.timestamp(),
                        message_name: None,
                        signals: Vec::new(),
                        dtc_codes: Vec::new(),
                    })?;
                    bump(&counters.records_logged);
                }
                return Ok(());
            }
            Err(e @ DecodeError::Truncated { .. }) => {
                bump(&counters.truncated_frames);
                log::warn!("Skipping frame {}: {}", frame, e);
                return Ok(());
            }
            Err(DecodeError::NotADataFrame { .. }) => {
                bump(&counters.non_data_frames);
                return Ok(());
            }
        };
        bump(&counters.samples_decoded);

        if sample.has_dtcs() {
            self.record_dtcs(&sample.dtc_codes);
        }

        self.logger.append_sample(&sample)?;
        bump(&counters.records_logged);

        self.shared.publish(&sample);
        Ok(())
    }

    fn record_dtcs(&self, codes: &[String]) {
        let mut active = self.shared.active_dtcs.lock();
        for info in self.resolver.resolve_all(codes) {
            bump(&self.shared.counters.dtcs_reported);
            if !active.contains_key(&info.code) {
                log::warn!("DTC {}: {}", info.code, info.description);
                active.insert(info.code.clone(), info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_monitor_is_ready() {
        let monitor = Monitor::new();
        assert_eq!(monitor.status(), SessionStatus::Ready);
        assert!(!monitor.is_running());
        assert!(monitor.latest_sample().is_none());
        assert_eq!(monitor.stats(), SessionStats::default());

        // Stopping without a session is harmless
        monitor.stop_session();
        assert_eq!(monitor.status(), SessionStatus::Ready);
    }

    #[test]
    fn test_resolve_without_session() {
        let monitor = Monitor::new();
        assert!(monitor.resolve_dtc("P0301").is_unknown());
        assert!(monitor.active_dtcs().is_empty());
    }

    #[test]
    fn test_counters_reset() {
        let counters = Counters::default();
        bump(&counters.frames_received);
        bump(&counters.frames_received);
        bump(&counters.samples_dropped);
        let stats = counters.snapshot();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.samples_dropped, 1);

        counters.reset();
        assert_eq!(counters.snapshot(), SessionStats::default());
    }

    #[test]
    fn test_full_subscriber_drops_and_disconnected_is_pruned() {
        let monitor = Monitor::new();
        monitor.shared.subscriber_capacity.store(1, Ordering::Relaxed);
        let slow = monitor.subscribe();
        let gone = monitor.subscribe();
        drop(gone);

        let sample = DecodedSample {
            can_id: 0x0C1,
            timestamp: chrono::Utc::now(),
            message_name: Some("EngineSpeed".to_string()),
            signals: Vec::new(),
            dtc_codes: Vec::new(),
        };
        monitor.shared.publish(&sample);
        monitor.shared.publish(&sample);

        assert_eq!(monitor.shared.subscribers.lock().len(), 1);
        assert_eq!(monitor.stats().samples_dropped, 1);
        assert_eq!(slow.try_recv().unwrap().can_id, 0x0C1);
        assert!(slow.try_recv().is_err());
        assert_eq!(monitor.latest_sample().unwrap().can_id, 0x0C1);
    }
}
