//! CAN Telemetry CLI Application
//!
//! Command-line front end for the can-telemetry library:
//! - `monitor` runs a live session and prints samples as they arrive
//! - `decode` decodes a candump log offline
//! - `dtc` looks up trouble code descriptions
//! - `info` summarises the signal database of a protocol

use anyhow::{anyhow, Context, Result};
use can_telemetry::bus::load_candump;
use can_telemetry::{
    BusError, DecodedSample, DecodingIterator, DtcResolver, InterfaceConfig, Monitor, Protocol,
    SessionStatus, SignalDatabase,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

mod config;

use config::{AppConfig, OutputFormat, Overrides};

/// CAN Telemetry - Monitor, decode and log CAN bus traffic
#[derive(Parser, Debug)]
#[command(name = "can-telemetry")]
#[command(about = "Monitor, decode and log CAN bus telemetry (J1939, OBD-II)", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Protocol: j1939 or obd
    #[arg(short, long, global = true)]
    protocol: Option<Protocol>,

    /// Directory holding <protocol>.dbc and <protocol>_codes.json
    #[arg(long, value_name = "DIR", global = true)]
    db_dir: Option<PathBuf>,

    /// Print samples as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a live monitoring session
    Monitor {
        /// Interface: <channel>, socketcan:<channel>, virtual[:<period_ms>],
        /// replay:<file> or replay-loop:<file>
        #[arg(short, long, value_parser = config::parse_interface)]
        interface: Option<InterfaceConfig>,

        /// Directory receiving the daily CSV logs
        #[arg(long, value_name = "DIR")]
        log_dir: Option<PathBuf>,

        /// Poll interval in milliseconds
        #[arg(long, value_name = "MS")]
        poll_interval: Option<u64>,

        /// Stop after this many seconds (default: run until the session fails)
        #[arg(short, long, value_name = "SECS")]
        duration: Option<u64>,
    },

    /// Decode a candump log file
    Decode {
        /// candump log (`(ts) iface ID#DATA` lines)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Maximum number of samples to print
        #[arg(long, value_name = "COUNT")]
        max_samples: Option<usize>,
    },

    /// Describe diagnostic trouble codes
    Dtc {
        /// Codes such as P0301 or SPN190-FMI2
        #[arg(required = true)]
        codes: Vec<String>,
    },

    /// Show signal database statistics
    Info,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Telemetry CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using telemetry library v{}", can_telemetry::VERSION);

    let mut app_config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    let mut overrides = Overrides {
        protocol: args.protocol,
        db_dir: args.db_dir.clone(),
        json: args.json,
        ..Overrides::default()
    };

    match args.command {
        Command::Monitor {
            interface,
            log_dir,
            poll_interval,
            duration,
        } => {
            overrides.interface = interface;
            overrides.log_dir = log_dir;
            overrides.poll_interval_ms = poll_interval;
            app_config.apply(&overrides);
            run_monitor(&app_config, duration.map(Duration::from_secs))
        }
        Command::Decode { file, max_samples } => {
            app_config.apply(&overrides);
            run_decode(&app_config, &file, max_samples)
        }
        Command::Dtc { codes } => {
            app_config.apply(&overrides);
            run_dtc(&app_config, &codes)
        }
        Command::Info => {
            app_config.apply(&overrides);
            run_info(&app_config)
        }
    }
}

/// Live session: print samples until the deadline, Ctrl-C or a session failure
fn run_monitor(config: &AppConfig, duration: Option<Duration>) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let monitor = Monitor::new();
    let deadline = duration.map(|d| Instant::now() + d);
    watch_session(&monitor, config, deadline, &interrupted, |sample| {
        if config.output.print_samples {
            print_sample(sample, config.output.format)?;
        }
        Ok(())
    })?;

    let stats = monitor.stats();
    println!("\nSession summary:");
    println!("  Frames received:  {}", stats.frames_received);
    println!("  Samples decoded:  {}", stats.samples_decoded);
    println!("  Records logged:   {}", stats.records_logged);
    println!("  Unknown frames:   {}", stats.unknown_frames);
    println!("  Truncated frames: {}", stats.truncated_frames);
    println!("  Dropped samples:  {}", stats.samples_dropped);

    let dtcs = monitor.active_dtcs();
    if !dtcs.is_empty() {
        println!("\nTrouble codes reported:");
        for info in dtcs {
            println!("  {:<16} {}", info.code, info.description);
        }
    }
    Ok(())
}

/// Run a session, handing every sample to `on_sample`, and stop it on return
fn watch_session(
    monitor: &Monitor,
    config: &AppConfig,
    deadline: Option<Instant>,
    interrupted: &AtomicBool,
    mut on_sample: impl FnMut(&DecodedSample) -> Result<()>,
) -> Result<()> {
    // Subscribe first so the earliest frames of a replay are not missed
    let samples = monitor.subscribe();
    monitor
        .start_session(config.monitor.clone())
        .context("Failed to start monitoring session")?;

    log::info!(
        "Monitoring {} on {} (Ctrl-C to quit)",
        config.monitor.protocol,
        config.monitor.interface.describe()
    );

    let result = loop {
        if interrupted.load(Ordering::SeqCst) {
            log::info!("Interrupted, stopping session");
            break Ok(());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break Ok(());
        }

        match samples.recv_timeout(Duration::from_millis(250)) {
            Ok(sample) => {
                if let Err(e) = on_sample(&sample) {
                    break Err(e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }

        if let SessionStatus::Error(message) = monitor.status() {
            break Err(anyhow!("Monitoring session failed: {}", message));
        }
    };

    monitor.stop_session();
    result
}

/// Offline decode of a candump log
fn run_decode(config: &AppConfig, file: &Path, max_samples: Option<usize>) -> Result<()> {
    let protocol = config.monitor.protocol;
    let db = SignalDatabase::load(protocol, &config.monitor.db_dir)?;
    let resolver = load_resolver(config);

    let frames = load_candump(file).with_context(|| format!("Failed to read {:?}", file))?;
    let total = frames.len();

    let mut samples = DecodingIterator::new(frames.into_iter().map(Ok::<_, BusError>), &db);
    let mut printed = 0;
    for sample in samples.by_ref().take(max_samples.unwrap_or(usize::MAX)) {
        let sample = sample?;
        print_sample(&sample, config.output.format)?;
        if config.output.format == OutputFormat::Text {
            for info in resolver.resolve_all(&sample.dtc_codes) {
                println!("    DTC {}: {}", info.code, info.description);
            }
        }
        printed += 1;
    }

    log::info!(
        "{} frames, {} samples printed, {} skipped",
        total,
        printed,
        samples.skipped()
    );
    Ok(())
}

fn run_dtc(config: &AppConfig, codes: &[String]) -> Result<()> {
    let resolver = DtcResolver::load(config.monitor.protocol, &config.monitor.db_dir)?;
    for info in resolver.resolve_all(codes) {
        match config.output.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&info)?),
            OutputFormat::Text => println!("{:<16} {}", info.code, info.description),
        }
    }
    Ok(())
}

fn run_info(config: &AppConfig) -> Result<()> {
    let protocol: Protocol = config.monitor.protocol;
    let db = SignalDatabase::load(protocol, &config.monitor.db_dir)?;
    let stats = db.stats();

    println!("Signal database: {:?}", db.source());
    println!("  Protocol: {} ({} bit/s)", protocol, protocol.bitrate());
    println!("  Messages: {}", stats.num_messages);
    println!("  Signals:  {}", stats.num_signals);

    for id in db.identifiers() {
        if let Some(layout) = db.lookup(id) {
            let names: Vec<&str> = layout.signals.iter().map(|s| s.name.as_str()).collect();
            println!("  0x{:08X} {:<24} {}", id, layout.name, names.join(", "));
        }
    }
    Ok(())
}

/// DTC descriptions are optional for offline decoding
fn load_resolver(config: &AppConfig) -> DtcResolver {
    DtcResolver::load(config.monitor.protocol, &config.monitor.db_dir).unwrap_or_else(|e| {
        log::warn!("{}; trouble codes will not be described", e);
        DtcResolver::default()
    })
}

fn print_sample(sample: &DecodedSample, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(sample)?),
        OutputFormat::Text => {
            let signals: Vec<String> = sample
                .signals
                .iter()
                .map(|s| match &s.unit {
                    Some(unit) if !unit.is_empty() => format!("{}={} {}", s.name, s.value, unit),
                    _ => format!("{}={}", s.name, s.value),
                })
                .collect();
            let mut line = format!(
                "{} 0x{:X} {:<16} {}",
                sample.timestamp.format("%H:%M:%S%.3f"),
                sample.can_id,
                sample.message_name.as_deref().unwrap_or("?"),
                signals.join("  ")
            );
            if sample.has_dtcs() {
                line.push_str(&format!("  DTC[{}]", sample.dtc_codes.join(", ")));
            }
            println!("{}", line.trim_end());
        }
    }
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
