// Concurrent writers sharing one telemetry logger

use can_telemetry::{DecodedSample, DecodedSignal, SignalValue, TelemetryLogger};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn sample(thread_id: u32, seq: u32) -> DecodedSample {
    DecodedSample {
        can_id: 0x0C1,
        timestamp: Utc.with_ymd_and_hms(2025, 10, 19, 12, 0, 0).unwrap(),
        message_name: Some("EngineSpeed".to_string()),
        signals: vec![DecodedSignal {
            name: "EngineRPM".to_string(),
            value: SignalValue::Float((thread_id * 1000 + seq) as f64),
            unit: Some("rpm".to_string()),
            raw_value: (thread_id * 1000 + seq) as i64,
        }],
        dtc_codes: Vec::new(),
    }
}

#[test]
fn concurrent_appends_never_interleave() {
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 200;

    let dir = TempDir::new().unwrap();
    let logger = Arc::new(TelemetryLogger::new(dir.path()).unwrap());

    let writers: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let logger = Arc::clone(&logger);
            thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    logger.append_sample(&sample(thread_id, seq)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let content = std::fs::read_to_string(dir.path().join("telemetry_2025-10-19.csv")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1 + (THREADS * PER_THREAD) as usize);
    assert_eq!(lines[0], "timestamp,id,message,signals,dtc_codes");

    let mut values: Vec<u32> = lines[1..]
        .iter()
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 5, "malformed row: {}", line);
            assert_eq!(fields[1], "0x0C1");
            fields[3]
                .strip_prefix("EngineRPM=")
                .and_then(|v| v.strip_suffix(" rpm"))
                .unwrap()
                .parse()
                .unwrap()
        })
        .collect();

    // Every record exactly once
    values.sort_unstable();
    let expected: Vec<u32> = (0..THREADS)
        .flat_map(|t| (0..PER_THREAD).map(move |s| t * 1000 + s))
        .collect();
    assert_eq!(values, expected);
}
