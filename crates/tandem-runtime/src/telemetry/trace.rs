//! Chrome trace export of collected records
//!
//! Events are complete (`"ph": "X"`) events in microseconds relative to the
//! earliest record, one trace thread per compute core. The file loads in
//! `chrome://tracing` and Perfetto.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::layout::{PerformanceRecord, PipeTag};
use crate::error::{Result, RuntimeError};

/// File name written inside the trace directory
pub const TRACE_FILE_NAME: &str = "merged_swimlane.json";

const DEVICE_PID: u32 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceFile {
    trace_events: Vec<TraceEvent>,
    display_time_unit: &'static str,
}

#[derive(Debug, Serialize)]
struct TraceEvent {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cat: Option<&'static str>,
    ph: &'static str,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    args: serde_json::Value,
}

fn ticks_to_us(ticks: u64, frequency: u64) -> f64 {
    ticks as f64 * 1_000_000.0 / frequency.max(1) as f64
}

fn thread_label(core_id: u32, pipe: PipeTag) -> String {
    match pipe {
        PipeTag::Matrix => format!("AIC_{core_id}"),
        PipeTag::Vector => format!("AIV_{core_id}"),
    }
}

fn build_events(records: &[PerformanceRecord], tick_frequency: u64) -> Vec<TraceEvent> {
    let epoch = records.iter().map(|r| r.start_ticks).min().unwrap_or(0);

    let threads: BTreeMap<u32, PipeTag> = records.iter().map(|r| (r.core_id, r.pipe)).collect();
    let mut events: Vec<TraceEvent> = threads
        .iter()
        .map(|(core_id, pipe)| TraceEvent {
            name: "thread_name".to_string(),
            cat: None,
            ph: "M",
            pid: DEVICE_PID,
            tid: *core_id,
            ts: None,
            dur: None,
            args: serde_json::json!({ "name": thread_label(*core_id, *pipe) }),
        })
        .collect();

    events.extend(records.iter().map(|record| TraceEvent {
        name: record.pipe.name().to_string(),
        cat: Some(record.pipe.category()),
        ph: "X",
        pid: DEVICE_PID,
        tid: record.core_id,
        ts: Some(ticks_to_us(record.start_ticks - epoch, tick_frequency)),
        dur: Some(ticks_to_us(record.duration_ticks(), tick_frequency)),
        args: serde_json::json!({
            "task_id": record.task_id,
            "func_id": record.func_id,
            "start_ticks": record.start_ticks,
            "end_ticks": record.end_ticks,
        }),
    }));
    events
}

/// Write `records` as a Chrome trace into `dir`
///
/// Creates the directory if needed and returns the written file path. An
/// empty record set is an error so callers can tell nothing was exported.
pub fn export_trace(records: &[PerformanceRecord], tick_frequency: u64, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(TRACE_FILE_NAME);
    let export_error = |reason: String| RuntimeError::Export {
        path: path.clone(),
        reason,
    };

    if records.is_empty() {
        return Err(export_error("no performance records collected".to_string()));
    }

    fs::create_dir_all(dir).map_err(|e| export_error(e.to_string()))?;
    let file = File::create(&path).map_err(|e| export_error(e.to_string()))?;
    let mut writer = BufWriter::new(file);

    let trace = TraceFile {
        trace_events: build_events(records, tick_frequency),
        display_time_unit: "ns",
    };
    serde_json::to_writer_pretty(&mut writer, &trace).map_err(|e| export_error(e.to_string()))?;
    writer.flush().map_err(|e| export_error(e.to_string()))?;

    tracing::info!(path = %path.display(), events = records.len(), "trace_exported");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<PerformanceRecord> {
        vec![
            PerformanceRecord {
                core_id: 0,
                pipe: PipeTag::Matrix,
                task_id: 0,
                func_id: 0,
                start_ticks: 1_000,
                end_ticks: 1_050,
            },
            PerformanceRecord {
                core_id: 1,
                pipe: PipeTag::Vector,
                task_id: 1,
                func_id: 2,
                start_ticks: 1_100,
                end_ticks: 1_200,
            },
        ]
    }

    #[test]
    fn test_export_writes_chrome_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = export_trace(&sample(), 50_000_000, dir.path()).unwrap();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(TRACE_FILE_NAME));

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let events = json["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 4);

        let complete: Vec<_> = events.iter().filter(|e| e["ph"] == "X").collect();
        assert_eq!(complete.len(), 2);
        // 50 MHz: 100 ticks past the epoch is 2us, 100 ticks long is 2us.
        assert_eq!(complete[0]["ts"].as_f64(), Some(0.0));
        assert_eq!(complete[1]["ts"].as_f64(), Some(2.0));
        assert_eq!(complete[1]["dur"].as_f64(), Some(2.0));
        assert_eq!(complete[1]["cat"], "vector");
        assert_eq!(complete[1]["args"]["func_id"], 2);

        let names: Vec<_> = events
            .iter()
            .filter(|e| e["ph"] == "M")
            .map(|e| e["args"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["AIC_0", "AIV_1"]);
    }

    #[test]
    fn test_export_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        assert!(export_trace(&sample(), 1_000_000, &nested).is_ok());
        assert!(nested.join(TRACE_FILE_NAME).exists());
    }

    #[test]
    fn test_empty_records_are_an_export_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_trace(&[], 1_000_000, dir.path()).unwrap_err();
        assert_eq!(err.status(), -6);
        assert!(!dir.path().join(TRACE_FILE_NAME).exists());
    }
}
