//! Telemetry collection during runs and trace export

mod common;

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use common::{APP_IMAGE, FAN_ENTRY, NOOP_FUNC};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tandem_runtime::{
    device, ArgValue, LaunchParams, Orchestrator, PipeTag, RuntimeConfig, Session, SessionInit, TRACE_FILE_NAME,
};

fn fan_out_session(orch: &mut Orchestrator, tasks: u64) -> tandem_runtime::Result<Session> {
    let entries = common::entries();
    let init = SessionInit {
        image: APP_IMAGE,
        entry: FAN_ENTRY,
        args: vec![ArgValue::scalar(tasks)],
        kernels: common::kernels(),
    };
    let mut session = Session::init(orch, init, &entries)?;
    session.enable_profiling(true);
    Ok(session)
}

fn orchestrator(config: RuntimeConfig) -> tandem_runtime::Result<Orchestrator> {
    let mut orch = Orchestrator::new(Arc::new(common::simulated()), config);
    orch.ensure_device_set(0)?;
    Ok(orch)
}

#[test]
fn test_one_record_per_task() -> tandem_runtime::Result<()> {
    const TASKS: u64 = 48;
    let mut orch = orchestrator(common::test_config())?;
    let session = fan_out_session(&mut orch, TASKS)?;

    let params = LaunchParams::new(2, 0).with_worker_count(2);
    let report = session.launch(&mut orch, params, device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    assert_eq!(report.records, TASKS as usize);
    assert_eq!(report.dropped, 0);
    assert!(!report.telemetry_timed_out);

    let records = orch.records();
    let ids: BTreeSet<u64> = records.iter().map(|r| r.task_id).collect();
    assert_eq!(ids, (0..TASKS).collect());
    for record in records {
        assert!(record.start_ticks <= record.end_ticks, "{record:?}");
        assert_eq!(record.func_id, NOOP_FUNC);
        assert!(record.core_id < 6);
        let expected = if record.core_id % 3 == 0 { PipeTag::Matrix } else { PipeTag::Vector };
        assert_eq!(record.pipe, expected);
    }

    session.finalize(&mut orch)?;
    Ok(())
}

#[test]
fn test_small_buffers_account_for_every_record() -> tandem_runtime::Result<()> {
    const TASKS: u64 = 64;
    let config = RuntimeConfig {
        telemetry_capacity: 8,
        ..common::test_config()
    };
    let mut orch = orchestrator(config)?;
    let session = fan_out_session(&mut orch, TASKS)?;

    let report = session.launch(&mut orch, LaunchParams::new(1, 0), device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    assert_eq!(report.records as u64 + report.dropped, TASKS);
    assert_eq!(orch.records().len(), report.records);

    // The next profiled run starts from an empty collector.
    let report = session.launch(&mut orch, LaunchParams::new(1, 0), device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    assert_eq!(orch.records().len(), report.records);

    session.finalize(&mut orch)?;
    Ok(())
}

#[test]
fn test_unprofiled_run_collects_nothing() -> tandem_runtime::Result<()> {
    let mut orch = orchestrator(common::test_config())?;
    let mut session = fan_out_session(&mut orch, 5)?;
    session.enable_profiling(false);

    let report = session.launch(&mut orch, LaunchParams::new(1, 0), device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    assert_eq!(report.completed, 5);
    assert_eq!(report.records, 0);
    assert!(orch.records().is_empty());

    let dir = tempfile::tempdir().map_err(|e| tandem_runtime::RuntimeError::invalid_argument(e.to_string()))?;
    let status = orch.export_trace(dir.path()).err().map(|e| e.status());
    assert_eq!(status, Some(-6));

    session.finalize(&mut orch)?;
    Ok(())
}

#[test]
fn test_trace_export_after_finalize() -> tandem_runtime::Result<()> {
    const TASKS: u64 = 12;
    let mut orch = orchestrator(common::test_config())?;
    let session = fan_out_session(&mut orch, TASKS)?;
    session.launch(&mut orch, LaunchParams::new(2, 0), device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    session.finalize(&mut orch)?;

    let dir = tempfile::tempdir().map_err(|e| tandem_runtime::RuntimeError::invalid_argument(e.to_string()))?;
    let path = orch.export_trace(&dir.path().join("outputs"))?;
    assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(TRACE_FILE_NAME));

    let text = std::fs::read_to_string(&path).map_err(|e| tandem_runtime::RuntimeError::invalid_argument(e.to_string()))?;
    let trace: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| tandem_runtime::RuntimeError::invalid_argument(e.to_string()))?;
    let events = trace["traceEvents"].as_array().cloned().unwrap_or_default();

    let complete: Vec<_> = events.iter().filter(|e| e["ph"] == "X").collect();
    assert_eq!(complete.len(), TASKS as usize);
    assert!(complete.iter().all(|e| e["dur"].as_f64().is_some_and(|d| d >= 0.0)));

    let cores: BTreeSet<u64> = orch.records().iter().map(|r| u64::from(r.core_id)).collect();
    let named: Vec<_> = events
        .iter()
        .filter(|e| e["ph"] == "M" && e["name"] == "thread_name")
        .collect();
    assert_eq!(named.len(), cores.len());
    Ok(())
}

/// Log sink shared between the subscriber and the test
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn test_repeat_run_reports_region_resets() -> tandem_runtime::Result<()> {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut orch = orchestrator(common::test_config())?;
        let session = fan_out_session(&mut orch, 4)?;
        let params = LaunchParams::new(1, 0);
        session.launch(&mut orch, params, device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
        assert!(!logs.text().contains("handshake_reset"));

        session.launch(&mut orch, params, device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
        session.finalize(&mut orch)
    })?;

    let text = logs.text();
    assert!(text.contains("handshake_reset"), "{text}");
    assert!(text.contains("telemetry_reset"), "{text}");
    Ok(())
}
