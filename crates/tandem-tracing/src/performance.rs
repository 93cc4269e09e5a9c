//! Performance-focused tracing utilities
//!
//! Timed spans plus a few standard events for the runtime's hot spots:
//! launches, host/device transfers and telemetry drains.
//!
//! ## Example
//!
//! ```rust
//! use tandem_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("stage_descriptor", Some(100));
//! // ... do work ...
//! drop(span); // Logs only if duration > 100μs
//!
//! record_transfer(4096, "H2D", 25);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::Level;

const NO_THRESHOLD: u64 = u64::MAX;

static PERF_ENABLED: AtomicBool = AtomicBool::new(true);
static PERF_THRESHOLD_US: AtomicU64 = AtomicU64::new(NO_THRESHOLD);

/// Process-wide defaults applied to spans created without an explicit threshold.
pub fn set_performance_defaults(enabled: bool, threshold_us: Option<u64>) {
    PERF_ENABLED.store(enabled, Ordering::Relaxed);
    PERF_THRESHOLD_US.store(threshold_us.unwrap_or(NO_THRESHOLD), Ordering::Relaxed);
}

fn default_threshold() -> Option<u64> {
    match PERF_THRESHOLD_US.load(Ordering::Relaxed) {
        NO_THRESHOLD => None,
        value => Some(value),
    }
}

/// RAII guard that measures span duration and conditionally logs based on threshold.
///
/// ```rust
/// use tandem_tracing::performance::PerformanceSpan;
///
/// {
///     let _span = PerformanceSpan::new("control_launch", Some(1000));
///     // ... operation code ...
/// } // Span logged only if duration > 1000μs
/// ```
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a new performance span; `None` falls back to the process default threshold.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a new performance span at the specified tracing level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            threshold_us: threshold_us.or_else(default_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    /// Get the elapsed time since span creation.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !PERF_ENABLED.load(Ordering::Relaxed) {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a device launch (one dispatch of an entry point on a queue).
///
/// ```rust
/// use tandem_tracing::performance::record_launch;
///
/// record_launch("compute", 72, 40);
/// ```
pub fn record_launch(entry: &str, instances: u32, duration_us: u64) {
    tracing::debug!(
        event = "launch",
        entry = entry,
        instances = instances,
        duration_us = duration_us,
        "device_launch"
    );
}

/// Record a host/device transfer with bandwidth calculation.
///
/// `direction` is `"H2D"` or `"D2H"`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record the outcome of one telemetry collection pass.
pub fn record_drain(records: usize, dropped: u64, duration_us: u64) {
    let records_per_sec = if duration_us > 0 {
        (records as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };

    tracing::debug!(
        event = "drain",
        records = records,
        dropped = dropped,
        duration_us = duration_us,
        records_per_sec = records_per_sec,
        "telemetry_drain"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_performance_span_measures_elapsed() {
        let span = PerformanceSpan::new("test_operation", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn test_performance_span_with_level() {
        let span = PerformanceSpan::with_level(Level::INFO, "info_operation", Some(0));
        let _entered = span.enter();
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_launch("control_main", 2, 0);
        record_transfer(4096, "H2D", 0);
        record_transfer(4096, "D2H", 12);
        record_drain(128, 3, 0);
    }
}
