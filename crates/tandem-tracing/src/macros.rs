//! Convenience macros for performance tracing.

/// Create a performance span with automatic field capture.
///
/// ```text
/// perf_span!("name")
/// perf_span!("name", field1 = value1, field2 = value2, ...)
/// ```
///
/// ```rust
/// use tandem_tracing::perf_span;
///
/// {
///     let _span = perf_span!("stage_work", tasks = 16, bytes = 4096);
/// } // Automatically logs duration with fields
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a standardized performance event at debug level.
///
/// ```rust
/// use tandem_tracing::perf_event;
///
/// perf_event!("handshake_reset", slots = 72, bytes = 4608);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}
