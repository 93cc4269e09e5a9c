//! Performance telemetry: per-task timing records written by compute cores
//! into a double-buffered shared region, drained by the host, exported as a
//! Chrome trace.

mod collector;
mod layout;
mod producer;
mod trace;

pub use collector::{PollOutcome, TelemetryBuffer, TelemetryCollector};
pub use layout::{region_words, Cursor, PerformanceRecord, PipeTag, HEADER_WORDS, RECORD_WORDS};
pub use producer::TelemetryProducer;
pub use trace::{export_trace, TRACE_FILE_NAME};

pub(crate) use producer::{backoff, region_len};
