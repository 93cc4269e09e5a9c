//! Error types for host orchestration

use std::path::PathBuf;

use tandem_backends::BackendError;

use crate::orchestrator::LifecycleState;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Status returned for success at the C boundary
pub const STATUS_OK: i32 = 0;
/// Status returned when a panic was caught at the C boundary
pub const STATUS_PANIC: i32 = -9;

/// Errors that can occur while orchestrating device work
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Caller passed something unusable
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device could not be selected or its queues could not be created
    #[error("device {device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: i32, reason: String },

    /// Device memory could not satisfy a request
    #[error("device memory exhausted: requested {requested} bytes")]
    ResourceExhausted { requested: usize },

    /// A launch was rejected or the device reported a failure
    #[error("{stage} failed: {reason}")]
    LaunchFailed { stage: &'static str, reason: String },

    /// Telemetry could not be set up or collected
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Writing the trace file failed
    #[error("failed to export trace to {path}: {reason}")]
    Export { path: PathBuf, reason: String },

    /// Operation is not valid in the current lifecycle state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// A function id is already bound to a different binary
    #[error("function {func_id} is already bound to a different binary")]
    CacheConflict { func_id: u32 },

    /// The control entry named by a session could not be resolved
    #[error("unknown control entry {0:?}")]
    UnknownEntry(String),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl RuntimeError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a launch failure for the named stage
    pub fn launch_failed(stage: &'static str, reason: impl ToString) -> Self {
        Self::LaunchFailed {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Stable negative status code for the C boundary
    pub fn status(&self) -> i32 {
        match self {
            RuntimeError::InvalidArgument(_) | RuntimeError::CacheConflict { .. } | RuntimeError::UnknownEntry(_) => -1,
            RuntimeError::DeviceUnavailable { .. } => -2,
            RuntimeError::ResourceExhausted { .. } => -3,
            RuntimeError::LaunchFailed { .. } => -4,
            RuntimeError::Telemetry(_) => -5,
            RuntimeError::Export { .. } => -6,
            RuntimeError::InvalidState { .. } => -7,
            RuntimeError::Backend(err) => match err {
                BackendError::InvalidSize(_) | BackendError::InvalidAddress(_) | BackendError::OutOfBounds { .. } => -1,
                BackendError::DeviceUnavailable { .. } | BackendError::DeviceNotSet => -2,
                BackendError::OutOfMemory { .. } => -3,
                BackendError::LaunchFailed(_) | BackendError::UnknownImage { .. } | BackendError::ExecutionFailed(_) => {
                    -4
                }
                _ => -8,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_per_category() {
        let cases = [
            (RuntimeError::invalid_argument("x"), -1),
            (
                RuntimeError::DeviceUnavailable {
                    device_id: 3,
                    reason: "gone".into(),
                },
                -2,
            ),
            (RuntimeError::ResourceExhausted { requested: 8 }, -3),
            (RuntimeError::launch_failed("control launch", "rejected"), -4),
            (RuntimeError::Telemetry("x".into()), -5),
            (
                RuntimeError::Export {
                    path: PathBuf::from("out"),
                    reason: "x".into(),
                },
                -6,
            ),
            (
                RuntimeError::InvalidState {
                    operation: "run",
                    state: LifecycleState::Uninitialized,
                },
                -7,
            ),
            (RuntimeError::Backend(BackendError::other("x")), -8),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_backend_errors_map_to_categories() {
        let oom = RuntimeError::from(BackendError::OutOfMemory {
            requested: 1,
            available: 0,
        });
        assert_eq!(oom.status(), -3);
        assert_eq!(RuntimeError::from(BackendError::DeviceNotSet).status(), -2);
        assert_eq!(RuntimeError::from(BackendError::execution_failed("x")).status(), -4);
    }
}
