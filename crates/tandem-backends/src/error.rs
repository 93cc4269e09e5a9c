//! Error types for backend operations

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while driving a device
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Zero-sized or otherwise unusable allocation request
    #[error("invalid allocation size: {0} bytes")]
    InvalidSize(usize),

    /// Device memory cannot satisfy the request
    #[error("device memory exhausted: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    /// Address does not belong to a live allocation
    #[error("invalid device address: {0:#x}")]
    InvalidAddress(u64),

    /// Access extends past the end of its allocation
    #[error("device access out of bounds: {addr:#x} + {len} bytes exceeds allocation of {alloc_size} bytes")]
    OutOfBounds { addr: u64, len: usize, alloc_size: usize },

    /// Device could not be selected
    #[error("device {device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: i32, reason: String },

    /// Operation requires a selected device
    #[error("no device selected")]
    DeviceNotSet,

    /// Queue handle is unknown or already destroyed
    #[error("invalid queue handle: {0}")]
    InvalidQueue(u64),

    /// Launch image has no program registered for it
    #[error("no device program registered for image of {len} bytes")]
    UnknownImage { len: usize },

    /// Device rejected a launch
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// Device code reported a failure while running
    #[error("device execution failed: {0}")]
    ExecutionFailed(String),

    /// Vendor runtime call returned a non-zero status
    #[error("{call} returned {code}")]
    Driver { call: &'static str, code: i32 },

    /// Vendor runtime library could not be loaded or bound
    #[error("failed to load vendor runtime: {0}")]
    Library(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create a launch failure
    pub fn launch_failed(msg: impl Into<String>) -> Self {
        Self::LaunchFailed(msg.into())
    }

    /// Create a device execution failure
    pub fn execution_failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
