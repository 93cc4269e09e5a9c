//! Addresses, queue handles and launch descriptions

use std::fmt;

/// Address of a location in device memory
///
/// Addresses are plain 64-bit values so they can be embedded in device-side
/// structures. The zero address is never handed out by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddr(pub u64);

impl DeviceAddr {
    /// The null device address
    pub const NULL: DeviceAddr = DeviceAddr(0);

    /// Create a device address from a raw value
    pub const fn new(raw: u64) -> Self {
        DeviceAddr(raw)
    }

    /// Get the raw address value
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub const fn offset(self, bytes: u64) -> Self {
        DeviceAddr(self.0 + bytes)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to an execution queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

impl QueueHandle {
    /// Create a new queue handle
    pub const fn new(id: u64) -> Self {
        QueueHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue{}", self.0)
    }
}

/// Which class of cores a queue feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// General-purpose control cores
    Control,
    /// Matrix and vector compute cores
    Compute,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Control => write!(f, "control"),
            QueueKind::Compute => write!(f, "compute"),
        }
    }
}

/// Entry point selected by a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// One-shot control-core initialization
    ControlInit,
    /// Control-core main loop
    ControlMain,
    /// Compute-core worker loop
    Compute,
}

impl EntryKind {
    /// Queue class this entry must be dispatched on
    pub const fn queue_kind(self) -> QueueKind {
        match self {
            EntryKind::ControlInit | EntryKind::ControlMain => QueueKind::Control,
            EntryKind::Compute => QueueKind::Compute,
        }
    }

    /// Symbol name of the entry inside its device image
    pub const fn symbol(self) -> &'static str {
        match self {
            EntryKind::ControlInit => "tandem_control_init",
            EntryKind::ControlMain => "tandem_control_main",
            EntryKind::Compute => "tandem_compute_main",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One dispatch of a device entry point
///
/// The image must already live in device memory; `args` points at the
/// argument block the entry receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub entry: EntryKind,
    pub image: DeviceAddr,
    pub image_len: usize,
    pub args: DeviceAddr,
    /// Number of concurrent instances of the entry
    pub instances: u32,
}

impl LaunchRequest {
    /// Create a launch request
    pub const fn new(entry: EntryKind, image: DeviceAddr, image_len: usize, args: DeviceAddr, instances: u32) -> Self {
        Self {
            entry,
            image,
            image_len,
            args,
            instances,
        }
    }
}
