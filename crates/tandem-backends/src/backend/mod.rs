//! Backend trait and types for driving a device

mod traits;
mod types;

pub use traits::Backend;
pub use types::{DeviceAddr, EntryKind, LaunchRequest, QueueHandle, QueueKind};
