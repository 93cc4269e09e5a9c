//! Backend trait definition

use crate::backend::types::{DeviceAddr, LaunchRequest, QueueHandle, QueueKind};
use crate::error::Result;
use crate::shared::SharedWords;

/// Driver interface for one accelerator device
///
/// A backend selects a device, owns its queues and memory, and launches
/// device entry points. Implementations use interior locking so a single
/// backend can be shared between the host orchestrator and test harnesses.
///
/// # Ordering
///
/// Work dispatched on one queue runs in submission order. Work on different
/// queues may run concurrently. `synchronize` returns once everything
/// dispatched on the queue has finished and reports the first failure.
pub trait Backend: Send + Sync {
    /// Short name used in log fields
    fn name(&self) -> &'static str;

    /// Select the device that subsequent calls operate on
    fn set_device(&self, device_id: i32) -> Result<()>;

    /// Create an execution queue on the selected device
    fn create_queue(&self, kind: QueueKind) -> Result<QueueHandle>;

    /// Destroy a queue, waiting for its outstanding work first
    fn destroy_queue(&self, queue: QueueHandle) -> Result<()>;

    /// Allocate `bytes` of device memory
    fn malloc(&self, bytes: usize) -> Result<DeviceAddr>;

    /// Release an allocation returned by [`Backend::malloc`]
    fn free(&self, addr: DeviceAddr) -> Result<()>;

    /// Copy host bytes into device memory at `dst`
    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<()>;

    /// Copy device memory at `src` into the host slice
    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()>;

    /// Allocate `bytes` of memory visible to both host and device
    ///
    /// Returns the device address together with a host view of the same
    /// words. Host and device observe each other's writes without explicit
    /// copies and each word is individually atomic. Release the region with
    /// [`Backend::free`].
    fn alloc_shared(&self, bytes: usize) -> Result<(DeviceAddr, SharedWords)>;

    /// Current value of the device tick counter
    fn device_ticks(&self) -> u64;

    /// Tick counter frequency in Hz
    fn tick_frequency(&self) -> u64;

    /// Enqueue a launch; returns once the launch is accepted, not finished
    fn dispatch(&self, queue: QueueHandle, request: &LaunchRequest) -> Result<()>;

    /// Wait for all work on `queue` to finish
    fn synchronize(&self, queue: QueueHandle) -> Result<()>;
}
