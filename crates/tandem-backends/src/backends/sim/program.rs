//! Device-side contracts for simulated programs and kernels
//!
//! On real hardware a launch image is machine code. The simulator instead
//! looks the image bytes up in a [`ProgramRegistry`] and runs the matching
//! Rust implementation on host threads, one thread per launched instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::clock::SimClock;
use super::memory::SimMemory;
use crate::backend::{DeviceAddr, EntryKind};
use crate::error::{BackendError, Result};
use crate::shared::SharedWords;

/// A device entry image implemented in Rust
pub trait DeviceProgram: Send + Sync {
    /// Run one instance of the entry selected by `ctx.entry()`
    fn run(&self, ctx: &DeviceContext<'_>) -> Result<()>;
}

/// A compute kernel bound to a kernel binary image
///
/// `args` holds the kernel's argument words exactly as the task graph encoded them.
pub trait DeviceKernel: Send + Sync {
    fn execute(&self, ctx: &DeviceContext<'_>, args: &[u64]) -> Result<()>;
}

impl<F> DeviceKernel for F
where
    F: Fn(&DeviceContext<'_>, &[u64]) -> Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &DeviceContext<'_>, args: &[u64]) -> Result<()> {
        self(ctx, args)
    }
}

/// Image bytes to implementation lookup for one simulated device
#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<Vec<u8>, Arc<dyn DeviceProgram>>>,
    kernels: RwLock<HashMap<Vec<u8>, Arc<dyn DeviceKernel>>>,
}

impl ProgramRegistry {
    pub fn register_program(&self, image: &[u8], program: Arc<dyn DeviceProgram>) {
        self.programs.write().insert(image.to_vec(), program);
    }

    pub fn register_kernel(&self, image: &[u8], kernel: Arc<dyn DeviceKernel>) {
        self.kernels.write().insert(image.to_vec(), kernel);
    }

    pub fn program(&self, image: &[u8]) -> Option<Arc<dyn DeviceProgram>> {
        self.programs.read().get(image).cloned()
    }

    pub fn kernel(&self, image: &[u8]) -> Option<Arc<dyn DeviceKernel>> {
        self.kernels.read().get(image).cloned()
    }
}

/// What one running instance of a device entry can see
pub struct DeviceContext<'a> {
    pub(crate) memory: &'a SimMemory,
    pub(crate) registry: &'a ProgramRegistry,
    pub(crate) clock: &'a SimClock,
    pub(crate) entry: EntryKind,
    pub(crate) args: DeviceAddr,
    pub(crate) instance: u32,
    pub(crate) instances: u32,
}

impl<'a> DeviceContext<'a> {
    pub fn entry(&self) -> EntryKind {
        self.entry
    }

    /// Argument block address passed with the launch
    pub fn args(&self) -> DeviceAddr {
        self.args
    }

    /// Index of this instance within the launch
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Number of instances in the launch
    pub fn instances(&self) -> u32 {
        self.instances
    }

    pub fn ticks(&self) -> u64 {
        self.clock.ticks()
    }

    pub fn read(&self, addr: DeviceAddr, dst: &mut [u8]) -> Result<()> {
        self.memory.read(dst, addr)
    }

    pub fn write(&self, addr: DeviceAddr, src: &[u8]) -> Result<()> {
        self.memory.write(addr, src)
    }

    pub fn read_u64(&self, addr: DeviceAddr) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.memory.read(&mut bytes, addr)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_words(&self, addr: DeviceAddr, count: usize) -> Result<Vec<u64>> {
        let mut words = vec![0u64; count];
        self.memory.read(bytemuck::cast_slice_mut(&mut words), addr)?;
        Ok(words)
    }

    pub fn read_f32s(&self, addr: DeviceAddr, count: usize) -> Result<Vec<f32>> {
        let mut values = vec![0f32; count];
        self.memory.read(bytemuck::cast_slice_mut(&mut values), addr)?;
        Ok(values)
    }

    pub fn write_f32s(&self, addr: DeviceAddr, values: &[f32]) -> Result<()> {
        self.memory.write(addr, bytemuck::cast_slice(values))
    }

    /// Atomic word view of device memory shared with other instances and the host
    pub fn shared(&self, addr: DeviceAddr, bytes: usize) -> Result<SharedWords> {
        self.memory.map_shared(addr, bytes)
    }

    /// Resolve the kernel whose binary lives at `addr`
    pub fn kernel_at(&self, addr: DeviceAddr, len: usize) -> Result<Arc<dyn DeviceKernel>> {
        let mut image = vec![0u8; len];
        self.memory.read(&mut image, addr)?;
        self.registry
            .kernel(&image)
            .ok_or_else(|| BackendError::execution_failed(format!("no kernel registered for binary at {addr}")))
    }
}
