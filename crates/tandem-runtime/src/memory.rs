//! Device memory allocator
//!
//! Thin bookkeeping layer over the backend's allocator. Every address handed
//! out is tracked so that frees of unknown addresses are rejected before they
//! reach the device, and so that finalization can release whatever is still
//! live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tandem_backends::{Backend, BackendError, DeviceAddr, SharedWords};
use tandem_tracing::performance::record_transfer;

use crate::error::{Result, RuntimeError};

/// Tracks device allocations made on behalf of the host
pub struct DeviceMemoryAllocator {
    backend: Arc<dyn Backend>,
    live: HashMap<DeviceAddr, usize>,
    bytes_in_use: usize,
    peak_bytes: usize,
}

impl DeviceMemoryAllocator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            live: HashMap::new(),
            bytes_in_use: 0,
            peak_bytes: 0,
        }
    }

    /// Allocate `bytes` of device memory
    pub fn allocate(&mut self, bytes: usize) -> Result<DeviceAddr> {
        if bytes == 0 {
            return Err(RuntimeError::invalid_argument("zero-sized device allocation"));
        }
        let addr = self.backend.malloc(bytes).map_err(|e| exhaustion(e, bytes))?;
        self.track(addr, bytes);
        tracing::trace!(addr = %addr, bytes, "device_alloc");
        Ok(addr)
    }

    /// Allocate a region visible to host and device
    pub fn allocate_shared(&mut self, bytes: usize) -> Result<(DeviceAddr, SharedWords)> {
        if bytes == 0 {
            return Err(RuntimeError::invalid_argument("zero-sized shared allocation"));
        }
        let (addr, words) = self.backend.alloc_shared(bytes).map_err(|e| exhaustion(e, bytes))?;
        self.track(addr, bytes);
        tracing::trace!(addr = %addr, bytes, "device_alloc_shared");
        Ok((addr, words))
    }

    /// Release an allocation made through this allocator
    ///
    /// Unknown addresses are rejected without touching the device. An
    /// allocation the device refuses to free stays tracked.
    pub fn free(&mut self, addr: DeviceAddr) -> Result<()> {
        let Some(&bytes) = self.live.get(&addr) else {
            return Err(RuntimeError::invalid_argument(format!(
                "{addr} is not a live device allocation"
            )));
        };
        self.backend.free(addr)?;
        self.live.remove(&addr);
        self.bytes_in_use -= bytes;
        tracing::trace!(addr = %addr, bytes, "device_free");
        Ok(())
    }

    pub fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        let start = Instant::now();
        self.backend.copy_to_device(dst, src)?;
        record_transfer(src.len(), "H2D", start.elapsed().as_micros() as u64);
        Ok(())
    }

    pub fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        let start = Instant::now();
        self.backend.copy_from_device(dst, src)?;
        record_transfer(dst.len(), "D2H", start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Allocate and fill in one step; the allocation is released if the copy fails
    pub fn upload(&mut self, bytes: &[u8]) -> Result<DeviceAddr> {
        let addr = self.allocate(bytes.len())?;
        if let Err(e) = self.copy_to_device(addr, bytes) {
            self.release_quietly(addr);
            return Err(e);
        }
        Ok(addr)
    }

    /// Free and log instead of failing, for cleanup paths
    pub fn release_quietly(&mut self, addr: DeviceAddr) {
        if let Err(e) = self.free(addr) {
            tracing::warn!(addr = %addr, error = %e, "device_free_failed");
        }
    }

    /// Release every live allocation; returns how many were released
    pub fn release_all(&mut self) -> usize {
        let addrs: Vec<DeviceAddr> = self.live.keys().copied().collect();
        let count = addrs.len();
        for addr in addrs {
            self.release_quietly(addr);
        }
        count
    }

    pub fn owns(&self, addr: DeviceAddr) -> bool {
        self.live.contains_key(&addr)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    fn track(&mut self, addr: DeviceAddr, bytes: usize) {
        self.live.insert(addr, bytes);
        self.bytes_in_use += bytes;
        self.peak_bytes = self.peak_bytes.max(self.bytes_in_use);
    }
}

fn exhaustion(err: BackendError, requested: usize) -> RuntimeError {
    match err {
        BackendError::OutOfMemory { .. } => RuntimeError::ResourceExhausted { requested },
        other => RuntimeError::Backend(other),
    }
}
