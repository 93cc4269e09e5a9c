//! Function id to device kernel binary bindings

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use tandem_backends::DeviceAddr;

use crate::config::CacheRebind;
use crate::error::{Result, RuntimeError};
use crate::memory::DeviceMemoryAllocator;

/// One uploaded kernel binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBinding {
    pub addr: DeviceAddr,
    pub len: usize,
    digest: u64,
}

/// Cache of kernel binaries resident in device memory
///
/// At most one binary is resident per function id; later uploads for a bound
/// id return the existing address without touching the device.
#[derive(Debug, Default)]
pub struct KernelBinaryCache {
    bindings: BTreeMap<u32, KernelBinding>,
    policy: CacheRebind,
}

fn digest(binary: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    binary.hash(&mut hasher);
    hasher.finish()
}

impl KernelBinaryCache {
    pub fn new(policy: CacheRebind) -> Self {
        Self {
            bindings: BTreeMap::new(),
            policy,
        }
    }

    /// Upload `binary` for `func_id`, or return the address already bound to it
    #[tracing::instrument(skip(self, memory, binary), fields(bytes = binary.len()))]
    pub fn upload(&mut self, memory: &mut DeviceMemoryAllocator, func_id: u32, binary: &[u8]) -> Result<DeviceAddr> {
        if binary.is_empty() {
            return Err(RuntimeError::invalid_argument(format!("empty kernel binary for function {func_id}")));
        }

        if let Some(binding) = self.bindings.get(&func_id) {
            let same = binding.len == binary.len() && binding.digest == digest(binary);
            if !same {
                match self.policy {
                    CacheRebind::Strict => return Err(RuntimeError::CacheConflict { func_id }),
                    CacheRebind::Permissive => tracing::warn!(
                        func_id,
                        addr = %binding.addr,
                        "kernel_rebind_ignored"
                    ),
                }
            }
            tracing::debug!(func_id, addr = %binding.addr, "kernel_cache_hit");
            return Ok(binding.addr);
        }

        let addr = memory.upload(binary)?;
        self.bindings.insert(
            func_id,
            KernelBinding {
                addr,
                len: binary.len(),
                digest: digest(binary),
            },
        );
        tracing::debug!(func_id, addr = %addr, "kernel_uploaded");
        Ok(addr)
    }

    /// Device address bound to `func_id`
    pub fn resolve(&self, func_id: u32) -> Option<DeviceAddr> {
        self.bindings.get(&func_id).map(|b| b.addr)
    }

    pub fn binding(&self, func_id: u32) -> Option<&KernelBinding> {
        self.bindings.get(&func_id)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &KernelBinding)> {
        self.bindings.iter().map(|(id, b)| (*id, b))
    }

    /// Free every cached binary; returns how many were released
    pub fn clear(&mut self, memory: &mut DeviceMemoryAllocator) -> usize {
        let count = self.bindings.len();
        for (func_id, binding) in std::mem::take(&mut self.bindings) {
            if let Err(e) = memory.free(binding.addr) {
                tracing::warn!(func_id, addr = %binding.addr, error = %e, "kernel_free_failed");
            }
        }
        count
    }
}
