//! Simulated device memory
//!
//! Allocations are boxed arrays of atomic words so host mappings and device
//! programs can share them without data races. Addresses are carved from a
//! monotonically increasing range and never reused, which keeps stale
//! addresses from aliasing a later allocation.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::DeviceAddr;
use crate::error::{BackendError, Result};
use crate::shared::SharedWords;

const BASE_ADDRESS: u64 = 0x1_0000_0000;
const ALLOC_ALIGN: u64 = 64;
const GUARD_BYTES: u64 = 64;

pub(crate) struct DeviceBlock {
    words: Box<[AtomicU64]>,
    size: usize,
}

impl DeviceBlock {
    fn new(size: usize) -> Self {
        let word_count = size.div_ceil(8);
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            size,
        }
    }

    fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut pos = 0;
        while pos < src.len() {
            let byte = offset + pos;
            let word = byte / 8;
            let shift = byte % 8;
            let take = (8 - shift).min(src.len() - pos);
            let chunk = &src[pos..pos + take];
            if take == 8 {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                self.words[word].store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                let _ = self.words[word].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    let mut bytes = current.to_le_bytes();
                    bytes[shift..shift + take].copy_from_slice(chunk);
                    Some(u64::from_le_bytes(bytes))
                });
            }
            pos += take;
        }
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let mut pos = 0;
        while pos < dst.len() {
            let byte = offset + pos;
            let word = byte / 8;
            let shift = byte % 8;
            let take = (8 - shift).min(dst.len() - pos);
            let bytes = self.words[word].load(Ordering::Relaxed).to_le_bytes();
            dst[pos..pos + take].copy_from_slice(&bytes[shift..shift + take]);
            pos += take;
        }
    }
}

struct MemoryMap {
    blocks: BTreeMap<u64, Arc<DeviceBlock>>,
    next_addr: u64,
    in_use: usize,
}

/// Address space of one simulated device
pub(crate) struct SimMemory {
    capacity: usize,
    map: RwLock<MemoryMap>,
}

impl SimMemory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: RwLock::new(MemoryMap {
                blocks: BTreeMap::new(),
                next_addr: BASE_ADDRESS,
                in_use: 0,
            }),
        }
    }

    pub(crate) fn allocate(&self, bytes: usize) -> Result<DeviceAddr> {
        if bytes == 0 {
            return Err(BackendError::InvalidSize(bytes));
        }
        let mut map = self.map.write();
        let available = self.capacity.saturating_sub(map.in_use);
        if bytes > available {
            return Err(BackendError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let addr = map.next_addr;
        let span = (bytes as u64).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN + GUARD_BYTES;
        map.next_addr += span;
        map.in_use += bytes;
        map.blocks.insert(addr, Arc::new(DeviceBlock::new(bytes)));
        Ok(DeviceAddr::new(addr))
    }

    pub(crate) fn free(&self, addr: DeviceAddr) -> Result<()> {
        let mut map = self.map.write();
        match map.blocks.remove(&addr.get()) {
            Some(block) => {
                map.in_use -= block.size;
                Ok(())
            }
            None => Err(BackendError::InvalidAddress(addr.get())),
        }
    }

    /// Find the allocation containing `[addr, addr + len)`
    fn locate(&self, addr: DeviceAddr, len: usize) -> Result<(Arc<DeviceBlock>, usize)> {
        let map = self.map.read();
        let (base, block) = map
            .blocks
            .range(..=addr.get())
            .next_back()
            .ok_or(BackendError::InvalidAddress(addr.get()))?;
        let offset = (addr.get() - base) as usize;
        if offset >= block.size {
            return Err(BackendError::InvalidAddress(addr.get()));
        }
        if offset + len > block.size {
            return Err(BackendError::OutOfBounds {
                addr: addr.get(),
                len,
                alloc_size: block.size,
            });
        }
        Ok((Arc::clone(block), offset))
    }

    pub(crate) fn write(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        let (block, offset) = self.locate(dst, src.len())?;
        block.write_bytes(offset, src);
        Ok(())
    }

    pub(crate) fn read(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        let (block, offset) = self.locate(src, dst.len())?;
        block.read_bytes(offset, dst);
        Ok(())
    }

    pub(crate) fn map_shared(&self, addr: DeviceAddr, bytes: usize) -> Result<SharedWords> {
        if addr.get() % 8 != 0 {
            return Err(BackendError::InvalidAddress(addr.get()));
        }
        let (block, offset) = self.locate(addr, bytes)?;
        let len = bytes / 8;
        let ptr = NonNull::from(&block.words[offset / 8..]).cast::<AtomicU64>();
        // SAFETY: the block's word array never moves and the Arc keeps it alive.
        Ok(unsafe { SharedWords::from_raw_parts(ptr, len, block) })
    }

    pub(crate) fn in_use(&self) -> usize {
        self.map.read().in_use
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.map.read().blocks.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocate_and_free() {
        let memory = SimMemory::new(1 << 20);
        let a = memory.allocate(100).unwrap();
        let b = memory.allocate(100).unwrap();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(memory.in_use(), 200);
        memory.free(a).unwrap();
        assert_eq!(memory.in_use(), 100);
        assert!(matches!(memory.free(a), Err(BackendError::InvalidAddress(_))));
    }

    #[test]
    fn test_addresses_are_not_reused() {
        let memory = SimMemory::new(1 << 20);
        let a = memory.allocate(64).unwrap();
        memory.free(a).unwrap();
        let b = memory.allocate(64).unwrap();
        assert_ne!(a, b);
        assert!(memory.write(a, &[1]).is_err());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let memory = SimMemory::new(1024);
        memory.allocate(1000).unwrap();
        assert!(matches!(
            memory.allocate(100),
            Err(BackendError::OutOfMemory { requested: 100, available: 24 })
        ));
        assert!(matches!(memory.allocate(0), Err(BackendError::InvalidSize(0))));
    }

    #[test]
    fn test_unaligned_round_trip() {
        let memory = SimMemory::new(1 << 20);
        let addr = memory.allocate(37).unwrap();
        let data: Vec<u8> = (0..30).collect();
        memory.write(addr.offset(3), &data).unwrap();
        let mut out = vec![0u8; 30];
        memory.read(&mut out, addr.offset(3)).unwrap();
        assert_eq!(out, data);

        let mut head = [0xffu8; 3];
        memory.read(&mut head, addr).unwrap();
        assert_eq!(head, [0, 0, 0]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let memory = SimMemory::new(1 << 20);
        let addr = memory.allocate(16).unwrap();
        assert!(matches!(
            memory.write(addr.offset(8), &[0u8; 16]),
            Err(BackendError::OutOfBounds { alloc_size: 16, .. })
        ));
        assert!(matches!(
            memory.write(addr.offset(16), &[0u8; 1]),
            Err(BackendError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_shared_mapping_sees_writes() {
        let memory = SimMemory::new(1 << 20);
        let addr = memory.allocate(64).unwrap();
        let words = memory.map_shared(addr, 64).unwrap();
        memory.write(addr.offset(8), &7u64.to_le_bytes()).unwrap();
        assert_eq!(words.load(1, Ordering::Acquire), 7);
        words.store(2, 9, Ordering::Release);
        let mut out = [0u8; 8];
        memory.read(&mut out, addr.offset(16)).unwrap();
        assert_eq!(u64::from_le_bytes(out), 9);
        assert!(memory.map_shared(addr.offset(4), 8).is_err());
    }

    proptest! {
        #[test]
        fn prop_partial_writes_match_byte_model(
            writes in proptest::collection::vec((0usize..48, proptest::collection::vec(any::<u8>(), 1..16)), 1..20)
        ) {
            let memory = SimMemory::new(1 << 16);
            let addr = memory.allocate(64).unwrap();
            let mut model = vec![0u8; 64];
            for (offset, data) in &writes {
                memory.write(addr.offset(*offset as u64), data).unwrap();
                model[*offset..offset + data.len()].copy_from_slice(data);
            }
            let mut out = vec![0u8; 64];
            memory.read(&mut out, addr).unwrap();
            prop_assert_eq!(out, model);
        }
    }
}
