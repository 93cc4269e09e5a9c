//! Host-visible word mappings of device memory

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A window of device memory viewed as atomic 64-bit words
///
/// Produced by [`crate::Backend::alloc_shared`]. Host and device observe each
/// other's writes through the mapping; every word is individually atomic so
/// single-writer protocols can be built on top of it. The mapping keeps its
/// backing storage alive for as long as any view exists.
#[derive(Clone)]
pub struct SharedWords {
    ptr: NonNull<AtomicU64>,
    len: usize,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the words are atomics and `_owner` keeps the storage alive.
unsafe impl Send for SharedWords {}
unsafe impl Sync for SharedWords {}

impl SharedWords {
    /// Build a mapping over raw storage.
    ///
    /// # Safety
    ///
    /// `ptr` must point at `len` initialized, 8-byte aligned words that stay
    /// valid and are only accessed atomically while `owner` is alive.
    pub unsafe fn from_raw_parts(ptr: NonNull<AtomicU64>, len: usize, owner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            ptr,
            len,
            _owner: owner,
        }
    }

    /// Allocate a host-only mapping, used for tests and benches.
    pub fn zeroed(len: usize) -> Self {
        let storage: Arc<Box<[AtomicU64]>> = Arc::new((0..len).map(|_| AtomicU64::new(0)).collect());
        let ptr = NonNull::from(&storage[..]).cast::<AtomicU64>();
        // SAFETY: the boxed slice never moves and lives as long as the Arc.
        unsafe { Self::from_raw_parts(ptr, len, storage) }
    }

    /// Number of words in the mapping
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped words
    pub fn words(&self) -> &[AtomicU64] {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn load(&self, index: usize, order: Ordering) -> u64 {
        self.words()[index].load(order)
    }

    pub fn store(&self, index: usize, value: u64, order: Ordering) {
        self.words()[index].store(value, order)
    }

    pub fn fetch_add(&self, index: usize, value: u64, order: Ordering) -> u64 {
        self.words()[index].fetch_add(value, order)
    }

    pub fn fetch_sub(&self, index: usize, value: u64, order: Ordering) -> u64 {
        self.words()[index].fetch_sub(value, order)
    }

    pub fn compare_exchange(
        &self,
        index: usize,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> std::result::Result<u64, u64> {
        self.words()[index].compare_exchange(current, new, success, failure)
    }

    /// Store `value` into every word
    pub fn fill(&self, value: u64) {
        for word in self.words() {
            word.store(value, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
    }

    /// Copy the current word values out
    pub fn snapshot(&self, start: usize, len: usize) -> Vec<u64> {
        self.words()[start..start + len]
            .iter()
            .map(|word| word.load(Ordering::Acquire))
            .collect()
    }

    /// Sub-window of `len` words starting at `start`
    ///
    /// Returns `None` when the window does not fit.
    pub fn slice(&self, start: usize, len: usize) -> Option<SharedWords> {
        let end = start.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: start <= self.len, so the offset stays inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(start)) };
        Some(Self {
            ptr,
            len,
            _owner: Arc::clone(&self._owner),
        })
    }
}

impl fmt::Debug for SharedWords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWords").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_mapping() {
        let words = SharedWords::zeroed(8);
        assert_eq!(words.len(), 8);
        assert!(words.snapshot(0, 8).iter().all(|w| *w == 0));
    }

    #[test]
    fn test_slice_shares_storage() {
        let words = SharedWords::zeroed(8);
        let tail = words.slice(4, 4).unwrap();
        tail.store(1, 42, Ordering::Release);
        assert_eq!(words.load(5, Ordering::Acquire), 42);
        assert!(words.slice(6, 4).is_none());
    }

    #[test]
    fn test_atomic_helpers() {
        let words = SharedWords::zeroed(2);
        assert_eq!(words.fetch_add(0, 3, Ordering::AcqRel), 0);
        assert_eq!(words.compare_exchange(0, 3, 7, Ordering::AcqRel, Ordering::Acquire), Ok(3));
        assert_eq!(words.compare_exchange(0, 3, 9, Ordering::AcqRel, Ordering::Acquire), Err(7));
        words.fill(5);
        assert_eq!(words.snapshot(0, 2), vec![5, 5]);
    }
}
