//! Session handles for the C API
//!
//! A C caller reserves [`session_storage_size`] bytes and passes that block
//! to every session call. The block holds a tag and an opaque handle; the
//! session itself lives in a process-wide registry keyed by the handle.
//!
//! ## Thread Safety
//!
//! The registry is an `Arc<Mutex<HashMap>>`. Calls that also need the
//! orchestrator take the orchestrator first, then the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tandem_runtime::{Result, RuntimeError, Session};

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

const STORAGE_TAG: u64 = u64::from_le_bytes(*b"TANDEMSS");

lazy_static::lazy_static! {
    /// Sessions created through the C API
    pub(crate) static ref SESSION_REGISTRY: Arc<Mutex<HashMap<u64, Session>>> =
        Arc::new(Mutex::new(HashMap::new()));
}

/// Layout of the caller-owned session block
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SessionStorage {
    tag: u64,
    handle: u64,
}

pub(crate) const fn session_storage_size() -> usize {
    std::mem::size_of::<SessionStorage>()
}

/// Handles start at 1; 0 never names a session
fn generate_handle() -> u64 {
    HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Lock a registry, recovering the data if a panic poisoned the mutex
pub(crate) fn lock_registry<T>(mutex: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("session registry mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Register `session` and write its handle into the caller's block
///
/// # Safety
///
/// `storage` must be valid for writes of [`session_storage_size`] bytes.
pub(crate) unsafe fn install(storage: *mut u8, session: Session) -> Result<u64> {
    if storage.is_null() {
        return Err(RuntimeError::invalid_argument("session storage is null"));
    }
    let handle = generate_handle();
    lock_registry(&SESSION_REGISTRY).insert(handle, session);
    std::ptr::write_unaligned(
        storage.cast::<SessionStorage>(),
        SessionStorage {
            tag: STORAGE_TAG,
            handle,
        },
    );
    Ok(handle)
}

/// Read the handle out of a caller's block
///
/// # Safety
///
/// `storage` must be null or valid for reads of [`session_storage_size`] bytes.
pub(crate) unsafe fn handle_of(storage: *const u8) -> Result<u64> {
    if storage.is_null() {
        return Err(RuntimeError::invalid_argument("session is null"));
    }
    let block = std::ptr::read_unaligned(storage.cast::<SessionStorage>());
    if block.tag != STORAGE_TAG || block.handle == 0 {
        return Err(RuntimeError::invalid_argument("session block was not initialized"));
    }
    Ok(block.handle)
}

/// Invalidate the caller's block so later calls reject it
///
/// # Safety
///
/// `storage` must be valid for writes of [`session_storage_size`] bytes.
pub(crate) unsafe fn clear(storage: *mut u8) {
    if !storage.is_null() {
        std::ptr::write_unaligned(storage.cast::<SessionStorage>(), SessionStorage { tag: 0, handle: 0 });
    }
}

/// Run `f` on the registered session named by `handle`
pub(crate) fn with_session<T>(handle: u64, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
    let mut registry = lock_registry(&SESSION_REGISTRY);
    let session = registry
        .get_mut(&handle)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("no live session for handle {handle}")))?;
    f(session)
}

/// Take the session out of the registry
pub(crate) fn remove(handle: u64) -> Result<Session> {
    lock_registry(&SESSION_REGISTRY)
        .remove(&handle)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("no live session for handle {handle}")))
}

pub(crate) fn live_sessions() -> usize {
    lock_registry(&SESSION_REGISTRY).len()
}

/// Drop every registered session without releasing its device memory
///
/// # Warning
///
/// Invalidates every outstanding session block. Use only for testing.
pub fn clear_all_sessions() {
    lock_registry(&SESSION_REGISTRY).clear();
    tracing::info!("all sessions cleared");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_generation() {
        let h1 = generate_handle();
        let h2 = generate_handle();
        assert!(h1 > 0);
        assert!(h2 > h1);
    }

    #[test]
    fn test_uninitialized_block_is_rejected() {
        let block = [0u8; session_storage_size()];
        assert!(unsafe { handle_of(block.as_ptr()) }.is_err());
        assert!(unsafe { handle_of(std::ptr::null()) }.is_err());
        assert_eq!(session_storage_size(), 16);
    }
}
