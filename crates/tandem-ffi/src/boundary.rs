//! Status conversion and argument checks at the C boundary

use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};

use tandem_runtime::{Result, RuntimeError, STATUS_OK, STATUS_PANIC};

/// Run `f`, turning errors into their status code and panics into [`STATUS_PANIC`]
pub(crate) fn guard<F>(operation: &'static str, f: F) -> i32
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => STATUS_OK,
        Ok(Err(e)) => {
            let status = e.status();
            tracing::warn!(operation, status, error = %e, "ffi_call_failed");
            status
        }
        Err(_) => {
            tracing::error!(operation, "ffi_call_panicked");
            STATUS_PANIC
        }
    }
}

/// Like [`guard`] for calls returning a value; failures yield `fallback`
pub(crate) fn guard_value<T, F>(operation: &'static str, fallback: T, f: F) -> T
where
    F: FnOnce() -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::warn!(operation, status = e.status(), error = %e, "ffi_call_failed");
            fallback
        }
        Err(_) => {
            tracing::error!(operation, "ffi_call_panicked");
            fallback
        }
    }
}

/// Borrow `len` elements at `ptr`; an empty slice needs no pointer
///
/// # Safety
///
/// When `len > 0`, `ptr` must be valid for reads of `len` elements for `'a`.
pub(crate) unsafe fn slice_arg<'a, T>(ptr: *const T, len: usize, what: &'static str) -> Result<&'a [T]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(RuntimeError::invalid_argument(format!("{what} is null")));
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

/// Mutable counterpart of [`slice_arg`]
///
/// # Safety
///
/// When `len > 0`, `ptr` must be valid for writes of `len` elements for `'a`
/// and not aliased.
pub(crate) unsafe fn slice_arg_mut<'a, T>(ptr: *mut T, len: usize, what: &'static str) -> Result<&'a mut [T]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(RuntimeError::invalid_argument(format!("{what} is null")));
    }
    Ok(std::slice::from_raw_parts_mut(ptr, len))
}

/// Borrow a NUL-terminated UTF-8 string
///
/// # Safety
///
/// `ptr` must be null or point at a NUL-terminated string valid for `'a`.
pub(crate) unsafe fn str_arg<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(RuntimeError::invalid_argument(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| RuntimeError::invalid_argument(format!("{what} is not UTF-8: {e}")))
}
