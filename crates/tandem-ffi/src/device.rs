//! Device selection, host memory API and diagnostics

use std::ffi::c_char;
use std::path::PathBuf;

use tandem_backends::DeviceAddr;
use tandem_runtime::{global, HostApi};

use crate::boundary::{guard, guard_value, slice_arg, slice_arg_mut, str_arg};

/// Select the device later calls run on; repeat calls keep the first device
#[no_mangle]
pub extern "C" fn tandem_set_device(device_id: i32) -> i32 {
    guard("set_device", || global::acquire().ensure_device_set(device_id))
}

/// Allocate device memory; returns 0 on failure
#[no_mangle]
pub extern "C" fn tandem_device_malloc(size: usize) -> u64 {
    guard_value("device_malloc", 0, || global::acquire().device_malloc(size).map(DeviceAddr::get))
}

/// Release memory returned by [`tandem_device_malloc`]
#[no_mangle]
pub extern "C" fn tandem_device_free(addr: u64) -> i32 {
    guard("device_free", || global::acquire().device_free(DeviceAddr::new(addr)))
}

/// Copy `size` host bytes at `src` to device address `dst`
///
/// # Safety
///
/// `src` must be valid for reads of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn tandem_copy_to_device(dst: u64, src: *const u8, size: usize) -> i32 {
    guard("copy_to_device", || {
        let bytes = slice_arg(src, size, "source buffer")?;
        global::acquire().copy_to_device(DeviceAddr::new(dst), bytes)
    })
}

/// Copy `size` bytes from device address `src` into host memory at `dst`
///
/// # Safety
///
/// `dst` must be valid for writes of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn tandem_copy_from_device(dst: *mut u8, src: u64, size: usize) -> i32 {
    guard("copy_from_device", || {
        let bytes = slice_arg_mut(dst, size, "destination buffer")?;
        global::acquire().copy_from_device(bytes, DeviceAddr::new(src))
    })
}

/// Bind a kernel binary to `func_id`; returns its device address or 0
///
/// # Safety
///
/// `binary` must be valid for reads of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn tandem_upload_kernel_binary(func_id: u32, binary: *const u8, size: usize) -> u64 {
    guard_value("upload_kernel_binary", 0, || {
        let bytes = slice_arg(binary, size, "kernel binary")?;
        global::acquire().upload_kernel_binary(func_id, bytes).map(DeviceAddr::get)
    })
}

/// Write the last profiled run's trace into `output_directory`
///
/// A null directory uses the configured trace directory.
///
/// # Safety
///
/// `output_directory` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn tandem_export_trace(output_directory: *const c_char) -> i32 {
    guard("export_trace", || {
        let orch = global::acquire();
        let dir = if output_directory.is_null() {
            orch.config().trace_dir.clone()
        } else {
            PathBuf::from(str_arg(output_directory, "output directory")?)
        };
        orch.export_trace(&dir).map(|path| {
            tracing::debug!(path = %path.display(), "ffi_trace_written");
        })
    })
}

/// Log every handshake slot of the last run; returns 1 when all reached done
#[no_mangle]
pub extern "C" fn tandem_print_handshake_results() -> i32 {
    guard_value("print_handshake_results", 0, || {
        Ok(i32::from(global::acquire().print_handshake_results()))
    })
}

/// Finalize and drop the process-wide runtime
#[no_mangle]
pub extern "C" fn tandem_shutdown() -> i32 {
    guard("shutdown", || {
        global::reset();
        Ok(())
    })
}
