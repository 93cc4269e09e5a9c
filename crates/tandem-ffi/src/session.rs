//! Session entry points

use std::ffi::{c_char, c_void};

use tandem_backends::DeviceAddr;
use tandem_runtime::{global, ArgTag, ArgValue, LaunchParams, RuntimeError, Session, SessionInit};

use crate::boundary::{guard, slice_arg, str_arg};
use crate::handles;

/// Bytes the caller must reserve for a session block
#[no_mangle]
pub extern "C" fn tandem_get_session_size() -> usize {
    handles::session_storage_size()
}

/// Build a session into `storage`
///
/// Binds the given kernel binaries, resolves `entry_name` inside
/// `control_binary` and runs it to build the task graph. A device must have
/// been selected with `tandem_set_device`.
///
/// # Safety
///
/// `storage` must point at [`tandem_get_session_size`] writable bytes.
/// Every array must hold its stated count of valid elements and every
/// binary pointer its stated size; `entry_name` must be NUL-terminated.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tandem_init_session(
    storage: *mut u8,
    control_binary: *const u8,
    control_size: usize,
    entry_name: *const c_char,
    arg_values: *const u64,
    arg_count: usize,
    arg_type_tags: *const i32,
    arg_byte_sizes: *const usize,
    kernel_func_ids: *const u32,
    kernel_binaries: *const *const u8,
    kernel_binary_sizes: *const usize,
    kernel_count: usize,
) -> i32 {
    guard("init_session", || {
        if storage.is_null() {
            return Err(RuntimeError::invalid_argument("session storage is null"));
        }
        handles::clear(storage);

        let image = slice_arg(control_binary, control_size, "control binary")?;
        let entry = str_arg(entry_name, "entry name")?;

        let values = slice_arg(arg_values, arg_count, "argument values")?;
        let tags = slice_arg(arg_type_tags, arg_count, "argument tags")?;
        let sizes = slice_arg(arg_byte_sizes, arg_count, "argument sizes")?;
        let args = values
            .iter()
            .zip(tags)
            .zip(sizes)
            .map(|((value, tag), size)| {
                Ok(ArgValue {
                    value: *value,
                    tag: ArgTag::from_raw(*tag)?,
                    size: *size,
                })
            })
            .collect::<tandem_runtime::Result<Vec<_>>>()?;

        let func_ids = slice_arg(kernel_func_ids, kernel_count, "kernel function ids")?;
        let binaries = slice_arg(kernel_binaries, kernel_count, "kernel binaries")?;
        let binary_sizes = slice_arg(kernel_binary_sizes, kernel_count, "kernel binary sizes")?;
        let mut kernels = Vec::with_capacity(kernel_count);
        for ((func_id, binary), size) in func_ids.iter().zip(binaries).zip(binary_sizes) {
            kernels.push((*func_id, slice_arg(*binary, *size, "kernel binary")?));
        }

        let mut orch = global::acquire();
        let session = Session::init(
            &mut orch,
            SessionInit {
                image,
                entry,
                args,
                kernels,
            },
            global::entries(),
        )?;
        let handle = handles::install(storage, session)?;
        tracing::debug!(handle, "ffi_session_installed");
        Ok(())
    })
}

/// Run a session on the device
///
/// Selects the device and loads both images on first use.
///
/// # Safety
///
/// `session` must be a block filled by [`tandem_init_session`];
/// `control_binary` and `compute_binary` must hold their stated sizes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tandem_launch_session(
    session: *mut u8,
    worker_count: u32,
    block_dim: u32,
    device_id: i32,
    control_binary: *const u8,
    control_size: usize,
    compute_binary: *const u8,
    compute_size: usize,
) -> i32 {
    guard("launch_session", || {
        let handle = handles::handle_of(session)?;
        let control = slice_arg(control_binary, control_size, "control binary")?;
        let compute = slice_arg(compute_binary, compute_size, "compute binary")?;
        let params = LaunchParams::new(block_dim, device_id).with_worker_count(worker_count);

        let mut orch = global::acquire();
        handles::with_session(handle, |session| {
            session.launch(&mut orch, params, control, compute).map(|report| {
                tracing::debug!(handle, completed = report.completed, records = report.records, "ffi_launch_done");
            })
        })
    })
}

/// Release the session's memory and finalize the runtime
///
/// # Safety
///
/// `session` must be a block filled by [`tandem_init_session`].
#[no_mangle]
pub unsafe extern "C" fn tandem_finalize_session(session: *mut u8) -> i32 {
    guard("finalize_session", || {
        let handle = handles::handle_of(session)?;
        let mut orch = global::acquire();
        let owned = handles::remove(handle)?;
        handles::clear(session);
        owned.finalize(&mut orch)
    })
}

/// Turn telemetry collection on or off for later launches of the session
///
/// # Safety
///
/// `session` must be a block filled by [`tandem_init_session`].
#[no_mangle]
pub unsafe extern "C" fn tandem_enable_profiling(session: *mut u8, enabled: bool) -> i32 {
    guard("enable_profiling", || {
        let handle = handles::handle_of(session)?;
        handles::with_session(handle, |session| {
            session.enable_profiling(enabled);
            Ok(())
        })
    })
}

/// Remember a host/device tensor pair; logged when the session finalizes
///
/// # Safety
///
/// `session` must be a block filled by [`tandem_init_session`]. `host_ptr`
/// is only recorded, never dereferenced.
#[no_mangle]
pub unsafe extern "C" fn tandem_record_tensor_pair(
    session: *mut u8,
    host_ptr: *mut c_void,
    device_ptr: u64,
    size: usize,
) -> i32 {
    guard("record_tensor_pair", || {
        let handle = handles::handle_of(session)?;
        handles::with_session(handle, |session| {
            session.record_tensor_pair(host_ptr as usize, DeviceAddr::new(device_ptr), size);
            Ok(())
        })
    })
}
