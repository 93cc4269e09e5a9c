//! # Tandem FFI
//!
//! C host API over the process-wide tandem runtime.
//!
//! ## Conventions
//!
//! - Calls that can fail return an `i32` status: 0 on success, a negative
//!   code from [`tandem_runtime::RuntimeError::status`] otherwise, and -9
//!   when a panic was caught at the boundary.
//! - Calls returning device addresses return 0 on failure.
//! - Sessions live in caller-owned blocks of [`tandem_get_session_size`]
//!   bytes that hold an opaque handle.
//! - Control entries are resolved from the in-process table at
//!   [`tandem_runtime::global::entries`]; hosts register entries there before
//!   calling [`tandem_init_session`].
//!
//! ## Typical call sequence
//!
//! ```text
//! tandem_set_device(0)
//! tandem_init_session(block, control, len, "entry", args..., kernels...)
//! tandem_enable_profiling(block, true)
//! tandem_launch_session(block, 1, block_dim, 0, control_so, len, compute, len)
//! tandem_export_trace("outputs")
//! tandem_finalize_session(block)
//! ```

mod boundary;
mod device;
mod handles;
mod logging;
mod session;

pub use device::{
    tandem_copy_from_device, tandem_copy_to_device, tandem_device_free, tandem_device_malloc, tandem_export_trace,
    tandem_print_handshake_results, tandem_set_device, tandem_shutdown, tandem_upload_kernel_binary,
};
pub use handles::clear_all_sessions;
pub use logging::tandem_init_logging;
pub use session::{
    tandem_enable_profiling, tandem_finalize_session, tandem_get_session_size, tandem_init_session,
    tandem_launch_session, tandem_record_tensor_pair,
};

/// Number of sessions currently registered through the C API
pub fn live_sessions() -> usize {
    handles::live_sessions()
}

/// Get the version of the tandem-ffi library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
