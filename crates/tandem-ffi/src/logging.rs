//! Optional log setup for C hosts that have no subscriber of their own

use std::sync::OnceLock;

use tandem_tracing::{init_global_tracing, TracingConfig};

use crate::boundary::guard_value;

static LOGGING: OnceLock<i32> = OnceLock::new();

/// Install the runtime's tracing subscriber, configured from the environment
///
/// Only the first call installs anything; later calls return its status.
/// Returns 0 on success and 1 when another subscriber was already set.
#[no_mangle]
pub extern "C" fn tandem_init_logging() -> i32 {
    *LOGGING.get_or_init(|| {
        guard_value("init_logging", 1, || {
            Ok(match init_global_tracing(&TracingConfig::from_env()) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("tandem: {e}");
                    1
                }
            })
        })
    })
}
