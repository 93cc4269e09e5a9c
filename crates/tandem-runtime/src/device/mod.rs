//! Device runtime programs for the simulated backend
//!
//! On hardware the control image is a shared object run by the control
//! cores and the compute image is the worker loop run by every compute
//! core. Under simulation both are Rust programs registered against fixed
//! image bytes; a run that passes those bytes as its control and compute
//! binaries executes them.

mod scheduler;
mod worker;

use std::sync::Arc;

use tandem_backends::{DeviceAddr, DeviceContext, SimBackend, SimConfig};

use crate::descriptor::{DescriptorView, HEADER_WORDS};

pub use scheduler::ControlProgram;
pub use worker::ComputeProgram;

/// Control image understood by the simulated device
pub const CONTROL_IMAGE: &[u8] = b"tandem-sim-control-v1";
/// Compute image understood by the simulated device
pub const COMPUTE_IMAGE: &[u8] = b"tandem-sim-compute-v1";

/// Register the runtime programs on `sim`
pub fn install(sim: &SimBackend) {
    sim.register_program(CONTROL_IMAGE, Arc::new(ControlProgram));
    sim.register_program(COMPUTE_IMAGE, Arc::new(ComputeProgram));
}

/// A simulated device with the runtime programs installed
pub fn simulated_backend(config: SimConfig) -> SimBackend {
    let sim = SimBackend::with_config(config);
    install(&sim);
    sim
}

/// Map the descriptor at `addr`, sized from its own header
fn open_descriptor(ctx: &DeviceContext<'_>, addr: DeviceAddr) -> tandem_backends::Result<DescriptorView> {
    let header = ctx.shared(addr, HEADER_WORDS * 8)?;
    let total = DescriptorView::total_words(&header).max(HEADER_WORDS);
    DescriptorView::open(ctx.shared(addr, total * 8)?)
}
