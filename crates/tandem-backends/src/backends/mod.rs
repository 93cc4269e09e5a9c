//! Backend implementations

pub mod sim;

#[cfg(feature = "hardware")]
pub mod hw;

pub use sim::{DeviceContext, DeviceKernel, DeviceProgram, ProgramRegistry, SimBackend, SimConfig};

#[cfg(feature = "hardware")]
pub use hw::{HwBackend, HwConfig};
