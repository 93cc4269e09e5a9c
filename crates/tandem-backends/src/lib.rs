//! Device backends for the tandem runtime
//!
//! This crate provides:
//! - **Backend trait**: device selection, queues, memory, host-visible
//!   shared regions, tick counter and launches
//! - **SimBackend**: a device simulated on host threads, running device
//!   programs written in Rust
//! - **HwBackend** (feature `hardware`): the vendor runtime bound at runtime
//!
//! # Architecture
//!
//! ```text
//!            host orchestrator (tandem-runtime)
//!                        │
//!                        ▼
//!               ┌─────────────────┐
//!               │  Backend trait  │
//!               └────────┬────────┘
//!            ┌───────────┴───────────┐
//!            ▼                       ▼
//!     ┌─────────────┐        ┌──────────────┐
//!     │ SimBackend  │        │  HwBackend   │
//!     │ host threads│        │vendor runtime│
//!     └─────────────┘        └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use tandem_backends::{Backend, QueueKind, SimBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SimBackend::new();
//! backend.set_device(0)?;
//!
//! let addr = backend.malloc(64)?;
//! backend.copy_to_device(addr, &[1, 2, 3, 4])?;
//! let mut out = [0u8; 4];
//! backend.copy_from_device(&mut out, addr)?;
//! assert_eq!(out, [1, 2, 3, 4]);
//!
//! let queue = backend.create_queue(QueueKind::Control)?;
//! backend.synchronize(queue)?;
//! backend.destroy_queue(queue)?;
//! backend.free(addr)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod shared;

pub use backend::{Backend, DeviceAddr, EntryKind, LaunchRequest, QueueHandle, QueueKind};
pub use backends::{DeviceContext, DeviceKernel, DeviceProgram, ProgramRegistry, SimBackend, SimConfig};
pub use error::{BackendError, Result};
pub use shared::SharedWords;

#[cfg(feature = "hardware")]
pub use backends::{HwBackend, HwConfig};
