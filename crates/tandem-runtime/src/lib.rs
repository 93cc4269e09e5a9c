//! # Tandem Runtime
//!
//! Host-side orchestrator for accelerators that pair control cores with
//! compute cores. A host program describes work as a task graph of opaque
//! kernels; the runtime stages it in device memory, launches the control
//! and compute images, and collects per-task timing from the device.
//!
//! ## Architecture
//!
//! ```text
//!   Session::init ──► GraphBuilder ──► WorkDescriptor
//!                                          │
//!                                          ▼
//!   Orchestrator::run ── device/binaries ── descriptor ── launches
//!        │                                                  │
//!        ├── DeviceMemoryAllocator   KernelBinaryCache      │
//!        ├── HandshakeBuffer (one slot per compute core) ◄──┤
//!        └── TelemetryCollector ◄── TelemetryBuffer ◄───────┘
//! ```
//!
//! - **Orchestrator**: staged lifecycle (device, binaries, ready, running,
//!   idle) over any [`tandem_backends::Backend`]
//! - **Session**: one built work descriptor plus the device memory it owns
//! - **Telemetry**: double-buffered record regions drained while the device
//!   runs, exported as a Chrome trace
//! - **device**: the control and compute programs run by the simulated device
//! - **global**: the process-wide instance behind the C API
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_backends::{DeviceContext, SimConfig};
//! use tandem_runtime::{
//!     device, CoreKind, LaunchParams, Orchestrator, RuntimeConfig, Session, SessionInit, StaticEntries,
//! };
//!
//! fn noop(_: &DeviceContext<'_>, _: &[u64]) -> tandem_backends::Result<()> {
//!     Ok(())
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = device::simulated_backend(SimConfig::default());
//! sim.register_kernel(b"noop", Arc::new(noop));
//!
//! let entries = StaticEntries::new();
//! entries.register(b"app", "main", |graph, _args| {
//!     graph.add_task(1, CoreKind::Matrix, &[]);
//!     Ok(())
//! });
//!
//! let mut orch = Orchestrator::new(Arc::new(sim), RuntimeConfig::default());
//! orch.ensure_device_set(0)?;
//! let init = SessionInit { image: b"app", entry: "main", args: Vec::new(), kernels: vec![(1, &b"noop"[..])] };
//! let session = Session::init(&mut orch, init, &entries)?;
//!
//! let report = session.launch(&mut orch, LaunchParams::new(1, 0), device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
//! assert_eq!(report.completed, 1);
//! session.finalize(&mut orch)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod descriptor;
pub mod device;
pub mod entry;
pub mod error;
pub mod global;
pub mod handshake;
pub mod kernel_cache;
pub mod memory;
pub mod orchestrator;
pub mod session;
pub mod telemetry;
pub mod work;

pub use config::{CacheRebind, RuntimeConfig};
pub use entry::{EntryFn, EntryResolver, GraphBuilder, HostApi, StaticEntries, TensorPair, TENSOR_DESCRIPTOR_BYTES};
pub use error::{Result, RuntimeError, STATUS_OK, STATUS_PANIC};
pub use handshake::{CoreKind, HandshakeLayout, SlotSnapshot, SlotState};
pub use kernel_cache::KernelBinaryCache;
pub use memory::DeviceMemoryAllocator;
pub use orchestrator::{LaunchParams, LifecycleState, Orchestrator, RunReport};
pub use session::{Session, SessionId, SessionInit};
pub use telemetry::{PerformanceRecord, PipeTag, PollOutcome, TRACE_FILE_NAME};
pub use work::{ArgTag, ArgValue, Task, TaskGraph, WorkDescriptor};

/// Version of the runtime crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
