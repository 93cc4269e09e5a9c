//! Simulated device backend
//!
//! Runs device entry points as Rust code on host threads. Device memory is a
//! private address space of atomic words; each queue is a host thread that
//! executes launches in order, and each launch fans out into one scoped
//! thread per instance.

mod clock;
mod memory;
mod program;
mod queue;

pub use program::{DeviceContext, DeviceKernel, DeviceProgram, ProgramRegistry};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, DeviceAddr, LaunchRequest, QueueHandle, QueueKind};
use crate::error::{BackendError, Result};
use crate::shared::SharedWords;
use clock::SimClock;
use memory::SimMemory;
use queue::SimQueue;

/// Shape of the simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Device memory capacity in bytes
    pub memory_capacity: usize,
    /// Tick counter frequency in Hz
    pub tick_frequency: u64,
    /// Number of selectable devices
    pub device_count: i32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1 << 30,
            tick_frequency: 50_000_000,
            device_count: 16,
        }
    }
}

/// Backend that simulates a device on host threads
///
/// Cloning yields another handle to the same simulated device.
#[derive(Clone)]
pub struct SimBackend {
    inner: Arc<SimInner>,
}

struct SimInner {
    config: SimConfig,
    device: Mutex<Option<i32>>,
    memory: Arc<SimMemory>,
    registry: Arc<ProgramRegistry>,
    clock: Arc<SimClock>,
    queues: Mutex<HashMap<u64, Arc<SimQueue>>>,
    next_queue: AtomicU64,
}

impl SimBackend {
    /// Create a simulated device with default shape
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    #[tracing::instrument(skip_all, fields(memory_capacity = config.memory_capacity))]
    pub fn with_config(config: SimConfig) -> Self {
        tracing::debug!(
            tick_frequency = config.tick_frequency,
            device_count = config.device_count,
            "sim_backend_created"
        );
        Self {
            inner: Arc::new(SimInner {
                memory: Arc::new(SimMemory::new(config.memory_capacity)),
                registry: Arc::new(ProgramRegistry::default()),
                clock: Arc::new(SimClock::new(config.tick_frequency)),
                device: Mutex::new(None),
                queues: Mutex::new(HashMap::new()),
                next_queue: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.inner.config
    }

    /// Bind a device program to a launch image
    pub fn register_program(&self, image: &[u8], program: Arc<dyn DeviceProgram>) {
        self.inner.registry.register_program(image, program);
    }

    /// Bind a compute kernel to a kernel binary image
    pub fn register_kernel(&self, image: &[u8], kernel: Arc<dyn DeviceKernel>) {
        self.inner.registry.register_kernel(image, kernel);
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.inner.registry
    }

    /// Bytes of device memory currently allocated
    pub fn memory_in_use(&self) -> usize {
        self.inner.memory.in_use()
    }

    /// Number of live device allocations
    pub fn live_allocations(&self) -> usize {
        self.inner.memory.live_allocations()
    }

    /// Selected device, if any
    pub fn current_device(&self) -> Option<i32> {
        *self.inner.device.lock()
    }

    fn require_device(&self) -> Result<i32> {
        self.current_device().ok_or(BackendError::DeviceNotSet)
    }

    fn queue(&self, handle: QueueHandle) -> Result<Arc<SimQueue>> {
        self.inner
            .queues
            .lock()
            .get(&handle.id())
            .cloned()
            .ok_or(BackendError::InvalidQueue(handle.id()))
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn set_device(&self, device_id: i32) -> Result<()> {
        if device_id < 0 || device_id >= self.inner.config.device_count {
            return Err(BackendError::DeviceUnavailable {
                device_id,
                reason: format!("simulator exposes {} devices", self.inner.config.device_count),
            });
        }
        *self.inner.device.lock() = Some(device_id);
        tracing::debug!(device_id, "sim_device_selected");
        Ok(())
    }

    fn create_queue(&self, kind: QueueKind) -> Result<QueueHandle> {
        self.require_device()?;
        let handle = QueueHandle::new(self.inner.next_queue.fetch_add(1, Ordering::Relaxed));
        let queue = SimQueue::spawn(handle, kind)?;
        self.inner.queues.lock().insert(handle.id(), Arc::new(queue));
        tracing::debug!(queue = %handle, kind = %kind, "sim_queue_created");
        Ok(handle)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()> {
        let removed = self
            .inner
            .queues
            .lock()
            .remove(&queue.id())
            .ok_or(BackendError::InvalidQueue(queue.id()))?;
        let outcome = removed.synchronize();
        drop(removed);
        tracing::debug!(queue = %queue, "sim_queue_destroyed");
        outcome
    }

    fn malloc(&self, bytes: usize) -> Result<DeviceAddr> {
        self.require_device()?;
        self.inner.memory.allocate(bytes)
    }

    fn free(&self, addr: DeviceAddr) -> Result<()> {
        self.inner.memory.free(addr)
    }

    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.inner.memory.write(dst, src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        self.inner.memory.read(dst, src)
    }

    fn alloc_shared(&self, bytes: usize) -> Result<(DeviceAddr, SharedWords)> {
        self.require_device()?;
        let addr = self.inner.memory.allocate(bytes)?;
        match self.inner.memory.map_shared(addr, bytes) {
            Ok(words) => Ok((addr, words)),
            Err(e) => {
                let _ = self.inner.memory.free(addr);
                Err(e)
            }
        }
    }

    fn device_ticks(&self) -> u64 {
        self.inner.clock.ticks()
    }

    fn tick_frequency(&self) -> u64 {
        self.inner.clock.frequency()
    }

    fn dispatch(&self, queue: QueueHandle, request: &LaunchRequest) -> Result<()> {
        let target = self.queue(queue)?;
        if target.kind() != request.entry.queue_kind() {
            return Err(BackendError::launch_failed(format!(
                "{} cannot run on a {} queue",
                request.entry,
                target.kind()
            )));
        }
        if request.instances == 0 {
            return Err(BackendError::launch_failed(format!("{} launched with zero instances", request.entry)));
        }

        let mut image = vec![0u8; request.image_len];
        self.inner
            .memory
            .read(&mut image, request.image)
            .map_err(|e| BackendError::launch_failed(format!("unreadable image for {}: {e}", request.entry)))?;
        let program = self
            .inner
            .registry
            .program(&image)
            .ok_or(BackendError::UnknownImage { len: image.len() })?;

        let memory = Arc::clone(&self.inner.memory);
        let registry = Arc::clone(&self.inner.registry);
        let clock = Arc::clone(&self.inner.clock);
        let request = *request;
        tracing::debug!(queue = %queue, entry = %request.entry, instances = request.instances, "sim_dispatch");

        target.submit(Box::new(move || {
            run_instances(&memory, &registry, &clock, program.as_ref(), request)
        }))
    }

    fn synchronize(&self, queue: QueueHandle) -> Result<()> {
        self.queue(queue)?.synchronize()
    }
}

fn run_instances(
    memory: &SimMemory,
    registry: &ProgramRegistry,
    clock: &SimClock,
    program: &dyn DeviceProgram,
    request: LaunchRequest,
) -> Result<()> {
    let context = |instance: u32| DeviceContext {
        memory,
        registry,
        clock,
        entry: request.entry,
        args: request.args,
        instance,
        instances: request.instances,
    };

    if request.instances == 1 {
        return program.run(&context(0));
    }

    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(request.instances as usize);
        let mut results = Vec::new();
        for instance in 0..request.instances {
            let ctx = context(instance);
            let spawned = std::thread::Builder::new()
                .name(format!("tandem-sim-{}-{instance}", request.entry))
                .spawn_scoped(scope, move || program.run(&ctx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => results.push(Err(BackendError::launch_failed(format!(
                    "failed to start instance {instance}: {e}"
                )))),
            }
        }
        for handle in handles {
            results.push(
                handle
                    .join()
                    .unwrap_or_else(|_| Err(BackendError::execution_failed("device instance panicked"))),
            );
        }
        results
    });

    results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
}
