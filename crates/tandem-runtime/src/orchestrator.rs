//! Execution orchestrator
//!
//! Owns the device session (selected device plus its two queues), the
//! memory allocator, the kernel binary cache, the handshake region and the
//! telemetry region, and drives one run through its stages:
//!
//! ```text
//! ensure device  ->  ensure binaries  ->  zero handshake/telemetry
//!   ->  stage descriptor  ->  control init  ->  control main
//!   ->  compute  ->  drain telemetry  ->  synchronize  ->  free descriptor
//! ```
//!
//! Session-level resources survive between runs. [`Orchestrator::clean_cache`]
//! drops binaries and kernel bindings but keeps the device;
//! [`Orchestrator::finalize`] releases everything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tandem_backends::{Backend, DeviceAddr, EntryKind, LaunchRequest, QueueHandle, QueueKind};
use tandem_tracing::{perf_event, perf_span};
use tandem_tracing::performance::record_launch;

use crate::config::RuntimeConfig;
use crate::descriptor::{
    self, DescriptorView, LaunchTargets, DEVICE_ARGS_DESCRIPTOR, DEVICE_ARGS_PAYLOAD_ADDR, DEVICE_ARGS_PAYLOAD_LEN,
    DEVICE_ARGS_WORDS,
};
use crate::entry::HostApi;
use crate::error::{Result, RuntimeError};
use crate::handshake::{HandshakeBuffer, HandshakeLayout, SlotSnapshot, SlotState};
use crate::kernel_cache::KernelBinaryCache;
use crate::memory::DeviceMemoryAllocator;
use crate::session::SessionId;
use crate::telemetry::{self, PerformanceRecord, PollOutcome, TelemetryBuffer, TelemetryCollector};
use crate::work::WorkDescriptor;

/// Where the orchestrator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Uninitialized,
    DeviceSet,
    BinariesLoaded,
    Ready,
    Running,
    /// Between runs with binaries and buffers cached
    Idle,
    Finalized,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::DeviceSet => "device-set",
            LifecycleState::BinariesLoaded => "binaries-loaded",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Idle => "idle",
            LifecycleState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Shape of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchParams {
    pub block_dim: u32,
    pub device_id: i32,
    /// Control-core main instances
    pub worker_count: u32,
    /// Collect telemetry for this run
    pub profiling: bool,
}

impl LaunchParams {
    pub fn new(block_dim: u32, device_id: i32) -> Self {
        Self {
            block_dim,
            device_id,
            worker_count: 1,
            profiling: false,
        }
    }

    pub fn with_worker_count(mut self, worker_count: u32) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub tasks: usize,
    pub completed: usize,
    pub records: usize,
    pub dropped: u64,
    pub telemetry_timed_out: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
struct DeviceSession {
    device_id: i32,
    control_queue: QueueHandle,
    compute_queue: QueueHandle,
}

#[derive(Debug, Clone, Copy)]
struct LoadedImages {
    control: DeviceAddr,
    control_len: usize,
    device_args: DeviceAddr,
    compute: DeviceAddr,
    compute_len: usize,
}

struct StagedDescriptor {
    addr: DeviceAddr,
    view: DescriptorView,
}

/// Regions a run attempt allocated itself rather than reused
#[derive(Debug, Clone, Copy, Default)]
struct FreshRegions {
    images: bool,
    handshake: bool,
    telemetry: bool,
}

/// Host-side driver of one accelerator
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    config: RuntimeConfig,
    state: LifecycleState,
    device: Option<DeviceSession>,
    memory: DeviceMemoryAllocator,
    kernels: KernelBinaryCache,
    images: Option<LoadedImages>,
    handshake: Option<HandshakeBuffer>,
    telemetry: Option<TelemetryBuffer>,
    collector: TelemetryCollector,
    last_session: Option<SessionId>,
    runs: u64,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn Backend>, config: RuntimeConfig) -> Self {
        tracing::debug!(backend = backend.name(), "orchestrator_created");
        Self {
            memory: DeviceMemoryAllocator::new(Arc::clone(&backend)),
            kernels: KernelBinaryCache::new(config.cache_rebind),
            backend,
            config,
            state: LifecycleState::Uninitialized,
            device: None,
            images: None,
            handshake: None,
            telemetry: None,
            collector: TelemetryCollector::new(),
            last_session: None,
            runs: 0,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn device_id(&self) -> Option<i32> {
        self.device.map(|d| d.device_id)
    }

    pub fn binaries_loaded(&self) -> bool {
        self.images.is_some()
    }

    pub fn memory(&self) -> &DeviceMemoryAllocator {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut DeviceMemoryAllocator {
        &mut self.memory
    }

    pub fn kernels(&self) -> &KernelBinaryCache {
        &self.kernels
    }

    pub fn last_session(&self) -> Option<SessionId> {
        self.last_session
    }

    /// Completed runs since the orchestrator was created
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Records collected by the most recent profiled run
    pub fn records(&self) -> &[PerformanceRecord] {
        self.collector.records()
    }

    pub(crate) fn bind_session(&mut self, session: SessionId) {
        self.last_session = Some(session);
    }

    /// Fail with an invalid-state error unless a device is selected
    pub(crate) fn check_device_set(&self, operation: &'static str) -> Result<()> {
        self.require_device(operation).map(|_| ())
    }

    fn require_device(&self, operation: &'static str) -> Result<DeviceSession> {
        self.device.ok_or(RuntimeError::InvalidState {
            operation,
            state: self.state,
        })
    }

    /// Select the device and create both queues; later calls are no-ops
    #[tracing::instrument(skip(self))]
    pub fn ensure_device_set(&mut self, device_id: i32) -> Result<()> {
        if !(0..=self.config.max_device_id).contains(&device_id) {
            return Err(RuntimeError::invalid_argument(format!(
                "device id {device_id} outside 0..={}",
                self.config.max_device_id
            )));
        }
        if let Some(device) = self.device {
            if device.device_id != device_id {
                tracing::warn!(
                    active = device.device_id,
                    requested = device_id,
                    "device_already_selected"
                );
            }
            return Ok(());
        }

        let unavailable = |e: tandem_backends::BackendError| RuntimeError::DeviceUnavailable {
            device_id,
            reason: e.to_string(),
        };
        self.backend.set_device(device_id).map_err(unavailable)?;
        let control_queue = self.backend.create_queue(QueueKind::Control).map_err(unavailable)?;
        let compute_queue = match self.backend.create_queue(QueueKind::Compute) {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(destroy) = self.backend.destroy_queue(control_queue) {
                    tracing::warn!(queue = %control_queue, error = %destroy, "queue_destroy_failed");
                }
                return Err(unavailable(e));
            }
        };

        self.device = Some(DeviceSession {
            device_id,
            control_queue,
            compute_queue,
        });
        self.state = LifecycleState::DeviceSet;
        tracing::info!(
            device_id,
            backend = self.backend.name(),
            control_queue = %control_queue,
            compute_queue = %compute_queue,
            "device_set"
        );
        Ok(())
    }

    /// Upload the control and compute images once per binaries epoch
    ///
    /// The control image also gets its fixed argument block, whose payload
    /// words point back at the uploaded image.
    #[tracing::instrument(skip_all, fields(control_bytes = control.len(), compute_bytes = compute.len()))]
    pub fn ensure_binaries_loaded(&mut self, control: &[u8], compute: &[u8]) -> Result<()> {
        self.require_device("load binaries")?;
        if self.images.is_some() {
            return Ok(());
        }
        if control.is_empty() || compute.is_empty() {
            return Err(RuntimeError::invalid_argument("control and compute images must be non-empty"));
        }

        let control_addr = self.memory.upload(control)?;

        let mut args = [0u64; DEVICE_ARGS_WORDS];
        args[DEVICE_ARGS_PAYLOAD_ADDR] = control_addr.get();
        args[DEVICE_ARGS_PAYLOAD_LEN] = control.len() as u64;
        let device_args = match self.memory.upload(bytemuck::cast_slice(&args)) {
            Ok(addr) => addr,
            Err(e) => {
                self.memory.release_quietly(control_addr);
                return Err(e);
            }
        };

        let compute_addr = match self.memory.upload(compute) {
            Ok(addr) => addr,
            Err(e) => {
                self.memory.release_quietly(device_args);
                self.memory.release_quietly(control_addr);
                return Err(e);
            }
        };

        self.images = Some(LoadedImages {
            control: control_addr,
            control_len: control.len(),
            device_args,
            compute: compute_addr,
            compute_len: compute.len(),
        });
        self.state = LifecycleState::BinariesLoaded;
        tracing::info!(control = %control_addr, compute = %compute_addr, "binaries_loaded");
        Ok(())
    }

    /// Staged initialization: device first, then binaries
    pub fn ensure_device_initialized(&mut self, device_id: i32, control: &[u8], compute: &[u8]) -> Result<()> {
        self.ensure_device_set(device_id)?;
        self.ensure_binaries_loaded(control, compute)
    }

    /// Bind a kernel binary to `func_id`; requires a selected device
    pub fn upload_kernel_binary(&mut self, func_id: u32, binary: &[u8]) -> Result<DeviceAddr> {
        self.require_device("upload a kernel binary")?;
        self.kernels.upload(&mut self.memory, func_id, binary)
    }

    fn validate(&self, work: &WorkDescriptor, params: &LaunchParams) -> Result<HandshakeLayout> {
        if params.block_dim == 0 || params.block_dim > self.config.max_block_dim {
            return Err(RuntimeError::invalid_argument(format!(
                "block_dim {} outside 1..={}",
                params.block_dim, self.config.max_block_dim
            )));
        }
        let layout = HandshakeLayout::new(params.block_dim, self.config.cores_per_block);
        if params.worker_count == 0 || params.worker_count as usize > layout.slot_count() {
            return Err(RuntimeError::invalid_argument(format!(
                "worker_count {} outside 1..={}",
                params.worker_count,
                layout.slot_count()
            )));
        }
        if work.image().is_empty() {
            return Err(RuntimeError::invalid_argument("work descriptor has no control image"));
        }
        Ok(layout)
    }

    /// Execute `work` and wait for it to finish
    #[tracing::instrument(
        skip(self, work, control, compute),
        fields(
            tasks = work.task_count(),
            block_dim = params.block_dim,
            device_id = params.device_id,
            workers = params.worker_count
        )
    )]
    pub fn run(&mut self, work: &WorkDescriptor, params: &LaunchParams, control: &[u8], compute: &[u8]) -> Result<RunReport> {
        let _span = perf_span!("run", tasks = work.task_count());
        let start = Instant::now();
        let layout = self.validate(work, params)?;

        let fresh_images = self.images.is_none();
        self.ensure_device_initialized(params.device_id, control, compute)?;
        let device = self.require_device("run")?;
        let images = self.images.ok_or(RuntimeError::InvalidState {
            operation: "run",
            state: self.state,
        })?;
        let profiling = params.profiling || self.config.profiling;

        let mut fresh = FreshRegions {
            images: fresh_images,
            ..FreshRegions::default()
        };
        fresh.handshake = match self.prepare_handshake(layout) {
            Ok(allocated) => allocated,
            Err(e) => {
                self.discard_fresh(fresh);
                return Err(e);
            }
        };
        fresh.telemetry = match self.prepare_telemetry(profiling, layout.slot_count()) {
            Ok(allocated) => allocated,
            Err(e) => {
                self.discard_fresh(fresh);
                return Err(e);
            }
        };

        let targets = LaunchTargets {
            handshake: self.handshake.as_ref().map_or(DeviceAddr::NULL, HandshakeBuffer::addr),
            layout,
            telemetry: if profiling { self.telemetry.as_ref().map(TelemetryBuffer::addr) } else { None },
            schedulers: params.worker_count,
        };
        let staged = match self.stage_descriptor(work, &targets, &images) {
            Ok(staged) => staged,
            Err(e) => {
                self.discard_fresh(fresh);
                return Err(e);
            }
        };
        self.state = LifecycleState::Ready;

        let outcome = self.launch(device, &images, &staged, params, layout, work.task_count(), profiling);
        let completed = staged.view.completed();

        self.memory.release_quietly(staged.addr);
        self.state = LifecycleState::Idle;

        let poll = outcome?;
        self.runs += 1;
        let report = RunReport {
            tasks: work.task_count(),
            completed,
            records: poll.collected,
            dropped: poll.dropped,
            telemetry_timed_out: poll.timed_out,
            elapsed: start.elapsed(),
        };
        tracing::info!(
            tasks = report.tasks,
            records = report.records,
            dropped = report.dropped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run_complete"
        );
        Ok(report)
    }

    /// Reuse the handshake region when the layout matches; returns whether it is new
    fn prepare_handshake(&mut self, layout: HandshakeLayout) -> Result<bool> {
        if let Some(buffer) = &self.handshake {
            if buffer.layout() == layout {
                buffer.reset();
                perf_event!("handshake_reset", slots = layout.slot_count(), bytes = layout.bytes());
                return Ok(false);
            }
        }
        if let Some(old) = self.handshake.take() {
            if let Err(e) = old.release(&mut self.memory) {
                tracing::warn!(error = %e, "handshake_release_failed");
            }
        }
        let buffer = HandshakeBuffer::allocate(&mut self.memory, layout)?;
        tracing::debug!(addr = %buffer.addr(), slots = layout.slot_count(), "handshake_allocated");
        self.handshake = Some(buffer);
        Ok(true)
    }

    fn prepare_telemetry(&mut self, profiling: bool, workers: usize) -> Result<bool> {
        if !profiling {
            return Ok(false);
        }
        self.collector.clear();
        let capacity = self.config.telemetry_capacity;
        if let Some(buffer) = &self.telemetry {
            if buffer.capacity() == capacity {
                buffer.reset(workers);
                perf_event!("telemetry_reset", capacity = capacity, workers = workers);
                return Ok(false);
            }
        }
        if let Some(old) = self.telemetry.take() {
            if let Err(e) = old.release(&mut self.memory) {
                tracing::warn!(error = %e, "telemetry_release_failed");
            }
        }
        let buffer = TelemetryBuffer::allocate(&mut self.memory, capacity, workers)?;
        tracing::debug!(addr = %buffer.addr(), capacity, "telemetry_allocated");
        self.telemetry = Some(buffer);
        Ok(true)
    }

    /// Give back regions allocated by a run that failed before launching
    fn discard_fresh(&mut self, fresh: FreshRegions) {
        tracing::debug!(
            images = fresh.images,
            handshake = fresh.handshake,
            telemetry = fresh.telemetry,
            "discarding_fresh_regions"
        );
        if fresh.images {
            self.release_images();
        }
        if fresh.handshake {
            if let Some(buffer) = self.handshake.take() {
                if let Err(e) = buffer.release(&mut self.memory) {
                    tracing::warn!(error = %e, "handshake_release_failed");
                }
            }
        }
        if fresh.telemetry {
            if let Some(buffer) = self.telemetry.take() {
                if let Err(e) = buffer.release(&mut self.memory) {
                    tracing::warn!(error = %e, "telemetry_release_failed");
                }
            }
        }
    }

    fn stage_descriptor(&mut self, work: &WorkDescriptor, targets: &LaunchTargets, images: &LoadedImages) -> Result<StagedDescriptor> {
        let _span = perf_span!("stage_descriptor", tasks = work.task_count());
        let encoded = descriptor::encode(work.graph(), &self.kernels, targets)?;
        let (addr, words) = self.memory.allocate_shared(encoded.len() * 8)?;
        let view = DescriptorView::install(words, &encoded);

        let slot = images.device_args.offset((DEVICE_ARGS_DESCRIPTOR * 8) as u64);
        if let Err(e) = self.memory.copy_to_device(slot, &addr.get().to_le_bytes()) {
            self.memory.release_quietly(addr);
            return Err(e);
        }
        tracing::debug!(addr = %addr, words = encoded.len(), "descriptor_staged");
        Ok(StagedDescriptor { addr, view })
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &mut self,
        device: DeviceSession,
        images: &LoadedImages,
        staged: &StagedDescriptor,
        params: &LaunchParams,
        layout: HandshakeLayout,
        expected: usize,
        profiling: bool,
    ) -> Result<PollOutcome> {
        let launches = [
            (
                device.control_queue,
                LaunchRequest::new(EntryKind::ControlInit, images.control, images.control_len, images.device_args, 1),
                "control init launch",
            ),
            (
                device.control_queue,
                LaunchRequest::new(
                    EntryKind::ControlMain,
                    images.control,
                    images.control_len,
                    images.device_args,
                    params.worker_count,
                ),
                "control main launch",
            ),
            (
                device.compute_queue,
                LaunchRequest::new(
                    EntryKind::Compute,
                    images.compute,
                    images.compute_len,
                    staged.addr,
                    layout.slot_count() as u32,
                ),
                "compute launch",
            ),
        ];

        self.state = LifecycleState::Running;
        for (queue, request, stage) in launches {
            let issued = Instant::now();
            if let Err(e) = self.backend.dispatch(queue, &request) {
                tracing::error!(stage, error = %e, "launch_rejected");
                staged.view.abort();
                self.drain_queues(device);
                return Err(RuntimeError::launch_failed(stage, e));
            }
            record_launch(request.entry.symbol(), request.instances, issued.elapsed().as_micros() as u64);
        }

        let poll = match (profiling, self.telemetry.as_ref()) {
            (true, Some(buffer)) => {
                let _span = perf_span!("telemetry_drain", expected = expected);
                self.collector.poll_and_collect(
                    buffer,
                    layout.slot_count(),
                    expected,
                    self.config.poll_timeout,
                    self.config.poll_interval,
                )
            }
            _ => PollOutcome::default(),
        };

        let control_sync = self.backend.synchronize(device.control_queue);
        let compute_sync = self.backend.synchronize(device.compute_queue);
        control_sync.map_err(|e| RuntimeError::launch_failed("control synchronize", e))?;
        compute_sync.map_err(|e| RuntimeError::launch_failed("compute synchronize", e))?;

        let completed = staged.view.completed();
        if staged.view.failed() || completed != expected {
            return Err(RuntimeError::launch_failed(
                "execution",
                format!("{completed} of {expected} tasks completed"),
            ));
        }
        Ok(poll)
    }

    /// Wait for issued work after a failed stage, logging what went wrong
    fn drain_queues(&self, device: DeviceSession) {
        for queue in [device.control_queue, device.compute_queue] {
            if let Err(e) = self.backend.synchronize(queue) {
                tracing::warn!(queue = %queue, error = %e, "queue_drain_failed");
            }
        }
    }

    /// Drain the telemetry region of the current run into the collector
    pub fn poll_and_collect(&mut self, num_cores: usize, expected_tasks: usize) -> Result<PollOutcome> {
        let buffer = self
            .telemetry
            .as_ref()
            .ok_or_else(|| RuntimeError::Telemetry("no telemetry region allocated".into()))?;
        Ok(self.collector.poll_and_collect(
            buffer,
            num_cores,
            expected_tasks,
            self.config.poll_timeout,
            self.config.poll_interval,
        ))
    }

    /// Write the collected records as a Chrome trace under `dir`
    pub fn export_trace(&self, dir: &Path) -> Result<PathBuf> {
        telemetry::export_trace(self.collector.records(), self.backend.tick_frequency(), dir)
    }

    /// Copy of every handshake slot from the last run
    pub fn handshake_report(&self) -> Option<Vec<SlotSnapshot>> {
        self.handshake.as_ref().map(HandshakeBuffer::snapshot)
    }

    /// Log the handshake report; returns whether every slot reached done
    pub fn print_handshake_results(&self) -> bool {
        let Some(report) = self.handshake_report() else {
            tracing::info!("no handshake region allocated");
            return false;
        };
        for slot in &report {
            tracing::info!(
                slot = slot.slot,
                core = %slot.core,
                state = ?slot.state,
                sequence = slot.sequence,
                completed_tasks = slot.completed,
                "handshake_slot"
            );
        }
        let done = report.iter().filter(|s| s.state == SlotState::Done).count();
        tracing::info!(done, slots = report.len(), "handshake_summary");
        done == report.len()
    }

    /// Release kernel binaries and images; the device and queues stay
    #[tracing::instrument(skip(self))]
    pub fn clean_cache(&mut self) {
        let kernels = self.kernels.clear(&mut self.memory);
        self.release_images();
        tracing::info!(kernels, "cache_cleaned");
    }

    /// Free the loaded images; the next run uploads them again
    fn release_images(&mut self) {
        if let Some(images) = self.images.take() {
            for addr in [images.control, images.device_args, images.compute] {
                self.memory.release_quietly(addr);
            }
        }
        if self.device.is_some() {
            self.state = LifecycleState::DeviceSet;
        }
    }

    /// Release every session resource and destroy the queues
    ///
    /// Safe to call at any point, including after a failed run and more than once.
    #[tracing::instrument(skip(self))]
    pub fn finalize(&mut self) -> Result<()> {
        if self.state == LifecycleState::Finalized && self.device.is_none() {
            return Ok(());
        }
        self.clean_cache();
        if let Some(buffer) = self.handshake.take() {
            if let Err(e) = buffer.release(&mut self.memory) {
                tracing::warn!(error = %e, "handshake_release_failed");
            }
        }
        if let Some(buffer) = self.telemetry.take() {
            if let Err(e) = buffer.release(&mut self.memory) {
                tracing::warn!(error = %e, "telemetry_release_failed");
            }
        }
        let leftovers = self.memory.release_all();
        if leftovers > 0 {
            tracing::warn!(leftovers, "released_untracked_session_memory");
        }

        let mut first_error = None;
        if let Some(device) = self.device.take() {
            for queue in [device.control_queue, device.compute_queue] {
                if let Err(e) = self.backend.destroy_queue(queue) {
                    tracing::warn!(queue = %queue, error = %e, "queue_destroy_failed");
                    first_error.get_or_insert(RuntimeError::Backend(e));
                }
            }
        }
        self.last_session = None;
        self.state = LifecycleState::Finalized;
        tracing::info!(runs = self.runs, "orchestrator_finalized");
        first_error.map_or(Ok(()), Err)
    }
}

impl HostApi for Orchestrator {
    fn device_malloc(&mut self, bytes: usize) -> Result<DeviceAddr> {
        self.require_device("allocate device memory")?;
        self.memory.allocate(bytes)
    }

    fn device_free(&mut self, addr: DeviceAddr) -> Result<()> {
        self.memory.free(addr)
    }

    fn copy_to_device(&mut self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.memory.copy_to_device(dst, src)
    }

    fn copy_from_device(&mut self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        self.memory.copy_from_device(dst, src)
    }

    fn upload_kernel_binary(&mut self, func_id: u32, binary: &[u8]) -> Result<DeviceAddr> {
        Orchestrator::upload_kernel_binary(self, func_id, binary)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.device.is_some() {
            if let Err(e) = self.finalize() {
                tracing::warn!(error = %e, "finalize_on_drop_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_backends::SimBackend;

    fn orchestrator() -> (SimBackend, Orchestrator) {
        let sim = SimBackend::new();
        let orch = Orchestrator::new(Arc::new(sim.clone()), RuntimeConfig::default());
        (sim, orch)
    }

    #[test]
    fn test_device_set_is_idempotent() {
        let (_sim, mut orch) = orchestrator();
        assert_eq!(orch.state(), LifecycleState::Uninitialized);
        orch.ensure_device_set(2).unwrap();
        assert_eq!(orch.state(), LifecycleState::DeviceSet);
        orch.ensure_device_set(3).unwrap();
        assert_eq!(orch.device_id(), Some(2));
        assert!(matches!(orch.ensure_device_set(99), Err(RuntimeError::InvalidArgument(_))));
    }

    #[test]
    fn test_upload_requires_device() {
        let (_sim, mut orch) = orchestrator();
        let err = orch.upload_kernel_binary(0, b"kernel").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
        assert_eq!(err.status(), -7);
    }

    #[test]
    fn test_binaries_load_once_and_clean_cache_resets() {
        let (sim, mut orch) = orchestrator();
        orch.ensure_device_initialized(0, b"control", b"compute").unwrap();
        assert_eq!(orch.state(), LifecycleState::BinariesLoaded);
        let live = sim.live_allocations();
        assert_eq!(live, 3);

        orch.ensure_binaries_loaded(b"control", b"compute").unwrap();
        assert_eq!(sim.live_allocations(), live);

        orch.upload_kernel_binary(4, b"kernel").unwrap();
        orch.clean_cache();
        assert_eq!(orch.state(), LifecycleState::DeviceSet);
        assert!(!orch.binaries_loaded());
        assert!(orch.kernels().is_empty());
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(orch.device_id(), Some(0));
    }

    #[test]
    fn test_device_args_point_at_control_payload() {
        let (sim, mut orch) = orchestrator();
        orch.ensure_device_initialized(0, b"control-image", b"compute").unwrap();
        let images = orch.images.unwrap();
        let mut words = [0u64; DEVICE_ARGS_WORDS];
        sim.copy_from_device(bytemuck::cast_slice_mut(&mut words), images.device_args).unwrap();
        assert_eq!(words[DEVICE_ARGS_PAYLOAD_ADDR], images.control.get());
        assert_eq!(words[DEVICE_ARGS_PAYLOAD_LEN], 13);
    }

    #[test]
    fn test_finalize_is_repeatable() {
        let (sim, mut orch) = orchestrator();
        orch.ensure_device_initialized(0, b"control", b"compute").unwrap();
        orch.finalize().unwrap();
        assert_eq!(orch.state(), LifecycleState::Finalized);
        assert_eq!(sim.live_allocations(), 0);
        orch.finalize().unwrap();
        assert!(orch.last_session().is_none());

        // A finalized orchestrator can select a device again.
        orch.ensure_device_set(1).unwrap();
        assert_eq!(orch.device_id(), Some(1));
    }
}
