//! Shared fixtures for the runtime integration tests
//!
//! Backends here wrap a simulated device with the runtime programs
//! installed and either count driver calls or inject failures.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_backends::{
    Backend, BackendError, DeviceAddr, DeviceContext, EntryKind, LaunchRequest, QueueHandle, QueueKind, SharedWords,
    SimBackend, SimConfig,
};
use tandem_runtime::{device, ArgValue, CoreKind, GraphBuilder, RuntimeConfig, StaticEntries};

pub const N: usize = 64;
pub const TILE: usize = 32;

pub const MATMUL_FUNC: u32 = 1;
pub const BIAS_FUNC: u32 = 2;
pub const NOOP_FUNC: u32 = 3;

pub const MATMUL_BINARY: &[u8] = b"kernel:matmul-tile-f32";
pub const BIAS_BINARY: &[u8] = b"kernel:bias-add-f32";
pub const NOOP_BINARY: &[u8] = b"kernel:noop";

pub const APP_IMAGE: &[u8] = b"app:matmul";
pub const MATMUL_ENTRY: &str = "matmul_64";
pub const FAN_ENTRY: &str = "fan_out";

/// Register the test kernels on `sim`
pub fn install_kernels(sim: &SimBackend) {
    sim.register_kernel(MATMUL_BINARY, Arc::new(matmul_tile));
    sim.register_kernel(BIAS_BINARY, Arc::new(bias_add));
    sim.register_kernel(NOOP_BINARY, Arc::new(noop));
}

pub fn simulated() -> SimBackend {
    let sim = device::simulated_backend(SimConfig::default());
    install_kernels(&sim);
    sim
}

/// Config with a short telemetry timeout so a broken run fails fast
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_timeout: std::time::Duration::from_secs(10),
        ..RuntimeConfig::default()
    }
}

pub fn kernels() -> Vec<(u32, &'static [u8])> {
    vec![
        (MATMUL_FUNC, MATMUL_BINARY),
        (BIAS_FUNC, BIAS_BINARY),
        (NOOP_FUNC, NOOP_BINARY),
    ]
}

/// Entries used by the tests
///
/// `matmul_64(a, b, c, bias_bits)` splits a 64x64 product into four 32x32
/// tiles on matrix cores, then adds `bias` to every element on a vector
/// core once all tiles are done. `fan_out(count)` adds `count` independent
/// no-op tasks alternating between core kinds.
pub fn entries() -> StaticEntries {
    let entries = StaticEntries::new();
    entries.register(APP_IMAGE, MATMUL_ENTRY, build_matmul);
    entries.register(APP_IMAGE, FAN_ENTRY, |graph: &mut GraphBuilder<'_>, args: &[ArgValue]| {
        let count = args.first().map_or(0, |a| a.value);
        for i in 0..count {
            let core = if i % 2 == 0 { CoreKind::Matrix } else { CoreKind::Vector };
            graph.add_task(NOOP_FUNC, core, &[i]);
        }
        Ok(())
    });
    entries
}

fn build_matmul(graph: &mut GraphBuilder<'_>, args: &[ArgValue]) -> tandem_runtime::Result<()> {
    if args.len() != 4 {
        return Err(tandem_runtime::RuntimeError::invalid_argument("matmul_64 takes a, b, c and bias"));
    }
    let (a, b, c) = (
        DeviceAddr::new(args[0].value),
        DeviceAddr::new(args[1].value),
        DeviceAddr::new(args[2].value),
    );

    let mut tiles = Vec::new();
    for row in 0..N / TILE {
        for col in 0..N / TILE {
            let a_desc = graph.tensor(a, (row * TILE * N) as u64)?;
            let b_desc = graph.tensor(b, (col * TILE) as u64)?;
            let c_desc = graph.tensor(c, (row * TILE * N + col * TILE) as u64)?;
            tiles.push(graph.add_task(MATMUL_FUNC, CoreKind::Matrix, &[a_desc.get(), b_desc.get(), c_desc.get()]));
        }
    }

    let whole = graph.tensor(c, 0)?;
    let bias = graph.add_task(BIAS_FUNC, CoreKind::Vector, &[whole.get(), args[3].value]);
    for tile in tiles {
        graph.add_successor(tile, bias)?;
    }
    Ok(())
}

fn tensor_at(ctx: &DeviceContext<'_>, descriptor: u64) -> tandem_backends::Result<(DeviceAddr, usize)> {
    let words = ctx.read_words(DeviceAddr::new(descriptor), 2)?;
    Ok((DeviceAddr::new(words[0]), words[1] as usize))
}

fn matmul_tile(ctx: &DeviceContext<'_>, args: &[u64]) -> tandem_backends::Result<()> {
    if args.len() != 3 {
        return Err(BackendError::execution_failed("matmul tile takes three tensors"));
    }
    let (a, a_off) = tensor_at(ctx, args[0])?;
    let (b, b_off) = tensor_at(ctx, args[1])?;
    let (c, c_off) = tensor_at(ctx, args[2])?;
    let lhs = ctx.read_f32s(a, N * N)?;
    let rhs = ctx.read_f32s(b, N * N)?;

    for i in 0..TILE {
        let row: Vec<f32> = (0..TILE)
            .map(|j| (0..N).map(|k| lhs[a_off + i * N + k] * rhs[b_off + k * N + j]).sum())
            .collect();
        ctx.write_f32s(c.offset(((c_off + i * N) * 4) as u64), &row)?;
    }
    Ok(())
}

fn bias_add(ctx: &DeviceContext<'_>, args: &[u64]) -> tandem_backends::Result<()> {
    if args.len() != 2 {
        return Err(BackendError::execution_failed("bias add takes a tensor and a scalar"));
    }
    let (c, offset) = tensor_at(ctx, args[0])?;
    let bias = f32::from_bits(args[1] as u32);
    let start = c.offset((offset * 4) as u64);
    let values: Vec<f32> = ctx.read_f32s(start, N * N)?.into_iter().map(|v| v + bias).collect();
    ctx.write_f32s(start, &values)
}

fn noop(_: &DeviceContext<'_>, _: &[u64]) -> tandem_backends::Result<()> {
    Ok(())
}

/// Host reference for `matmul_64`
pub fn reference_matmul(a: &[f32], b: &[f32], bias: f32) -> Vec<f32> {
    let mut out = vec![0f32; N * N];
    for i in 0..N {
        for j in 0..N {
            out[i * N + j] = (0..N).map(|k| a[i * N + k] * b[k * N + j]).sum::<f32>() + bias;
        }
    }
    out
}

/// Simulated device that counts driver calls
pub struct CountingBackend {
    inner: SimBackend,
    set_device_calls: AtomicUsize,
    queues_created: AtomicUsize,
    mallocs: AtomicUsize,
    copies: Mutex<Vec<Vec<u8>>>,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self {
            inner: simulated(),
            set_device_calls: AtomicUsize::new(0),
            queues_created: AtomicUsize::new(0),
            mallocs: AtomicUsize::new(0),
            copies: Mutex::new(Vec::new()),
        }
    }

    pub fn sim(&self) -> &SimBackend {
        &self.inner
    }

    pub fn set_device_calls(&self) -> usize {
        self.set_device_calls.load(Ordering::SeqCst)
    }

    pub fn queues_created(&self) -> usize {
        self.queues_created.load(Ordering::SeqCst)
    }

    pub fn mallocs(&self) -> usize {
        self.mallocs.load(Ordering::SeqCst)
    }

    /// Host-to-device copies whose payload equals `bytes`
    pub fn copies_of(&self, bytes: &[u8]) -> usize {
        self.copies.lock().iter().filter(|c| c.as_slice() == bytes).count()
    }
}

impl Backend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting-sim"
    }

    fn set_device(&self, device_id: i32) -> tandem_backends::Result<()> {
        self.set_device_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_device(device_id)
    }

    fn create_queue(&self, kind: QueueKind) -> tandem_backends::Result<QueueHandle> {
        self.queues_created.fetch_add(1, Ordering::SeqCst);
        self.inner.create_queue(kind)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> tandem_backends::Result<()> {
        self.inner.destroy_queue(queue)
    }

    fn malloc(&self, bytes: usize) -> tandem_backends::Result<DeviceAddr> {
        self.mallocs.fetch_add(1, Ordering::SeqCst);
        self.inner.malloc(bytes)
    }

    fn free(&self, addr: DeviceAddr) -> tandem_backends::Result<()> {
        self.inner.free(addr)
    }

    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> tandem_backends::Result<()> {
        self.copies.lock().push(src.to_vec());
        self.inner.copy_to_device(dst, src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> tandem_backends::Result<()> {
        self.inner.copy_from_device(dst, src)
    }

    fn alloc_shared(&self, bytes: usize) -> tandem_backends::Result<(DeviceAddr, SharedWords)> {
        self.inner.alloc_shared(bytes)
    }

    fn device_ticks(&self) -> u64 {
        self.inner.device_ticks()
    }

    fn tick_frequency(&self) -> u64 {
        self.inner.tick_frequency()
    }

    fn dispatch(&self, queue: QueueHandle, request: &LaunchRequest) -> tandem_backends::Result<()> {
        self.inner.dispatch(queue, request)
    }

    fn synchronize(&self, queue: QueueHandle) -> tandem_backends::Result<()> {
        self.inner.synchronize(queue)
    }
}

/// Simulated device that fails chosen calls
///
/// Allocations are numbered from 1 across `malloc` and `alloc_shared`.
pub struct FaultyBackend {
    inner: SimBackend,
    allocations: AtomicUsize,
    fail_at: AtomicUsize,
    fail_compute: AtomicBool,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self {
            inner: simulated(),
            allocations: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(0),
            fail_compute: AtomicBool::new(false),
        }
    }

    pub fn sim(&self) -> &SimBackend {
        &self.inner
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Fail the `nth` allocation from now, once
    pub fn fail_allocation_in(&self, nth: usize) {
        self.fail_at.store(self.allocations() + nth, Ordering::SeqCst);
    }

    /// Reject every compute launch while set
    pub fn fail_compute_dispatch(&self, fail: bool) {
        self.fail_compute.store(fail, Ordering::SeqCst);
    }

    fn count_allocation(&self, bytes: usize) -> tandem_backends::Result<()> {
        let current = self.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .fail_at
            .compare_exchange(current, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(BackendError::OutOfMemory {
                requested: bytes,
                available: 0,
            });
        }
        Ok(())
    }
}

impl Backend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty-sim"
    }

    fn set_device(&self, device_id: i32) -> tandem_backends::Result<()> {
        self.inner.set_device(device_id)
    }

    fn create_queue(&self, kind: QueueKind) -> tandem_backends::Result<QueueHandle> {
        self.inner.create_queue(kind)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> tandem_backends::Result<()> {
        self.inner.destroy_queue(queue)
    }

    fn malloc(&self, bytes: usize) -> tandem_backends::Result<DeviceAddr> {
        self.count_allocation(bytes)?;
        self.inner.malloc(bytes)
    }

    fn free(&self, addr: DeviceAddr) -> tandem_backends::Result<()> {
        self.inner.free(addr)
    }

    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> tandem_backends::Result<()> {
        self.inner.copy_to_device(dst, src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> tandem_backends::Result<()> {
        self.inner.copy_from_device(dst, src)
    }

    fn alloc_shared(&self, bytes: usize) -> tandem_backends::Result<(DeviceAddr, SharedWords)> {
        self.count_allocation(bytes)?;
        self.inner.alloc_shared(bytes)
    }

    fn device_ticks(&self) -> u64 {
        self.inner.device_ticks()
    }

    fn tick_frequency(&self) -> u64 {
        self.inner.tick_frequency()
    }

    fn dispatch(&self, queue: QueueHandle, request: &LaunchRequest) -> tandem_backends::Result<()> {
        if request.entry == EntryKind::Compute && self.fail_compute.load(Ordering::SeqCst) {
            return Err(BackendError::launch_failed("compute launch rejected by test"));
        }
        self.inner.dispatch(queue, request)
    }

    fn synchronize(&self, queue: QueueHandle) -> tandem_backends::Result<()> {
        self.inner.synchronize(queue)
    }
}
