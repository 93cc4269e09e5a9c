//! Hardware backend driving a real accelerator through the vendor runtime
//!
//! The vendor runtime and HAL are bound at runtime with `libloading`, so the
//! crate builds on machines without the vendor toolkit. Control entries go
//! through the control-core launch API, compute entries through a registered
//! device binary. Host-visible regions are page-aligned host allocations
//! registered with the device.

mod api;

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use self::api::{ControlArgs, RtStream, VendorApi, MEMCPY_DEVICE_TO_HOST, MEMCPY_HOST_TO_DEVICE};
use crate::backend::{Backend, DeviceAddr, EntryKind, LaunchRequest, QueueHandle, QueueKind};
use crate::error::{BackendError, Result};
use crate::shared::SharedWords;

const PAGE_SIZE: usize = 4096;
const CONTROL_LIBRARY_NAME: &str = "libtandem_control.so";

/// Where to find the vendor libraries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwConfig {
    pub runtime_library: String,
    pub hal_library: String,
    /// Frequency of the device system counter in Hz
    pub tick_frequency: u64,
}

impl Default for HwConfig {
    fn default() -> Self {
        Self {
            runtime_library: "libruntime.so".to_string(),
            hal_library: "libascend_hal.so".to_string(),
            tick_frequency: 50_000_000,
        }
    }
}

struct Stream {
    kind: QueueKind,
    raw: RtStream,
}

// SAFETY: vendor streams may be used from any host thread.
unsafe impl Send for Stream {}

struct RegisteredBinary {
    // Registered functions are keyed by a unique host address.
    stub: Box<u64>,
}

/// Page-aligned host pages registered with the device
struct HostPages {
    ptr: NonNull<AtomicU64>,
    layout: Layout,
}

// SAFETY: the pages are only accessed through atomics.
unsafe impl Send for HostPages {}
unsafe impl Sync for HostPages {}

impl HostPages {
    fn zeroed(bytes: usize) -> Result<Self> {
        let size = bytes.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|e| BackendError::other(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<AtomicU64>()).ok_or(BackendError::OutOfMemory {
            requested: size,
            available: 0,
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), self.layout) }
    }
}

#[derive(Default)]
struct HwState {
    device: Option<i32>,
    streams: HashMap<u64, Stream>,
    next_queue: u64,
    shared: HashMap<u64, Arc<HostPages>>,
    binaries: HashMap<u64, RegisteredBinary>,
}

/// Backend bound to the vendor runtime of a real device
pub struct HwBackend {
    api: VendorApi,
    config: HwConfig,
    origin: Instant,
    state: Mutex<HwState>,
}

impl HwBackend {
    #[tracing::instrument(skip_all, fields(runtime = %config.runtime_library))]
    pub fn new(config: HwConfig) -> Result<Self> {
        let api = VendorApi::load(&config.runtime_library, &config.hal_library)?;
        tracing::info!("vendor_runtime_loaded");
        Ok(Self {
            api,
            config,
            origin: Instant::now(),
            state: Mutex::new(HwState::default()),
        })
    }

    fn require_device(&self) -> Result<i32> {
        self.state.lock().device.ok_or(BackendError::DeviceNotSet)
    }

    fn stream(&self, queue: QueueHandle) -> Result<(QueueKind, RtStream)> {
        self.state
            .lock()
            .streams
            .get(&queue.id())
            .map(|s| (s.kind, s.raw))
            .ok_or(BackendError::InvalidQueue(queue.id()))
    }

    fn launch_control(&self, stream: RtStream, request: &LaunchRequest) -> Result<()> {
        let symbol = CString::new(request.entry.symbol()).map_err(|e| BackendError::launch_failed(e.to_string()))?;
        let mut buffer = request.args.get().to_le_bytes().to_vec();
        let so_name_offset = buffer.len() as u32;
        buffer.extend_from_slice(CONTROL_LIBRARY_NAME.as_bytes());
        buffer.push(0);
        let kernel_name_offset = buffer.len() as u32;
        buffer.extend_from_slice(symbol.as_bytes_with_nul());

        let mut args = ControlArgs {
            args: buffer.as_mut_ptr().cast(),
            host_input_info: std::ptr::null_mut(),
            kernel_offset_info: std::ptr::null_mut(),
            args_size: buffer.len() as u32,
            host_input_info_num: 0,
            kernel_offset_info_num: 0,
            so_name_offset,
            kernel_name_offset,
            no_h2d_copy: false,
            reserved: [0; 3],
        };
        self.api.launch_control(&symbol, request.instances, &mut args, stream)
    }

    fn launch_compute(&self, stream: RtStream, request: &LaunchRequest) -> Result<()> {
        let stub = {
            let mut state = self.state.lock();
            if !state.binaries.contains_key(&request.image.get()) {
                let mut image = vec![0u8; request.image_len];
                self.api.memcpy(
                    image.as_mut_ptr().cast(),
                    request.image.get() as *const c_void,
                    image.len(),
                    MEMCPY_DEVICE_TO_HOST,
                )?;
                let handle = self.api.register_binary(&image)?;
                let binary = RegisteredBinary {
                    stub: Box::new(request.image.get()),
                };
                let symbol =
                    CString::new(EntryKind::Compute.symbol()).map_err(|e| BackendError::launch_failed(e.to_string()))?;
                self.api
                    .register_function(handle, (&*binary.stub as *const u64).cast(), &symbol)?;
                tracing::debug!(image = %request.image, "compute_binary_registered");
                state.binaries.insert(request.image.get(), binary);
            }
            let stub = state
                .binaries
                .get(&request.image.get())
                .map(|b| (&*b.stub as *const u64).cast::<c_void>());
            stub.ok_or(BackendError::UnknownImage { len: request.image_len })?
        };
        let mut args = [request.args.get()];
        self.api.launch_compute(stub, request.instances, &mut args, stream)
    }
}

impl Backend for HwBackend {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn set_device(&self, device_id: i32) -> Result<()> {
        self.api
            .set_device(device_id)
            .map_err(|e| BackendError::DeviceUnavailable {
                device_id,
                reason: e.to_string(),
            })?;
        self.state.lock().device = Some(device_id);
        Ok(())
    }

    fn create_queue(&self, kind: QueueKind) -> Result<QueueHandle> {
        self.require_device()?;
        let raw = self.api.stream_create()?;
        let mut state = self.state.lock();
        state.next_queue += 1;
        let handle = QueueHandle::new(state.next_queue);
        state.streams.insert(handle.id(), Stream { kind, raw });
        Ok(handle)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()> {
        let stream = self
            .state
            .lock()
            .streams
            .remove(&queue.id())
            .ok_or(BackendError::InvalidQueue(queue.id()))?;
        let synced = self.api.stream_synchronize(stream.raw);
        self.api.stream_destroy(stream.raw)?;
        synced
    }

    fn malloc(&self, bytes: usize) -> Result<DeviceAddr> {
        if bytes == 0 {
            return Err(BackendError::InvalidSize(bytes));
        }
        self.require_device()?;
        self.api.malloc(bytes).map(DeviceAddr::new).map_err(|e| match e {
            BackendError::Driver { .. } => BackendError::OutOfMemory {
                requested: bytes,
                available: 0,
            },
            other => other,
        })
    }

    fn free(&self, addr: DeviceAddr) -> Result<()> {
        let (region, device) = {
            let mut state = self.state.lock();
            (state.shared.remove(&addr.get()), state.device)
        };
        match region {
            Some(pages) => self.api.host_unregister(pages.ptr.as_ptr().cast(), device.unwrap_or(0)),
            None => self.api.free(addr.get()),
        }
    }

    fn copy_to_device(&self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.api.memcpy(
            dst.get() as *mut c_void,
            src.as_ptr().cast(),
            src.len(),
            MEMCPY_HOST_TO_DEVICE,
        )
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        self.api.memcpy(
            dst.as_mut_ptr().cast(),
            src.get() as *const c_void,
            dst.len(),
            MEMCPY_DEVICE_TO_HOST,
        )
    }

    fn alloc_shared(&self, bytes: usize) -> Result<(DeviceAddr, SharedWords)> {
        let device = self.require_device()?;
        let pages = Arc::new(HostPages::zeroed(bytes)?);
        let device_addr = self.api.host_register(pages.ptr.as_ptr().cast(), pages.layout.size(), device)?;
        self.state.lock().shared.insert(device_addr, Arc::clone(&pages));
        let ptr = pages.ptr;
        // SAFETY: the pages are zeroed, page aligned and kept alive by the Arc.
        let words = unsafe { SharedWords::from_raw_parts(ptr, bytes / 8, pages) };
        Ok((DeviceAddr::new(device_addr), words))
    }

    fn device_ticks(&self) -> u64 {
        let nanos = self.origin.elapsed().as_nanos();
        (nanos * self.config.tick_frequency as u128 / 1_000_000_000) as u64
    }

    fn tick_frequency(&self) -> u64 {
        self.config.tick_frequency
    }

    fn dispatch(&self, queue: QueueHandle, request: &LaunchRequest) -> Result<()> {
        let (kind, stream) = self.stream(queue)?;
        if kind != request.entry.queue_kind() {
            return Err(BackendError::launch_failed(format!("{} cannot run on a {kind} queue", request.entry)));
        }
        let outcome = match request.entry {
            EntryKind::ControlInit | EntryKind::ControlMain => self.launch_control(stream, request),
            EntryKind::Compute => self.launch_compute(stream, request),
        };
        outcome.map_err(|e| BackendError::launch_failed(format!("{}: {e}", request.entry)))
    }

    fn synchronize(&self, queue: QueueHandle) -> Result<()> {
        let (_, stream) = self.stream(queue)?;
        self.api
            .stream_synchronize(stream)
            .map_err(|e| BackendError::execution_failed(e.to_string()))
    }
}

impl Drop for HwBackend {
    fn drop(&mut self) {
        let state = std::mem::take(&mut *self.state.lock());
        for (_, stream) in state.streams {
            let _ = self.api.stream_destroy(stream.raw);
        }
        if let Some(device) = state.device {
            for (_, pages) in state.shared {
                let _ = self.api.host_unregister(pages.ptr.as_ptr().cast(), device);
            }
            if let Err(e) = self.api.reset_device(device) {
                tracing::warn!(device, error = %e, "device_reset_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_runtime_library_is_reported() {
        let config = HwConfig {
            runtime_library: "/nonexistent/libtandem-missing-runtime.so".to_string(),
            ..HwConfig::default()
        };
        match HwBackend::new(config) {
            Ok(_) => panic!("loaded a library that does not exist"),
            Err(e) => {
                assert!(matches!(e, BackendError::Library(_)));
                assert!(e.to_string().contains("libtandem-missing-runtime.so"));
            }
        }
    }
}
