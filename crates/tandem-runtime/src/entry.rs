//! Control entries and the graph builder they drive
//!
//! A session names a control image and an entry inside it. The entry is
//! resolved on the host and called once with a [`GraphBuilder`]; it stages
//! device buffers through the host API and describes the kernels to run as
//! a task graph.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tandem_backends::DeviceAddr;

use crate::error::{Result, RuntimeError};
use crate::handshake::CoreKind;
use crate::work::{ArgValue, TaskGraph};

/// Device services available to a control entry
pub trait HostApi {
    fn device_malloc(&mut self, bytes: usize) -> Result<DeviceAddr>;
    fn device_free(&mut self, addr: DeviceAddr) -> Result<()>;
    fn copy_to_device(&mut self, dst: DeviceAddr, src: &[u8]) -> Result<()>;
    fn copy_from_device(&mut self, dst: &mut [u8], src: DeviceAddr) -> Result<()>;
    /// Bind a kernel binary to `func_id`; returns its device address
    fn upload_kernel_binary(&mut self, func_id: u32, binary: &[u8]) -> Result<DeviceAddr>;
}

/// Host-side body of a control entry
pub type EntryFn = Arc<dyn Fn(&mut GraphBuilder<'_>, &[ArgValue]) -> Result<()> + Send + Sync>;

/// Finds the entry a session names
pub trait EntryResolver: Send + Sync {
    fn resolve(&self, image: &[u8], name: &str) -> Result<EntryFn>;
}

/// In-process entry table keyed by control image and entry name
#[derive(Default)]
pub struct StaticEntries {
    entries: RwLock<HashMap<(Vec<u8>, String), EntryFn>>,
}

impl StaticEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` under `name` for `image`, replacing any previous one
    pub fn register<F>(&self, image: &[u8], name: &str, entry: F)
    where
        F: Fn(&mut GraphBuilder<'_>, &[ArgValue]) -> Result<()> + Send + Sync + 'static,
    {
        self.entries
            .write()
            .insert((image.to_vec(), name.to_string()), Arc::new(entry));
        tracing::debug!(entry = name, image_bytes = image.len(), "entry_registered");
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl EntryResolver for StaticEntries {
    fn resolve(&self, image: &[u8], name: &str) -> Result<EntryFn> {
        self.entries
            .read()
            .get(&(image.to_vec(), name.to_string()))
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownEntry(name.to_string()))
    }
}

/// Host pointer, device pointer and size of a tensor the caller mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorPair {
    pub host_ptr: usize,
    pub device_ptr: DeviceAddr,
    pub size: usize,
}

/// Bytes of a staged tensor descriptor: buffer base then element offset
pub const TENSOR_DESCRIPTOR_BYTES: usize = 16;

/// What a finished builder hands back to its session
pub struct BuiltGraph {
    pub graph: TaskGraph,
    /// Device allocations the session now owns
    pub staged: Vec<DeviceAddr>,
    pub tensor_pairs: Vec<TensorPair>,
}

/// Passed to a control entry to stage memory and describe tasks
pub struct GraphBuilder<'a> {
    host: &'a mut dyn HostApi,
    graph: TaskGraph,
    staged: Vec<DeviceAddr>,
    tensor_pairs: Vec<TensorPair>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(host: &'a mut dyn HostApi) -> Self {
        Self {
            host,
            graph: TaskGraph::new(),
            staged: Vec::new(),
            tensor_pairs: Vec::new(),
        }
    }

    /// Allocate device memory owned by the session
    pub fn malloc(&mut self, bytes: usize) -> Result<DeviceAddr> {
        let addr = self.host.device_malloc(bytes)?;
        self.staged.push(addr);
        Ok(addr)
    }

    /// Release an allocation before the session ends
    pub fn free(&mut self, addr: DeviceAddr) -> Result<()> {
        self.host.device_free(addr)?;
        self.staged.retain(|a| *a != addr);
        Ok(())
    }

    pub fn copy_to_device(&mut self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
        self.host.copy_to_device(dst, src)
    }

    pub fn copy_from_device(&mut self, dst: &mut [u8], src: DeviceAddr) -> Result<()> {
        self.host.copy_from_device(dst, src)
    }

    /// Allocate and fill a buffer in one step
    pub fn upload(&mut self, bytes: &[u8]) -> Result<DeviceAddr> {
        let addr = self.malloc(bytes.len())?;
        self.host.copy_to_device(addr, bytes)?;
        Ok(addr)
    }

    pub fn upload_kernel(&mut self, func_id: u32, binary: &[u8]) -> Result<DeviceAddr> {
        self.host.upload_kernel_binary(func_id, binary)
    }

    /// Stage a `{base, elem_offset}` descriptor and return its address
    pub fn tensor(&mut self, base: DeviceAddr, elem_offset: u64) -> Result<DeviceAddr> {
        if base.is_null() {
            return Err(RuntimeError::invalid_argument("tensor descriptor over a null buffer"));
        }
        let words = [base.get(), elem_offset];
        self.upload(bytemuck::cast_slice(&words))
    }

    /// Append a task; returns its id for use in [`GraphBuilder::add_successor`]
    pub fn add_task(&mut self, func_id: u32, core: CoreKind, args: &[u64]) -> u32 {
        self.graph.add_task(func_id, core, args)
    }

    pub fn add_successor(&mut self, from: u32, to: u32) -> Result<()> {
        self.graph.add_successor(from, to)
    }

    pub fn record_tensor_pair(&mut self, host_ptr: usize, device_ptr: DeviceAddr, size: usize) {
        self.tensor_pairs.push(TensorPair {
            host_ptr,
            device_ptr,
            size,
        });
    }

    pub fn task_count(&self) -> usize {
        self.graph.len()
    }

    pub fn finish(self) -> BuiltGraph {
        BuiltGraph {
            graph: self.graph,
            staged: self.staged,
            tensor_pairs: self.tensor_pairs,
        }
    }

    /// Give back everything staged so far; used when the entry fails
    pub fn abandon(mut self) -> usize {
        let count = self.staged.len();
        for addr in self.staged {
            if let Err(e) = self.host.device_free(addr) {
                tracing::warn!(addr = %addr, error = %e, "staged_free_failed");
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        next: u64,
        live: Vec<DeviceAddr>,
        writes: Vec<(DeviceAddr, Vec<u8>)>,
    }

    impl HostApi for RecordingHost {
        fn device_malloc(&mut self, bytes: usize) -> Result<DeviceAddr> {
            if bytes == 0 {
                return Err(RuntimeError::invalid_argument("zero"));
            }
            self.next += 0x100;
            let addr = DeviceAddr::new(self.next);
            self.live.push(addr);
            Ok(addr)
        }

        fn device_free(&mut self, addr: DeviceAddr) -> Result<()> {
            self.live.retain(|a| *a != addr);
            Ok(())
        }

        fn copy_to_device(&mut self, dst: DeviceAddr, src: &[u8]) -> Result<()> {
            self.writes.push((dst, src.to_vec()));
            Ok(())
        }

        fn copy_from_device(&mut self, _dst: &mut [u8], _src: DeviceAddr) -> Result<()> {
            Ok(())
        }

        fn upload_kernel_binary(&mut self, func_id: u32, _binary: &[u8]) -> Result<DeviceAddr> {
            Ok(DeviceAddr::new(0xf000 + u64::from(func_id)))
        }
    }

    #[test]
    fn test_tensor_descriptor_layout() {
        let mut host = RecordingHost::default();
        let mut builder = GraphBuilder::new(&mut host);
        let buffer = builder.malloc(256).unwrap();
        let desc = builder.tensor(buffer, 12).unwrap();
        assert!(builder.tensor(DeviceAddr::NULL, 0).is_err());
        let built = builder.finish();
        assert_eq!(built.staged, vec![buffer, desc]);

        let (dst, bytes) = host.writes.last().unwrap();
        assert_eq!(*dst, desc);
        assert_eq!(bytes.len(), TENSOR_DESCRIPTOR_BYTES);
        assert_eq!(&bytes[..8], &buffer.get().to_le_bytes());
        assert_eq!(&bytes[8..], &12u64.to_le_bytes());
    }

    #[test]
    fn test_abandon_frees_staged() {
        let mut host = RecordingHost::default();
        let mut builder = GraphBuilder::new(&mut host);
        let kept = builder.malloc(8).unwrap();
        builder.malloc(8).unwrap();
        builder.free(kept).unwrap();
        assert_eq!(builder.abandon(), 1);
        assert!(host.live.is_empty());
    }

    #[test]
    fn test_static_entries_resolve_by_image_and_name() {
        let entries = StaticEntries::new();
        entries.register(b"image-a", "build", |builder: &mut GraphBuilder<'_>, _args: &[ArgValue]| {
            builder.add_task(0, CoreKind::Matrix, &[]);
            Ok(())
        });
        assert_eq!(entries.len(), 1);
        assert!(entries.resolve(b"image-a", "build").is_ok());
        assert!(matches!(
            entries.resolve(b"image-b", "build"),
            Err(RuntimeError::UnknownEntry(_))
        ));
        assert!(entries.resolve(b"image-a", "other").is_err());

        let mut host = RecordingHost::default();
        let mut builder = GraphBuilder::new(&mut host);
        let entry = entries.resolve(b"image-a", "build").unwrap();
        entry(&mut builder, &[]).unwrap();
        assert_eq!(builder.task_count(), 1);
    }
}
