//! Sessions: one built work descriptor plus the device memory it owns

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tandem_backends::DeviceAddr;

use crate::entry::{EntryResolver, GraphBuilder, TensorPair};
use crate::error::{Result, RuntimeError};
use crate::orchestrator::{LaunchParams, Orchestrator, RunReport};
use crate::work::{ArgValue, WorkDescriptor};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identity of a session, used for the orchestrator's last-session reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session{}", self.0)
    }
}

/// Inputs to [`Session::init`]
pub struct SessionInit<'a> {
    /// Control image the entry lives in
    pub image: &'a [u8],
    pub entry: &'a str,
    pub args: Vec<ArgValue>,
    /// Kernel binaries to bind before the entry runs
    pub kernels: Vec<(u32, &'a [u8])>,
}

/// A built unit of work ready to launch
pub struct Session {
    id: SessionId,
    work: WorkDescriptor,
    staged: Vec<DeviceAddr>,
    tensor_pairs: Vec<TensorPair>,
    profiling: bool,
}

impl Session {
    /// Bind kernels, resolve the control entry and build its task graph
    ///
    /// The device must already be selected. On failure nothing allocated
    /// for the session stays behind.
    #[tracing::instrument(skip_all, fields(entry = init.entry, args = init.args.len(), kernels = init.kernels.len()))]
    pub fn init(orch: &mut Orchestrator, init: SessionInit<'_>, resolver: &dyn EntryResolver) -> Result<Self> {
        if init.image.is_empty() {
            return Err(RuntimeError::invalid_argument("empty control image"));
        }
        if init.entry.is_empty() {
            return Err(RuntimeError::invalid_argument("empty entry name"));
        }
        for (index, arg) in init.args.iter().enumerate() {
            arg.validate(index)?;
        }
        orch.check_device_set("initialize a session")?;

        for (func_id, binary) in &init.kernels {
            orch.upload_kernel_binary(*func_id, binary)?;
        }
        let entry = resolver.resolve(init.image, init.entry)?;

        let mut builder = GraphBuilder::new(&mut *orch);
        if let Err(e) = entry(&mut builder, init.args.as_slice()) {
            let released = builder.abandon();
            tracing::warn!(entry = init.entry, released, error = %e, "entry_failed");
            return Err(e);
        }
        let built = builder.finish();
        if let Err(e) = built.graph.check_acyclic() {
            for addr in built.staged {
                orch.memory_mut().release_quietly(addr);
            }
            return Err(e);
        }

        let session = Self {
            id: SessionId::next(),
            work: WorkDescriptor::new(init.image, init.entry, init.args, built.graph),
            staged: built.staged,
            tensor_pairs: built.tensor_pairs,
            profiling: false,
        };
        tracing::info!(
            session = %session.id,
            tasks = session.work.task_count(),
            staged = session.staged.len(),
            "session_initialized"
        );
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn work(&self) -> &WorkDescriptor {
        &self.work
    }

    /// Device allocations the session owns
    pub fn staged(&self) -> &[DeviceAddr] {
        &self.staged
    }

    pub fn tensor_pairs(&self) -> &[TensorPair] {
        &self.tensor_pairs
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    pub fn enable_profiling(&mut self, enabled: bool) {
        self.profiling = enabled;
    }

    /// Remember a host/device tensor pair for the finalize log
    pub fn record_tensor_pair(&mut self, host_ptr: usize, device_ptr: DeviceAddr, size: usize) {
        self.tensor_pairs.push(TensorPair {
            host_ptr,
            device_ptr,
            size,
        });
    }

    /// Run the session's work on the orchestrator
    pub fn launch(
        &self,
        orch: &mut Orchestrator,
        mut params: LaunchParams,
        control_binary: &[u8],
        compute_binary: &[u8],
    ) -> Result<RunReport> {
        params.profiling |= self.profiling;
        orch.bind_session(self.id);
        orch.run(&self.work, &params, control_binary, compute_binary)
    }

    /// Release session memory, then clean the cache and finalize the orchestrator
    #[tracing::instrument(skip_all, fields(session = %self.id))]
    pub fn finalize(self, orch: &mut Orchestrator) -> Result<()> {
        for pair in &self.tensor_pairs {
            tracing::debug!(
                host_ptr = pair.host_ptr,
                device_ptr = %pair.device_ptr,
                size = pair.size,
                "tensor_pair"
            );
        }
        for addr in &self.staged {
            orch.memory_mut().release_quietly(*addr);
        }
        orch.clean_cache();
        orch.finalize()
    }
}
