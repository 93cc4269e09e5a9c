//! Device encoding of a work descriptor
//!
//! The task graph is flattened into one shared region of 64-bit words that
//! the control cores schedule from. Offsets are in words from the start of
//! the region.
//!
//! ```text
//! words 0..16        header
//! tasks_offset..     8 words per task: func id, core kind, kernel address,
//!                    kernel length, args offset, arg count, successor
//!                    offset, successor count
//! state_offset..     2 words per task: claim state, predecessors remaining
//! then               argument pool, successor pool
//! ```

use std::sync::atomic::{fence, Ordering};

use tandem_backends::{BackendError, DeviceAddr, SharedWords};

use crate::error::{Result, RuntimeError};
use crate::handshake::{CoreKind, HandshakeLayout};
use crate::kernel_cache::KernelBinaryCache;
use crate::work::TaskGraph;

/// "TANDEMWD" in little-endian
pub const MAGIC: u64 = u64::from_le_bytes(*b"TANDEMWD");
pub const HEADER_WORDS: usize = 16;
pub const TASK_WORDS: usize = 8;
pub const STATE_WORDS: usize = 2;

const MAGIC_WORD: usize = 0;
const TASK_COUNT: usize = 1;
const HANDSHAKE: usize = 2;
const SLOT_COUNT: usize = 3;
const CORES_PER_BLOCK: usize = 4;
const TELEMETRY: usize = 5;
const COMPLETED: usize = 6;
const ABORT: usize = 7;
const TASKS_OFFSET: usize = 8;
const SCHEDULERS: usize = 9;
const FAILED: usize = 10;
const STATE_OFFSET: usize = 11;
const INITIALIZED: usize = 12;
const TOTAL_WORDS: usize = 13;

const TASK_PENDING: u64 = 0;
const TASK_CLAIMED: u64 = 1;
const TASK_DONE: u64 = 2;

/// Words in the control-core argument block
pub const DEVICE_ARGS_WORDS: usize = 14;
/// Word holding the descriptor address for the current run
pub const DEVICE_ARGS_DESCRIPTOR: usize = 0;
/// Words holding the control payload address and length
pub const DEVICE_ARGS_PAYLOAD_ADDR: usize = 12;
pub const DEVICE_ARGS_PAYLOAD_LEN: usize = 13;

/// Device regions a descriptor points the scheduler at
#[derive(Debug, Clone, Copy)]
pub struct LaunchTargets {
    pub handshake: DeviceAddr,
    pub layout: HandshakeLayout,
    pub telemetry: Option<DeviceAddr>,
    /// Control-core main instances
    pub schedulers: u32,
}

/// Flatten `graph` into descriptor words
///
/// Every function id must already be bound in `kernels`, and every core kind
/// the graph uses must have at least one worker.
pub fn encode(graph: &TaskGraph, kernels: &KernelBinaryCache, targets: &LaunchTargets) -> Result<Vec<u64>> {
    graph.check_acyclic()?;

    let (matrix_tasks, vector_tasks) = graph.kind_counts();
    let (matrix_slots, vector_slots) = targets.layout.kind_counts();
    if (matrix_tasks > 0 && matrix_slots == 0) || (vector_tasks > 0 && vector_slots == 0) {
        return Err(RuntimeError::invalid_argument(format!(
            "graph needs {matrix_tasks} matrix and {vector_tasks} vector tasks but launch has \
             {matrix_slots} matrix and {vector_slots} vector cores"
        )));
    }

    let tasks = graph.tasks();
    let tasks_offset = HEADER_WORDS;
    let state_offset = tasks_offset + tasks.len() * TASK_WORDS;
    let args_offset = state_offset + tasks.len() * STATE_WORDS;
    let arg_words: usize = tasks.iter().map(|t| t.args.len()).sum();
    let succ_offset = args_offset + arg_words;
    let succ_words: usize = tasks.iter().map(|t| t.successors.len()).sum();
    let total = succ_offset + succ_words;

    let mut words = vec![0u64; total];
    words[MAGIC_WORD] = MAGIC;
    words[TASK_COUNT] = tasks.len() as u64;
    words[HANDSHAKE] = targets.handshake.get();
    words[SLOT_COUNT] = targets.layout.slot_count() as u64;
    words[CORES_PER_BLOCK] = u64::from(targets.layout.cores_per_block);
    words[TELEMETRY] = targets.telemetry.map_or(0, DeviceAddr::get);
    words[TASKS_OFFSET] = tasks_offset as u64;
    words[SCHEDULERS] = u64::from(targets.schedulers);
    words[STATE_OFFSET] = state_offset as u64;
    words[TOTAL_WORDS] = total as u64;

    let mut next_arg = args_offset;
    let mut next_succ = succ_offset;
    for (id, task) in tasks.iter().enumerate() {
        let binding = kernels.binding(task.func_id).ok_or_else(|| {
            RuntimeError::invalid_argument(format!("task {id} uses function {} with no uploaded kernel", task.func_id))
        })?;

        let entry = tasks_offset + id * TASK_WORDS;
        words[entry..entry + TASK_WORDS].copy_from_slice(&[
            u64::from(task.func_id),
            task.core.as_word(),
            binding.addr.get(),
            binding.len as u64,
            next_arg as u64,
            task.args.len() as u64,
            next_succ as u64,
            task.successors.len() as u64,
        ]);

        let state = state_offset + id * STATE_WORDS;
        words[state] = TASK_PENDING;
        words[state + 1] = u64::from(task.fanin);

        words[next_arg..next_arg + task.args.len()].copy_from_slice(&task.args);
        next_arg += task.args.len();
        for succ in &task.successors {
            words[next_succ] = u64::from(*succ);
            next_succ += 1;
        }
    }

    Ok(words)
}

/// One decoded task table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskEntry {
    pub func_id: u32,
    pub core: CoreKind,
    pub kernel_addr: DeviceAddr,
    pub kernel_len: usize,
    args_offset: usize,
    arg_count: usize,
    succ_offset: usize,
    succ_count: usize,
}

/// Shared view of an installed descriptor, used by host and device alike
pub struct DescriptorView {
    words: SharedWords,
}

fn malformed(reason: impl Into<String>) -> BackendError {
    BackendError::execution_failed(format!("malformed work descriptor: {}", reason.into()))
}

impl DescriptorView {
    /// Copy `encoded` into a freshly allocated shared region
    pub fn install(words: SharedWords, encoded: &[u64]) -> Self {
        for (index, value) in encoded.iter().enumerate() {
            words.store(index, *value, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        Self { words }
    }

    /// Wrap a mapping of a descriptor written by the host
    pub fn open(words: SharedWords) -> std::result::Result<Self, BackendError> {
        if words.len() < HEADER_WORDS || words.load(MAGIC_WORD, Ordering::Acquire) != MAGIC {
            return Err(malformed("bad magic"));
        }
        let total = words.load(TOTAL_WORDS, Ordering::Relaxed) as usize;
        if total > words.len() {
            return Err(malformed(format!("{total} words declared, {} mapped", words.len())));
        }
        Ok(Self { words })
    }

    /// Total words of a descriptor given its header
    pub fn total_words(header: &SharedWords) -> usize {
        header.load(TOTAL_WORDS, Ordering::Acquire) as usize
    }

    pub fn task_count(&self) -> usize {
        self.words.load(TASK_COUNT, Ordering::Relaxed) as usize
    }

    pub fn handshake(&self) -> DeviceAddr {
        DeviceAddr::new(self.words.load(HANDSHAKE, Ordering::Relaxed))
    }

    pub fn slot_count(&self) -> usize {
        self.words.load(SLOT_COUNT, Ordering::Relaxed) as usize
    }

    pub fn cores_per_block(&self) -> u32 {
        self.words.load(CORES_PER_BLOCK, Ordering::Relaxed) as u32
    }

    pub fn telemetry(&self) -> Option<DeviceAddr> {
        match self.words.load(TELEMETRY, Ordering::Relaxed) {
            0 => None,
            addr => Some(DeviceAddr::new(addr)),
        }
    }

    pub fn schedulers(&self) -> u32 {
        self.words.load(SCHEDULERS, Ordering::Relaxed) as u32
    }

    pub fn task(&self, id: usize) -> std::result::Result<TaskEntry, BackendError> {
        if id >= self.task_count() {
            return Err(malformed(format!("task {id} out of range")));
        }
        let base = self.words.load(TASKS_OFFSET, Ordering::Relaxed) as usize + id * TASK_WORDS;
        let raw = self.words.snapshot(base, TASK_WORDS);
        let core = CoreKind::from_word(raw[1]).ok_or_else(|| malformed(format!("task {id} has core kind {}", raw[1])))?;
        Ok(TaskEntry {
            func_id: raw[0] as u32,
            core,
            kernel_addr: DeviceAddr::new(raw[2]),
            kernel_len: raw[3] as usize,
            args_offset: raw[4] as usize,
            arg_count: raw[5] as usize,
            succ_offset: raw[6] as usize,
            succ_count: raw[7] as usize,
        })
    }

    pub fn args(&self, task: &TaskEntry) -> Vec<u64> {
        self.words.snapshot(task.args_offset, task.arg_count)
    }

    fn state_word(&self, id: usize) -> usize {
        self.words.load(STATE_OFFSET, Ordering::Relaxed) as usize + id * STATE_WORDS
    }

    /// Unclaimed with every predecessor retired
    pub fn is_ready(&self, id: usize) -> bool {
        let state = self.state_word(id);
        self.words.load(state, Ordering::Acquire) == TASK_PENDING && self.words.load(state + 1, Ordering::Acquire) == 0
    }

    /// Claim a ready task; only one caller wins
    pub fn try_claim(&self, id: usize) -> bool {
        let state = self.state_word(id);
        self.words.load(state + 1, Ordering::Acquire) == 0
            && self
                .words
                .compare_exchange(state, TASK_PENDING, TASK_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Mark a claimed task finished and release its successors
    pub fn retire(&self, task: &TaskEntry, id: usize) {
        self.words.store(self.state_word(id), TASK_DONE, Ordering::Release);
        for succ in self.words.snapshot(task.succ_offset, task.succ_count) {
            let state = self.state_word(succ as usize);
            self.words.fetch_sub(state + 1, 1, Ordering::AcqRel);
        }
        self.words.fetch_add(COMPLETED, 1, Ordering::AcqRel);
    }

    pub fn completed(&self) -> usize {
        self.words.load(COMPLETED, Ordering::Acquire) as usize
    }

    /// Ask every device program to stop. Host side.
    pub fn abort(&self) {
        self.words.store(ABORT, 1, Ordering::Release);
    }

    pub fn aborted(&self) -> bool {
        self.words.load(ABORT, Ordering::Acquire) != 0
    }

    /// Record that a kernel failed
    pub fn raise_failure(&self) {
        self.words.store(FAILED, 1, Ordering::Release);
    }

    pub fn failed(&self) -> bool {
        self.words.load(FAILED, Ordering::Acquire) != 0
    }

    pub fn mark_initialized(&self) {
        self.words.store(INITIALIZED, 1, Ordering::Release);
    }

    pub fn initialized(&self) -> bool {
        self.words.load(INITIALIZED, Ordering::Acquire) != 0
    }
}
