//! Control/compute handshake slots
//!
//! One fixed-size slot per compute core lives in a host-visible shared
//! region. Each word has exactly one writer: the control core owns the
//! dispatch words (`TASK`, `DISPATCHED`, `QUIT`) and the compute core owns
//! the rest. Slot state only moves forward: Idle, Launched, Ready, Done.

use std::fmt;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tandem_backends::{DeviceAddr, SharedWords};

use crate::error::Result;
use crate::memory::DeviceMemoryAllocator;

/// Words per handshake slot
pub const SLOT_WORDS: usize = 8;

const STATE: usize = 0;
const SEQUENCE: usize = 1;
const TASK: usize = 2;
const DISPATCHED: usize = 3;
const COMPLETED: usize = 4;
const QUIT: usize = 5;

/// Kind of compute core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreKind {
    Matrix,
    Vector,
}

impl CoreKind {
    pub fn as_word(self) -> u64 {
        match self {
            CoreKind::Matrix => 0,
            CoreKind::Vector => 1,
        }
    }

    pub fn from_word(word: u64) -> Option<Self> {
        match word {
            0 => Some(CoreKind::Matrix),
            1 => Some(CoreKind::Vector),
            _ => None,
        }
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreKind::Matrix => write!(f, "matrix"),
            CoreKind::Vector => write!(f, "vector"),
        }
    }
}

/// Lifecycle of one compute core as seen through its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Idle = 0,
    Launched = 1,
    Ready = 2,
    Done = 3,
}

impl SlotState {
    pub fn from_word(word: u64) -> Self {
        match word {
            1 => SlotState::Launched,
            2 => SlotState::Ready,
            3 => SlotState::Done,
            _ => SlotState::Idle,
        }
    }
}

/// Arrangement of slots for one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeLayout {
    pub block_dim: u32,
    pub cores_per_block: u32,
}

impl HandshakeLayout {
    pub fn new(block_dim: u32, cores_per_block: u32) -> Self {
        Self {
            block_dim,
            cores_per_block,
        }
    }

    /// One slot per compute core
    pub fn slot_count(&self) -> usize {
        self.block_dim as usize * self.cores_per_block as usize
    }

    pub fn bytes(&self) -> usize {
        self.slot_count() * SLOT_WORDS * 8
    }

    /// The first core of every block is a matrix core, the rest are vector cores
    pub fn core_kind(&self, slot: usize) -> CoreKind {
        core_kind_of(slot, self.cores_per_block)
    }

    /// Number of matrix and vector slots
    pub fn kind_counts(&self) -> (usize, usize) {
        let matrix = self.block_dim as usize;
        (matrix, self.slot_count() - matrix)
    }
}

pub(crate) fn core_kind_of(slot: usize, cores_per_block: u32) -> CoreKind {
    if slot % cores_per_block.max(1) as usize == 0 {
        CoreKind::Matrix
    } else {
        CoreKind::Vector
    }
}

/// View of one slot inside a mapped handshake region
pub struct WorkerSlot<'a> {
    words: &'a SharedWords,
    base: usize,
}

impl<'a> WorkerSlot<'a> {
    pub fn new(words: &'a SharedWords, slot: usize) -> Self {
        Self {
            words,
            base: slot * SLOT_WORDS,
        }
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_word(self.words.load(self.base + STATE, Ordering::Acquire))
    }

    /// Advance the slot state; never moves backwards. Compute side only.
    pub fn advance(&self, state: SlotState) {
        let current = self.words.load(self.base + STATE, Ordering::Acquire);
        if (state as u64) > current {
            self.words.fetch_add(self.base + SEQUENCE, 1, Ordering::Relaxed);
            self.words.store(self.base + STATE, state as u64, Ordering::Release);
        }
    }

    /// Hand a task to the worker. Control side only.
    pub fn post_task(&self, task: u64) {
        self.words.store(self.base + TASK, task, Ordering::Relaxed);
        self.words.fetch_add(self.base + DISPATCHED, 1, Ordering::Release);
    }

    /// Tell the worker to exit once idle. Control side only.
    pub fn post_quit(&self) {
        self.words.store(self.base + QUIT, 1, Ordering::Release);
    }

    /// Task handed over after `seen` dispatches, if any. Compute side.
    pub fn next_task(&self, seen: u64) -> Option<u64> {
        if self.words.load(self.base + DISPATCHED, Ordering::Acquire) > seen {
            Some(self.words.load(self.base + TASK, Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Report the current task finished. Compute side only.
    pub fn complete_task(&self) {
        self.words.fetch_add(self.base + SEQUENCE, 1, Ordering::Relaxed);
        self.words.fetch_add(self.base + COMPLETED, 1, Ordering::Release);
    }

    pub fn dispatched(&self) -> u64 {
        self.words.load(self.base + DISPATCHED, Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.words.load(self.base + COMPLETED, Ordering::Acquire)
    }

    pub fn quit_requested(&self) -> bool {
        self.words.load(self.base + QUIT, Ordering::Acquire) != 0
    }

    /// Ready and holding no unfinished task
    pub fn is_available(&self) -> bool {
        self.state() == SlotState::Ready && self.dispatched() == self.completed()
    }
}

/// Host copy of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub core: CoreKind,
    pub state: SlotState,
    pub sequence: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub quit: bool,
}

/// Handshake region allocated for a launch
pub struct HandshakeBuffer {
    addr: DeviceAddr,
    layout: HandshakeLayout,
    words: SharedWords,
}

impl HandshakeBuffer {
    pub fn allocate(memory: &mut DeviceMemoryAllocator, layout: HandshakeLayout) -> Result<Self> {
        let (addr, words) = memory.allocate_shared(layout.bytes())?;
        let buffer = Self { addr, layout, words };
        buffer.reset();
        Ok(buffer)
    }

    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    pub fn layout(&self) -> HandshakeLayout {
        self.layout
    }

    /// Zero every slot; must happen before the compute launch
    pub fn reset(&self) {
        self.words.fill(0);
    }

    pub fn slot(&self, slot: usize) -> WorkerSlot<'_> {
        WorkerSlot::new(&self.words, slot)
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        (0..self.layout.slot_count())
            .map(|slot| {
                let words = self.words.snapshot(slot * SLOT_WORDS, SLOT_WORDS);
                SlotSnapshot {
                    slot,
                    core: self.layout.core_kind(slot),
                    state: SlotState::from_word(words[STATE]),
                    sequence: words[SEQUENCE],
                    dispatched: words[DISPATCHED],
                    completed: words[COMPLETED],
                    quit: words[QUIT] != 0,
                }
            })
            .collect()
    }

    pub fn release(self, memory: &mut DeviceMemoryAllocator) -> Result<()> {
        memory.free(self.addr)
    }
}
