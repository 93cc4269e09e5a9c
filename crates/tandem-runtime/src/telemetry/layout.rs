//! Shared-region layout of the double-buffered telemetry channel
//!
//! ```text
//! word 0        cursor word: write cursor | active buffer | generation
//! words 1..=2   buffer state (idle, active, full)
//! words 3..=4   sealed record count per buffer
//! words 5..=6   committed record count per buffer
//! word 7        dropped records
//! word 8        workers that have finished
//! word 9        records per buffer
//! word 10       total workers
//! words 16..    buffer 0 records, then buffer 1 records
//! ```

use serde::Serialize;

use crate::handshake::CoreKind;

pub const HEADER_WORDS: usize = 16;
pub const RECORD_WORDS: usize = 5;

pub const CURSOR: usize = 0;
pub const STATE: [usize; 2] = [1, 2];
pub const COUNT: [usize; 2] = [3, 4];
pub const COMMITTED: [usize; 2] = [5, 6];
pub const DROPPED: usize = 7;
pub const FINISHED_WORKERS: usize = 8;
pub const CAPACITY: usize = 9;
pub const TOTAL_WORKERS: usize = 10;

pub const BUFFER_IDLE: u64 = 0;
pub const BUFFER_ACTIVE: u64 = 1;
pub const BUFFER_FULL: u64 = 2;

const CURSOR_MASK: u64 = 0xffff_ffff;
const ACTIVE_SHIFT: u32 = 32;
const GENERATION_SHIFT: u32 = 33;

/// Decoded cursor word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Next free record slot in the active buffer
    pub next: usize,
    /// Buffer currently receiving writes
    pub active: usize,
    /// Bumped on every swap
    pub generation: u64,
}

impl Cursor {
    pub fn decode(word: u64) -> Self {
        Self {
            next: (word & CURSOR_MASK) as usize,
            active: ((word >> ACTIVE_SHIFT) & 1) as usize,
            generation: word >> GENERATION_SHIFT,
        }
    }

    pub fn encode(self) -> u64 {
        (self.next as u64 & CURSOR_MASK) | ((self.active as u64 & 1) << ACTIVE_SHIFT) | (self.generation << GENERATION_SHIFT)
    }

    /// The cursor after swapping to the other buffer
    pub fn swapped(self) -> Self {
        Self {
            next: 0,
            active: 1 - self.active,
            generation: self.generation + 1,
        }
    }
}

/// Total shared-region words for `capacity` records per buffer
pub fn region_words(capacity: usize) -> usize {
    HEADER_WORDS + 2 * capacity * RECORD_WORDS
}

/// First word of record `index` in `buffer`
pub fn record_offset(capacity: usize, buffer: usize, index: usize) -> usize {
    HEADER_WORDS + (buffer * capacity + index) * RECORD_WORDS
}

/// Execution pipe a record was produced on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeTag {
    Matrix = 0,
    Vector = 1,
}

impl PipeTag {
    pub fn from_word(word: u64) -> Self {
        match word {
            0 => PipeTag::Matrix,
            _ => PipeTag::Vector,
        }
    }

    /// Event name shown in trace viewers
    pub fn name(self) -> &'static str {
        match self {
            PipeTag::Matrix => "matrix_task",
            PipeTag::Vector => "vector_task",
        }
    }

    /// Event category shown in trace viewers
    pub fn category(self) -> &'static str {
        match self {
            PipeTag::Matrix => "cube",
            PipeTag::Vector => "vector",
        }
    }
}

impl From<CoreKind> for PipeTag {
    fn from(kind: CoreKind) -> Self {
        match kind {
            CoreKind::Matrix => PipeTag::Matrix,
            CoreKind::Vector => PipeTag::Vector,
        }
    }
}

/// One timed task execution on one compute core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerformanceRecord {
    pub core_id: u32,
    pub pipe: PipeTag,
    pub task_id: u64,
    pub func_id: u32,
    pub start_ticks: u64,
    pub end_ticks: u64,
}

impl PerformanceRecord {
    pub fn to_words(&self) -> [u64; RECORD_WORDS] {
        [
            (u64::from(self.core_id) << 32) | self.pipe as u64,
            self.task_id,
            u64::from(self.func_id),
            self.start_ticks,
            self.end_ticks,
        ]
    }

    pub fn from_words(words: &[u64]) -> Self {
        Self {
            core_id: (words[0] >> 32) as u32,
            pipe: PipeTag::from_word(words[0] & 0xffff_ffff),
            task_id: words[1],
            func_id: words[2] as u32,
            start_ticks: words[3],
            end_ticks: words[4],
        }
    }

    pub fn duration_ticks(&self) -> u64 {
        self.end_ticks.saturating_sub(self.start_ticks)
    }
}
