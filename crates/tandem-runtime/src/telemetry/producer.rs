//! Device-side telemetry writer
//!
//! Any number of compute cores append records concurrently. A slot is
//! reserved by advancing the cursor word, filled, then published by bumping
//! the buffer's committed count. When the active buffer is full the writer
//! that finds every reserved slot committed and the other buffer idle swaps
//! buffers and seals the full one for the host. If the host falls behind and
//! no buffer frees up, the record is counted as dropped.

use std::sync::atomic::Ordering;

use tandem_backends::SharedWords;

use super::layout::*;

const SPIN_ATTEMPTS: u32 = 64;
const YIELD_ATTEMPTS: u32 = 1024;
const MAX_ATTEMPTS: u32 = 8192;

/// Backoff used while waiting on another party
pub(crate) fn backoff(attempt: u32) {
    if attempt < SPIN_ATTEMPTS {
        std::hint::spin_loop();
    } else if attempt < YIELD_ATTEMPTS {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_micros(10));
    }
}

/// Words to map for the region whose header is `header`
pub(crate) fn region_len(header: &SharedWords) -> usize {
    region_words(header.load(CAPACITY, Ordering::Acquire) as usize)
}

/// Writer handle over a mapped telemetry region
pub struct TelemetryProducer<'a> {
    words: &'a SharedWords,
    capacity: usize,
}

impl<'a> TelemetryProducer<'a> {
    pub fn new(words: &'a SharedWords) -> Self {
        let capacity = words.load(CAPACITY, Ordering::Acquire) as usize;
        Self { words, capacity }
    }

    /// Append one record; returns false when it had to be dropped
    pub fn record(&self, record: &PerformanceRecord) -> bool {
        if self.capacity == 0 {
            self.words.fetch_add(DROPPED, 1, Ordering::Relaxed);
            return false;
        }

        for attempt in 0..MAX_ATTEMPTS {
            let word = self.words.load(CURSOR, Ordering::Acquire);
            let cursor = Cursor::decode(word);

            if cursor.next < self.capacity {
                let reserved = Cursor {
                    next: cursor.next + 1,
                    ..cursor
                };
                if self
                    .words
                    .compare_exchange(CURSOR, word, reserved.encode(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.write(cursor.active, cursor.next, record);
                    self.words
                        .fetch_add(COMMITTED[cursor.active], 1, Ordering::Release);
                    return true;
                }
                continue;
            }

            if self.try_swap(word, cursor) {
                continue;
            }
            backoff(attempt);
        }

        self.words.fetch_add(DROPPED, 1, Ordering::Relaxed);
        false
    }

    /// Count this worker as finished; the host flushes once all have finished
    pub fn finish_worker(&self) {
        self.words.fetch_add(FINISHED_WORKERS, 1, Ordering::Release);
    }

    fn try_swap(&self, word: u64, cursor: Cursor) -> bool {
        let full = cursor.active;
        let next = 1 - full;
        if self.words.load(COMMITTED[full], Ordering::Acquire) as usize != self.capacity {
            return false;
        }
        if self
            .words
            .compare_exchange(STATE[next], BUFFER_IDLE, BUFFER_ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let swapped = cursor.swapped();
        if self
            .words
            .compare_exchange(CURSOR, word, swapped.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost to a newer generation; give the claimed buffer back.
            self.words.store(STATE[next], BUFFER_IDLE, Ordering::Release);
            return false;
        }
        self.words.store(COUNT[full], self.capacity as u64, Ordering::Relaxed);
        self.words.store(STATE[full], BUFFER_FULL, Ordering::Release);
        true
    }

    fn write(&self, buffer: usize, index: usize, record: &PerformanceRecord) {
        let base = record_offset(self.capacity, buffer, index);
        for (i, value) in record.to_words().into_iter().enumerate() {
            self.words.store(base + i, value, Ordering::Relaxed);
        }
    }
}
