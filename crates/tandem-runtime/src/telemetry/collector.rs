//! Host-side telemetry buffer and collection loop

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tandem_backends::{DeviceAddr, SharedWords};
use tandem_tracing::performance::record_drain;

use super::layout::*;
use super::producer::TelemetryProducer;
use crate::error::{Result, RuntimeError};
use crate::memory::DeviceMemoryAllocator;

/// Shared telemetry region owned by the host
pub struct TelemetryBuffer {
    addr: DeviceAddr,
    capacity: usize,
    words: SharedWords,
}

impl TelemetryBuffer {
    /// Allocate a region holding two buffers of `capacity` records each
    pub fn allocate(memory: &mut DeviceMemoryAllocator, capacity: usize, total_workers: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RuntimeError::Telemetry("telemetry capacity must be non-zero".into()));
        }
        let (addr, words) = memory.allocate_shared(region_words(capacity) * 8)?;
        let buffer = Self { addr, capacity, words };
        buffer.reset(total_workers);
        Ok(buffer)
    }

    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the region to its initial state for a new run
    pub fn reset(&self, total_workers: usize) {
        self.words.fill(0);
        self.words.store(CAPACITY, self.capacity as u64, Ordering::Relaxed);
        self.words.store(TOTAL_WORKERS, total_workers as u64, Ordering::Relaxed);
        self.words.store(STATE[0], BUFFER_ACTIVE, Ordering::Release);
    }

    /// Writer view, used by in-process producers
    pub fn producer(&self) -> TelemetryProducer<'_> {
        TelemetryProducer::new(&self.words)
    }

    pub fn dropped(&self) -> u64 {
        self.words.load(DROPPED, Ordering::Acquire)
    }

    pub fn finished_workers(&self) -> usize {
        self.words.load(FINISHED_WORKERS, Ordering::Acquire) as usize
    }

    /// Whether any sealed buffer is waiting to be drained
    pub fn has_sealed(&self) -> bool {
        STATE
            .iter()
            .any(|state| self.words.load(*state, Ordering::Acquire) == BUFFER_FULL)
    }

    /// Move every sealed, fully committed buffer into `out`; returns records moved
    pub fn drain(&self, out: &mut Vec<PerformanceRecord>) -> usize {
        let mut moved = 0;
        for buffer in 0..2 {
            if self.words.load(STATE[buffer], Ordering::Acquire) != BUFFER_FULL {
                continue;
            }
            let count = self.words.load(COUNT[buffer], Ordering::Acquire) as usize;
            if (self.words.load(COMMITTED[buffer], Ordering::Acquire) as usize) < count {
                continue;
            }
            for index in 0..count {
                let base = record_offset(self.capacity, buffer, index);
                let words = self.words.snapshot(base, RECORD_WORDS);
                out.push(PerformanceRecord::from_words(&words));
            }
            self.words.store(COMMITTED[buffer], 0, Ordering::Relaxed);
            self.words.store(COUNT[buffer], 0, Ordering::Relaxed);
            self.words.store(STATE[buffer], BUFFER_IDLE, Ordering::Release);
            moved += count;
        }
        moved
    }

    /// Seal a partially filled active buffer once no writer can touch it
    ///
    /// Only valid after every worker has finished. Returns true when a buffer
    /// was sealed.
    pub fn flush(&self) -> bool {
        let word = self.words.load(CURSOR, Ordering::Acquire);
        let cursor = Cursor::decode(word);
        if cursor.next == 0 {
            return false;
        }
        let next = 1 - cursor.active;
        if self
            .words
            .compare_exchange(STATE[next], BUFFER_IDLE, BUFFER_ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self
            .words
            .compare_exchange(CURSOR, word, cursor.swapped().encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.words.store(STATE[next], BUFFER_IDLE, Ordering::Release);
            return false;
        }
        self.words.store(COUNT[cursor.active], cursor.next as u64, Ordering::Relaxed);
        self.words.store(STATE[cursor.active], BUFFER_FULL, Ordering::Release);
        true
    }

    pub fn release(self, memory: &mut DeviceMemoryAllocator) -> Result<()> {
        memory.free(self.addr)
    }
}

/// Outcome of one collection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollOutcome {
    pub collected: usize,
    pub dropped: u64,
    pub timed_out: bool,
}

/// Accumulates records drained from the device
#[derive(Debug, Default)]
pub struct TelemetryCollector {
    records: Vec<PerformanceRecord>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[PerformanceRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Poll `buffer` until `expected` records are accounted for
    ///
    /// Stops early once all `num_cores` workers have finished and nothing is
    /// left to drain, and gives up after `timeout`.
    pub fn poll_and_collect(
        &mut self,
        buffer: &TelemetryBuffer,
        num_cores: usize,
        expected: usize,
        timeout: Duration,
        interval: Duration,
    ) -> PollOutcome {
        let start = Instant::now();
        let before = self.records.len();
        let mut timed_out = false;

        loop {
            buffer.drain(&mut self.records);
            let collected = self.records.len() - before;
            let dropped = buffer.dropped() as usize;
            if collected + dropped >= expected {
                break;
            }

            if buffer.finished_workers() >= num_cores {
                if buffer.flush() {
                    continue;
                }
                if !buffer.has_sealed() {
                    break;
                }
            }

            if start.elapsed() >= timeout {
                timed_out = true;
                tracing::warn!(
                    collected,
                    expected,
                    dropped,
                    timeout_ms = timeout.as_millis() as u64,
                    "telemetry_poll_timeout"
                );
                break;
            }
            std::thread::sleep(interval);
        }

        let outcome = PollOutcome {
            collected: self.records.len() - before,
            dropped: buffer.dropped(),
            timed_out,
        };
        if outcome.dropped > 0 {
            tracing::warn!(dropped = outcome.dropped, "telemetry_records_dropped");
        }
        record_drain(outcome.collected, outcome.dropped, start.elapsed().as_micros() as u64);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::PipeTag;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tandem_backends::{Backend, SimBackend};

    fn record(core_id: u32, task_id: u64) -> PerformanceRecord {
        PerformanceRecord {
            core_id,
            pipe: PipeTag::Vector,
            task_id,
            func_id: 1,
            start_ticks: task_id,
            end_ticks: task_id + 1,
        }
    }

    fn buffer(capacity: usize, workers: usize) -> (DeviceMemoryAllocator, TelemetryBuffer) {
        let sim = SimBackend::new();
        sim.set_device(0).unwrap();
        let mut memory = DeviceMemoryAllocator::new(Arc::new(sim));
        let buffer = TelemetryBuffer::allocate(&mut memory, capacity, workers).unwrap();
        (memory, buffer)
    }

    #[test]
    fn test_single_writer_swap_and_flush() {
        let (_memory, buffer) = buffer(4, 1);
        let producer = buffer.producer();
        for task in 0..6 {
            assert!(producer.record(&record(0, task)));
        }
        let mut out = Vec::new();
        assert_eq!(buffer.drain(&mut out), 4);

        producer.finish_worker();
        let mut collector = TelemetryCollector::new();
        let outcome =
            collector.poll_and_collect(&buffer, 1, 2, Duration::from_secs(1), Duration::from_micros(10));
        assert_eq!(outcome.collected, 2);
        assert!(!outcome.timed_out);
        out.extend_from_slice(collector.records());
        let tasks: Vec<u64> = out.iter().map(|r| r.task_id).collect();
        assert_eq!(tasks, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_drops_when_host_never_drains() {
        let (_memory, buffer) = buffer(2, 1);
        let producer = buffer.producer();
        for task in 0..4 {
            assert!(producer.record(&record(0, task)));
        }
        // Both buffers are now occupied; the next record has nowhere to go.
        assert!(!producer.record(&record(0, 99)));
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_poll_times_out_when_workers_never_finish() {
        let (_memory, buffer) = buffer(8, 2);
        buffer.producer().record(&record(0, 0));
        let mut collector = TelemetryCollector::new();
        let outcome =
            collector.poll_and_collect(&buffer, 2, 5, Duration::from_millis(20), Duration::from_millis(1));
        assert!(outcome.timed_out);
        assert_eq!(outcome.collected, 0);
    }

    #[test]
    fn test_concurrent_writers_conserve_records() {
        let workers = 6;
        let per_worker = 200;
        let (_memory, buffer) = buffer(16, workers);
        let mut collector = TelemetryCollector::new();

        let outcome = std::thread::scope(|scope| {
            for core in 0..workers {
                let buffer = &buffer;
                scope.spawn(move || {
                    let producer = buffer.producer();
                    for task in 0..per_worker {
                        producer.record(&record(core as u32, (core * per_worker + task) as u64));
                    }
                    producer.finish_worker();
                });
            }
            collector.poll_and_collect(
                &buffer,
                workers,
                workers * per_worker,
                Duration::from_secs(30),
                Duration::from_micros(20),
            )
        });

        assert!(!outcome.timed_out);
        assert_eq!(outcome.collected as u64 + outcome.dropped, (workers * per_worker) as u64);
        let mut ids: Vec<u64> = collector.records().iter().map(|r| r.task_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), outcome.collected);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn prop_interleaved_drains_preserve_order(
            (capacity, drain_every) in (1usize..8).prop_flat_map(|cap| (Just(cap), 1..=cap)),
            total in 0usize..40,
        ) {
            let (_memory, buffer) = buffer(capacity, 1);
            let producer = buffer.producer();
            let mut out = Vec::new();
            for task in 0..total {
                prop_assert!(producer.record(&record(0, task as u64)));
                if task % drain_every == 0 {
                    buffer.drain(&mut out);
                }
            }
            producer.finish_worker();
            let mut collector = TelemetryCollector::new();
            let remaining = total - out.len();
            let outcome = collector.poll_and_collect(&buffer, 1, remaining, Duration::from_secs(1), Duration::from_micros(10));
            prop_assert!(!outcome.timed_out);
            out.extend_from_slice(collector.records());
            let ids: Vec<u64> = out.iter().map(|r| r.task_id).collect();
            prop_assert_eq!(ids, (0..total as u64).collect::<Vec<_>>());
        }
    }
}
