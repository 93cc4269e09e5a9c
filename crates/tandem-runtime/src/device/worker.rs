//! Compute-core program: run posted tasks and time them

use std::panic::{self, AssertUnwindSafe};

use tandem_backends::{BackendError, DeviceContext, DeviceProgram, EntryKind};

use super::open_descriptor;
use crate::descriptor::DescriptorView;
use crate::handshake::{core_kind_of, SlotState, WorkerSlot, SLOT_WORDS};
use crate::telemetry::{backoff, region_len, PerformanceRecord, PipeTag, TelemetryProducer, HEADER_WORDS};

/// Compute image program: one instance per compute core
pub struct ComputeProgram;

impl DeviceProgram for ComputeProgram {
    fn run(&self, ctx: &DeviceContext<'_>) -> tandem_backends::Result<()> {
        if ctx.entry() != EntryKind::Compute {
            return Err(BackendError::launch_failed(format!("compute image has no {} entry", ctx.entry())));
        }
        let view = open_descriptor(ctx, ctx.args())?;
        let core = ctx.instance() as usize;
        let slots = view.slot_count();
        if core >= slots {
            return Err(BackendError::launch_failed(format!("core {core} has no slot among {slots}")));
        }

        let handshake = ctx.shared(view.handshake(), slots * SLOT_WORDS * 8)?;
        let telemetry = match view.telemetry() {
            Some(addr) => {
                let header = ctx.shared(addr, HEADER_WORDS * 8)?;
                Some(ctx.shared(addr, region_len(&header) * 8)?)
            }
            None => None,
        };
        let producer = telemetry.as_ref().map(TelemetryProducer::new);
        let slot = WorkerSlot::new(&handshake, core);

        let _done = DoneGuard {
            slot: &slot,
            producer: producer.as_ref(),
        };
        slot.advance(SlotState::Launched);
        slot.advance(SlotState::Ready);

        serve(ctx, &view, &slot, producer.as_ref(), core)
    }
}

/// Marks the worker done and counts it finished for telemetry
struct DoneGuard<'a> {
    slot: &'a WorkerSlot<'a>,
    producer: Option<&'a TelemetryProducer<'a>>,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer {
            producer.finish_worker();
        }
        self.slot.advance(SlotState::Done);
    }
}

fn serve(
    ctx: &DeviceContext<'_>,
    view: &DescriptorView,
    slot: &WorkerSlot<'_>,
    producer: Option<&TelemetryProducer<'_>>,
    core: usize,
) -> tandem_backends::Result<()> {
    let pipe: PipeTag = core_kind_of(core, view.cores_per_block()).into();
    let mut seen = 0u64;
    let mut first_error = None;
    let mut idle = 0u32;

    loop {
        if let Some(task) = slot.next_task(seen) {
            seen += 1;
            idle = 0;

            let start = ctx.ticks();
            let outcome = execute(ctx, view, task as usize);
            let end = ctx.ticks();

            let func_id = match outcome {
                Ok(func_id) => func_id,
                Err((func_id, e)) => {
                    tracing::warn!(core, task, func_id, error = %e, "task_failed");
                    view.raise_failure();
                    first_error.get_or_insert(e);
                    func_id
                }
            };
            if let Some(producer) = producer {
                producer.record(&PerformanceRecord {
                    core_id: core as u32,
                    pipe,
                    task_id: task,
                    func_id,
                    start_ticks: start,
                    end_ticks: end.max(start),
                });
            }
            slot.complete_task();
            continue;
        }

        if slot.quit_requested() || view.aborted() {
            break;
        }
        backoff(idle);
        idle = idle.saturating_add(1);
    }

    first_error.map_or(Ok(()), Err)
}

/// Run one task's kernel; the error side carries the function id for the record
fn execute(ctx: &DeviceContext<'_>, view: &DescriptorView, task: usize) -> Result<u32, (u32, BackendError)> {
    let entry = view.task(task).map_err(|e| (0, e))?;
    let kernel = ctx
        .kernel_at(entry.kernel_addr, entry.kernel_len)
        .map_err(|e| (entry.func_id, e))?;
    let args = view.args(&entry);
    // A panicking kernel still has to complete its task or the scheduler never retires it.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| kernel.execute(ctx, &args))).unwrap_or_else(|payload| {
        Err(BackendError::execution_failed(format!(
            "kernel panicked: {}",
            panic_message(&*payload)
        )))
    });
    outcome.map(|()| entry.func_id).map_err(|e| (entry.func_id, e))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}
