//! Control-core program: task scheduling over the handshake slots
//!
//! Main instance `i` of `n` owns the compute workers whose slot index is
//! congruent to `i` mod `n`. It claims ready tasks matching a free worker's
//! core kind, posts them through the worker's slot, retires them when the
//! worker reports completion and posts quit to its workers on exit.

use tandem_backends::{BackendError, DeviceAddr, DeviceContext, DeviceProgram, EntryKind, SharedWords};

use super::open_descriptor;
use crate::descriptor::{
    DescriptorView, TaskEntry, DEVICE_ARGS_DESCRIPTOR, DEVICE_ARGS_PAYLOAD_ADDR, DEVICE_ARGS_PAYLOAD_LEN,
    DEVICE_ARGS_WORDS,
};
use crate::handshake::{core_kind_of, CoreKind, SlotState, WorkerSlot, SLOT_WORDS};
use crate::telemetry::backoff;

/// Control image program: one-shot init plus the scheduling loop
pub struct ControlProgram;

impl DeviceProgram for ControlProgram {
    fn run(&self, ctx: &DeviceContext<'_>) -> tandem_backends::Result<()> {
        match ctx.entry() {
            EntryKind::ControlInit => init(ctx),
            EntryKind::ControlMain => schedule(ctx),
            EntryKind::Compute => Err(BackendError::launch_failed("control image has no compute entry")),
        }
    }
}

fn descriptor_of(ctx: &DeviceContext<'_>) -> tandem_backends::Result<(Vec<u64>, DescriptorView)> {
    let args = ctx.read_words(ctx.args(), DEVICE_ARGS_WORDS)?;
    let view = open_descriptor(ctx, DeviceAddr::new(args[DEVICE_ARGS_DESCRIPTOR]))?;
    Ok((args, view))
}

fn init(ctx: &DeviceContext<'_>) -> tandem_backends::Result<()> {
    let (args, view) = descriptor_of(ctx)?;
    if args[DEVICE_ARGS_PAYLOAD_ADDR] == 0 || args[DEVICE_ARGS_PAYLOAD_LEN] == 0 {
        return Err(BackendError::execution_failed("control payload missing from argument block"));
    }
    view.mark_initialized();
    tracing::debug!(
        tasks = view.task_count(),
        slots = view.slot_count(),
        schedulers = view.schedulers(),
        "control_init"
    );
    Ok(())
}

/// Posts quit to every owned worker however the loop ends
struct QuitGuard<'a> {
    handshake: &'a SharedWords,
    slots: &'a [usize],
}

impl Drop for QuitGuard<'_> {
    fn drop(&mut self) {
        for slot in self.slots {
            WorkerSlot::new(self.handshake, *slot).post_quit();
        }
    }
}

fn claim_ready(view: &DescriptorView, kind: CoreKind) -> tandem_backends::Result<Option<(usize, TaskEntry)>> {
    for id in 0..view.task_count() {
        if !view.is_ready(id) {
            continue;
        }
        let entry = view.task(id)?;
        if entry.core == kind && view.try_claim(id) {
            return Ok(Some((id, entry)));
        }
    }
    Ok(None)
}

fn schedule(ctx: &DeviceContext<'_>) -> tandem_backends::Result<()> {
    let (_, view) = descriptor_of(ctx)?;
    let slots = view.slot_count();
    let handshake = ctx.shared(view.handshake(), slots * SLOT_WORDS * 8)?;
    let owned: Vec<usize> = (ctx.instance() as usize..slots)
        .step_by(ctx.instances().max(1) as usize)
        .collect();
    let _quit = QuitGuard {
        handshake: &handshake,
        slots: &owned,
    };

    if !view.initialized() {
        view.raise_failure();
        return Err(BackendError::execution_failed("control init did not complete before main"));
    }

    let cores_per_block = view.cores_per_block();
    let task_count = view.task_count();
    let mut running: Vec<Option<(usize, TaskEntry)>> = vec![None; owned.len()];
    let mut dispatched = 0usize;
    let mut idle = 0u32;

    loop {
        if view.aborted() || view.failed() || view.completed() >= task_count {
            break;
        }

        let mut progressed = false;
        for (index, slot_index) in owned.iter().enumerate() {
            let slot = WorkerSlot::new(&handshake, *slot_index);
            if let Some((id, entry)) = running[index] {
                if slot.completed() < slot.dispatched() {
                    if slot.state() == SlotState::Done && slot.completed() < slot.dispatched() {
                        tracing::warn!(slot = *slot_index, task = id, "worker_exited_with_task_outstanding");
                        view.raise_failure();
                    }
                    continue;
                }
                view.retire(&entry, id);
                running[index] = None;
                progressed = true;
            }
            if !slot.is_available() {
                continue;
            }
            if let Some((id, entry)) = claim_ready(&view, core_kind_of(*slot_index, cores_per_block))? {
                slot.post_task(id as u64);
                running[index] = Some((id, entry));
                dispatched += 1;
                progressed = true;
            }
        }

        if progressed {
            idle = 0;
        } else {
            backoff(idle);
            idle = idle.saturating_add(1);
        }
    }

    tracing::debug!(
        instance = ctx.instance(),
        workers = owned.len(),
        dispatched,
        completed = view.completed(),
        aborted = view.aborted(),
        "control_main_exit"
    );
    Ok(())
}
