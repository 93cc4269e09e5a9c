//! Staged initialization, binary caching and teardown against a counting backend

mod common;

use std::sync::Arc;

use common::{CountingBackend, APP_IMAGE, FAN_ENTRY, MATMUL_BINARY, NOOP_BINARY, NOOP_FUNC};
use tandem_runtime::{
    device, ArgValue, LaunchParams, LifecycleState, Orchestrator, Session, SessionInit, StaticEntries,
};

fn fan_out(orch: &mut Orchestrator, entries: &StaticEntries, tasks: u64) -> tandem_runtime::Result<Session> {
    let init = SessionInit {
        image: APP_IMAGE,
        entry: FAN_ENTRY,
        args: vec![ArgValue::scalar(tasks)],
        kernels: common::kernels(),
    };
    Session::init(orch, init, entries)
}

fn run(session: &Session, orch: &mut Orchestrator) -> tandem_runtime::Result<tandem_runtime::RunReport> {
    session.launch(orch, LaunchParams::new(1, 0), device::CONTROL_IMAGE, device::COMPUTE_IMAGE)
}

#[test]
fn test_staged_init_is_idempotent() -> tandem_runtime::Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let mut orch = Orchestrator::new(backend.clone(), common::test_config());

    orch.ensure_device_initialized(0, device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    assert_eq!(orch.state(), LifecycleState::BinariesLoaded);
    let mallocs = backend.mallocs();

    orch.ensure_device_initialized(0, device::CONTROL_IMAGE, device::COMPUTE_IMAGE)?;
    assert_eq!(backend.set_device_calls(), 1);
    assert_eq!(backend.queues_created(), 2);
    assert_eq!(backend.mallocs(), mallocs);
    assert_eq!(backend.copies_of(device::CONTROL_IMAGE), 1);

    // Runs reuse the selected device and loaded images.
    let entries = common::entries();
    let session = fan_out(&mut orch, &entries, 4)?;
    run(&session, &mut orch)?;
    run(&session, &mut orch)?;
    assert_eq!(orch.state(), LifecycleState::Idle);
    assert_eq!(orch.runs(), 2);
    assert_eq!(backend.set_device_calls(), 1);
    assert_eq!(backend.copies_of(device::CONTROL_IMAGE), 1);
    assert_eq!(backend.copies_of(device::COMPUTE_IMAGE), 1);

    session.finalize(&mut orch)?;
    Ok(())
}

#[test]
fn test_kernel_binary_copied_once_per_func_id() -> tandem_runtime::Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let mut orch = Orchestrator::new(backend.clone(), common::test_config());
    orch.ensure_device_set(0)?;
    let entries = common::entries();

    let first = fan_out(&mut orch, &entries, 3)?;
    let second = fan_out(&mut orch, &entries, 5)?;
    orch.upload_kernel_binary(NOOP_FUNC, NOOP_BINARY)?;
    assert_eq!(backend.copies_of(NOOP_BINARY), 1);
    assert_eq!(backend.copies_of(MATMUL_BINARY), 1);
    assert_eq!(orch.kernels().len(), 3);

    assert_eq!(run(&first, &mut orch)?.completed, 3);
    assert_eq!(run(&second, &mut orch)?.completed, 5);
    assert_eq!(backend.copies_of(NOOP_BINARY), 1);

    // Clearing the cache forces the next binding to copy again.
    orch.clean_cache();
    let third = fan_out(&mut orch, &entries, 2)?;
    assert_eq!(backend.copies_of(NOOP_BINARY), 2);
    assert_eq!(run(&third, &mut orch)?.completed, 2);

    third.finalize(&mut orch)?;
    Ok(())
}

#[test]
fn test_clean_cache_keeps_device_and_finalize_releases_everything() -> tandem_runtime::Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let mut orch = Orchestrator::new(backend.clone(), common::test_config());
    orch.ensure_device_set(0)?;
    let entries = common::entries();
    let session = fan_out(&mut orch, &entries, 6)?;
    run(&session, &mut orch)?;

    orch.clean_cache();
    assert_eq!(orch.state(), LifecycleState::DeviceSet);
    assert_eq!(orch.device_id(), Some(0));
    assert!(!orch.binaries_loaded());
    assert!(orch.kernels().is_empty());

    // Same device and queues; images and kernels upload again.
    orch.upload_kernel_binary(NOOP_FUNC, NOOP_BINARY)?;
    assert_eq!(run(&session, &mut orch)?.completed, 6);
    assert_eq!(backend.set_device_calls(), 1);
    assert_eq!(backend.queues_created(), 2);
    assert_eq!(backend.copies_of(device::CONTROL_IMAGE), 2);

    orch.finalize()?;
    assert_eq!(orch.state(), LifecycleState::Finalized);
    assert_eq!(orch.device_id(), None);
    assert_eq!(backend.sim().live_allocations(), 0);
    assert!(orch.last_session().is_none());

    // A finalized orchestrator starts over from device selection.
    orch.ensure_device_set(0)?;
    orch.upload_kernel_binary(NOOP_FUNC, NOOP_BINARY)?;
    assert_eq!(run(&session, &mut orch)?.completed, 6);
    assert_eq!(backend.set_device_calls(), 2);
    assert_eq!(backend.queues_created(), 4);

    session.finalize(&mut orch)?;
    assert_eq!(backend.sim().live_allocations(), 0);
    Ok(())
}

#[test]
fn test_finalize_after_failed_run_is_safe() -> tandem_runtime::Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let mut orch = Orchestrator::new(backend.clone(), common::test_config());
    orch.ensure_device_set(0)?;
    let entries = common::entries();
    let session = fan_out(&mut orch, &entries, 2)?;

    // Zero control instances is rejected before anything is allocated.
    let err = session
        .launch(
            &mut orch,
            LaunchParams::new(1, 0).with_worker_count(0),
            device::CONTROL_IMAGE,
            device::COMPUTE_IMAGE,
        )
        .unwrap_err();
    assert_eq!(err.status(), -1);

    // An image no program is registered for fails at execution.
    let err = run_with_images(&session, &mut orch, b"not-a-control-image")?;
    assert_eq!(err.status(), -4);

    session.finalize(&mut orch)?;
    orch.finalize()?;
    assert_eq!(backend.sim().live_allocations(), 0);
    Ok(())
}

fn run_with_images(
    session: &Session,
    orch: &mut Orchestrator,
    control: &[u8],
) -> tandem_runtime::Result<tandem_runtime::RuntimeError> {
    match session.launch(orch, LaunchParams::new(1, 0), control, device::COMPUTE_IMAGE) {
        Ok(report) => Err(tandem_runtime::RuntimeError::invalid_argument(format!(
            "expected failure, got {report:?}"
        ))),
        Err(e) => Ok(e),
    }
}
