//! In-order execution queues backed by host threads

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::backend::{QueueHandle, QueueKind};
use crate::error::{BackendError, Result};

pub(crate) type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct QueueState {
    pending: Mutex<usize>,
    drained: Condvar,
    first_error: Mutex<Option<BackendError>>,
}

/// One simulated queue: a worker thread draining jobs in FIFO order
pub(crate) struct SimQueue {
    handle: QueueHandle,
    kind: QueueKind,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    state: Arc<QueueState>,
}

impl SimQueue {
    pub(crate) fn spawn(handle: QueueHandle, kind: QueueKind) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let state = Arc::new(QueueState::default());
        let worker_state = Arc::clone(&state);

        let worker = std::thread::Builder::new()
            .name(format!("tandem-sim-{kind}-{}", handle.id()))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(job))
                        .unwrap_or_else(|_| Err(BackendError::execution_failed("device program panicked")));
                    if let Err(err) = outcome {
                        tracing::warn!(queue = handle.id(), error = %err, "sim_job_failed");
                        let mut slot = worker_state.first_error.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                    let mut pending = worker_state.pending.lock();
                    *pending -= 1;
                    if *pending == 0 {
                        worker_state.drained.notify_all();
                    }
                }
            })
            .map_err(|e| BackendError::other(format!("failed to spawn queue thread: {e}")))?;

        Ok(Self {
            handle,
            kind,
            sender: Some(sender),
            worker: Some(worker),
            state,
        })
    }

    pub(crate) fn kind(&self) -> QueueKind {
        self.kind
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(BackendError::InvalidQueue(self.handle.id()))?;
        *self.state.pending.lock() += 1;
        if sender.send(job).is_err() {
            let mut pending = self.state.pending.lock();
            *pending -= 1;
            return Err(BackendError::launch_failed(format!("{} is shut down", self.handle)));
        }
        Ok(())
    }

    /// Block until every submitted job has run; surfaces the first job error once
    pub(crate) fn synchronize(&self) -> Result<()> {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.drained.wait(&mut pending);
        }
        drop(pending);

        match self.state.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for SimQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(queue = self.handle.id(), "sim_queue_thread_panicked");
            }
        }
    }
}
