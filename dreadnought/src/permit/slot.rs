//! Slot bookkeeping and the lease handed to callers by `checkout`.

use std::fmt;
use std::sync::Arc;

use super::pool::Pool;
use crate::handle::{Worker, WorkerState};

/// Where a leased worker came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotIndex {
    /// Index into the fixed slot array, stable for the pool's lifetime.
    Pooled(usize),
    /// Transient overflow worker; has no slot.
    Overflow,
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotIndex::Pooled(i) => write!(f, "{i}"),
            SlotIndex::Overflow => f.write_str("overflow"),
        }
    }
}

/// One entry of the slot array.
///
/// While leased the worker lives in the `Lease`, so `worker` is `None` and the
/// state is `Busy`. A `Dead` slot is never handed out again.
pub(crate) struct Slot {
    pub(crate) worker: Option<Worker>,
    pub(crate) state: WorkerState,
}

impl Slot {
    pub(crate) fn idle(worker: Worker) -> Self {
        Self {
            worker: Some(worker),
            state: WorkerState::Idle,
        }
    }
}

/// A checked-out worker. Returned to the pool on drop.
#[must_use = "dropping a lease returns the worker immediately"]
pub struct Lease {
    worker: Option<Worker>,
    slot: SlotIndex,
    pool: Arc<Pool>,
}

impl Lease {
    pub(crate) fn new(worker: Worker, slot: SlotIndex, pool: Arc<Pool>) -> Self {
        Self {
            worker: Some(worker),
            slot,
            pool,
        }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    pub fn worker(&mut self) -> &mut Worker {
        match self.worker.as_mut() {
            Some(worker) => worker,
            // Only `Drop` takes the worker out.
            None => unreachable!("lease used after check-in"),
        }
    }

    pub fn worker_state(&self) -> Option<WorkerState> {
        self.worker.as_ref().map(Worker::state)
    }
}

impl Drop for Lease {
    /// A pooled worker still owing a reply (its caller was cancelled
    /// mid-transaction) is recovered on a task before it rejoins the pool.
    /// Without a runtime to do that the slot is poisoned.
    fn drop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let settling = matches!(self.slot, SlotIndex::Pooled(_))
            && !worker.is_dead()
            && !worker.is_settled();
        if !settling {
            self.pool.return_worker(self.slot, worker);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(&self.pool);
                let slot = self.slot;
                handle.spawn(async move {
                    if let Err(e) = worker.recover().await {
                        tracing::warn!(%slot, error = %e, "Could not recover worker from abandoned transaction");
                    }
                    pool.return_worker(slot, worker);
                });
            }
            Err(_) => {
                worker.set_state(WorkerState::Dead);
                self.pool.return_worker(self.slot, worker);
            }
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("slot", &self.slot)
            .field("worker", &self.worker)
            .finish()
    }
}
