//! Worker pool: fixed slot array with round-robin checkout and overflow spill.
//!
//! Slot poisoning is a pool-level property: a worker that comes back dead, or
//! still holding a stream open, takes its slot out of service for good.
//!
//! Setup is split in two because fork only copies the calling thread.
//! [`ForkedPool::fork`] creates every process while the coordinator is still
//! single-threaded; [`ForkedPool::activate`] wires the parent ends into tokio
//! once a runtime exists.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::slot::{Lease, Slot, SlotIndex};
use crate::bridge::channel::pipe_pair;
use crate::config::{ConfigError, PoolConfig};
use crate::engine::EngineFactory;
use crate::handle::{Worker, WorkerState};
use crate::overflow::{ControllerEnds, OverflowClient, OverflowError, fork_controller};
use crate::process::{SpawnError, spawn_detached};
use crate::registry::CallbackRegistry;
use crate::worker::{WorkerIo, WorkerMode, install_panic_hook, run_worker};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("failed to attach worker pipes: {0}")]
    Attach(#[from] std::io::Error),

    #[error(transparent)]
    Overflow(#[from] OverflowError),

    #[error("no worker became free within {waited:?}")]
    Saturated { waited: Duration },

    #[error("all {size} pooled workers are dead and overflow is disabled")]
    Exhausted { size: usize },
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub dead: usize,
    pub overflow_active: usize,
    pub max_overflow: usize,
}

struct SlotTable {
    slots: Vec<Slot>,
    /// Next index to scan from.
    cursor: usize,
}

enum Scan {
    Found(usize, Worker),
    NoneIdle,
    AllDead,
}

impl SlotTable {
    fn scan(&mut self) -> Scan {
        let n = self.slots.len();
        let mut dead = 0;
        for step in 0..n {
            let index = (self.cursor + step) % n;
            let slot = &mut self.slots[index];
            match slot.state {
                WorkerState::Idle => match slot.worker.take() {
                    Some(mut worker) => {
                        slot.state = WorkerState::Busy;
                        worker.set_state(WorkerState::Busy);
                        self.cursor = (index + 1) % n;
                        return Scan::Found(index, worker);
                    }
                    None => {
                        tracing::error!(slot = index, "Idle slot without a worker");
                        slot.state = WorkerState::Dead;
                        dead += 1;
                    }
                },
                WorkerState::Dead => dead += 1,
                WorkerState::Busy | WorkerState::Streaming => {}
            }
        }
        if dead == n { Scan::AllDead } else { Scan::NoneIdle }
    }
}

/// Pool of pre-forked workers.
pub struct Pool {
    table: StdMutex<SlotTable>,
    /// Signalled on every check-in and every finished overflow lease.
    returned: Notify,
    overflow: Option<OverflowClient>,
    overflow_active: AtomicUsize,
    config: PoolConfig,
}

impl Pool {
    /// Fork and activate in one step.
    ///
    /// Forking from a multi-threaded process is only safe while no other thread
    /// holds a lock the children need; servers should call [`ForkedPool::fork`]
    /// before building their runtime instead.
    pub fn setup(
        registry: Arc<CallbackRegistry>,
        engines: EngineFactory,
        config: PoolConfig,
    ) -> Result<Arc<Pool>, PoolError> {
        ForkedPool::fork(registry, engines, config)?.activate()
    }

    /// Lease a worker.
    ///
    /// Scans from a rotating cursor for an idle slot. With none idle, spills to
    /// a one-shot overflow worker while fewer than `max_overflow` are running;
    /// beyond that waits for a check-in, up to `checkout_timeout`.
    pub async fn checkout(self: &Arc<Self>) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let deadline = started + self.config.checkout_timeout;
        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            // Register before scanning so a check-in in between is not lost.
            notified.as_mut().enable();

            match self.lock().scan() {
                Scan::Found(index, worker) => {
                    tracing::trace!(slot = index, worker = %worker.label(), "Checked out");
                    return Ok(Lease::new(worker, SlotIndex::Pooled(index), Arc::clone(self)));
                }
                Scan::AllDead if self.overflow.is_none() => {
                    return Err(PoolError::Exhausted {
                        size: self.config.size,
                    });
                }
                Scan::AllDead | Scan::NoneIdle => {}
            }

            if let Some(reservation) = OverflowReservation::take(self) {
                // The spawn runs on its own task so a cancelled checkout cannot
                // cut the controller exchange short. If nobody awaits the result,
                // the lease it produces is dropped and the reservation released.
                return tokio::spawn(reservation.attach())
                    .await
                    .map_err(|e| OverflowError::Rendezvous(std::io::Error::other(e)))?;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed();
                tracing::warn!(?waited, "Checkout timed out");
                return Err(PoolError::Saturated { waited });
            }
        }
    }

    /// Return a lease. Same as dropping it.
    pub fn checkin(&self, lease: Lease) {
        drop(lease);
    }

    pub(crate) fn return_worker(&self, slot: SlotIndex, mut worker: Worker) {
        match slot {
            SlotIndex::Overflow => {
                tracing::trace!(worker = %worker.label(), "Overflow worker released");
                drop(worker);
                self.release_overflow();
            }
            SlotIndex::Pooled(index) => {
                let state = worker.state();
                let mut table = self.lock();
                let Some(entry) = table.slots.get_mut(index) else {
                    tracing::error!(slot = index, "Check-in for unknown slot");
                    return;
                };
                match state {
                    WorkerState::Dead | WorkerState::Streaming => {
                        tracing::warn!(slot = index, worker = %worker.label(), ?state, "Slot poisoned - capacity reduced");
                        entry.state = WorkerState::Dead;
                        entry.worker = None;
                    }
                    WorkerState::Idle | WorkerState::Busy => {
                        worker.set_state(WorkerState::Idle);
                        entry.worker = Some(worker);
                        entry.state = WorkerState::Idle;
                        tracing::trace!(slot = index, "Checked in");
                    }
                }
                drop(table);
                self.returned.notify_one();
            }
        }
    }

    fn reserve_overflow(&self) -> bool {
        if self.overflow.is_none() {
            return false;
        }
        let max = self.config.max_overflow;
        self.overflow_active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release_overflow(&self) {
        self.overflow_active.fetch_sub(1, Ordering::AcqRel);
        self.returned.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let table = self.lock();
        let mut snapshot = PoolSnapshot {
            size: table.slots.len(),
            idle: 0,
            busy: 0,
            dead: 0,
            overflow_active: self.overflow_active.load(Ordering::Acquire),
            max_overflow: if self.overflow.is_some() {
                self.config.max_overflow
            } else {
                0
            },
        };
        for slot in &table.slots {
            match slot.state {
                WorkerState::Idle => snapshot.idle += 1,
                WorkerState::Busy | WorkerState::Streaming => snapshot.busy += 1,
                WorkerState::Dead => snapshot.dead += 1,
            }
        }
        snapshot
    }
}

/// One counted overflow worker. Released on drop unless it became a lease.
struct OverflowReservation {
    pool: Arc<Pool>,
    armed: bool,
}

impl OverflowReservation {
    fn take(pool: &Arc<Pool>) -> Option<Self> {
        pool.reserve_overflow().then(|| Self {
            pool: Arc::clone(pool),
            armed: true,
        })
    }

    async fn attach(mut self) -> Result<Lease, PoolError> {
        let Some(overflow) = self.pool.overflow.as_ref() else {
            return Err(PoolError::Exhausted {
                size: self.pool.config.size,
            });
        };
        let mut worker = overflow.spawn_worker().await?;
        worker.set_state(WorkerState::Busy);
        tracing::debug!(worker = %worker.label(), "Checked out overflow worker");
        // From here the lease owns the count and releases it on check-in.
        self.armed = false;
        Ok(Lease::new(worker, SlotIndex::Overflow, Arc::clone(&self.pool)))
    }
}

impl Drop for OverflowReservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_overflow();
        }
    }
}

/// Parent ends of one pooled worker, before activation.
struct ParentEnds {
    request: OwnedFd,
    response: OwnedFd,
    relay: OwnedFd,
}

/// Forked but not yet attached to a runtime.
pub struct ForkedPool {
    workers: Vec<ParentEnds>,
    controller: Option<ControllerEnds>,
    config: PoolConfig,
}

impl ForkedPool {
    /// Fork `config.size` workers plus the overflow controller.
    ///
    /// The registry is frozen, so every child sees the same table.
    pub fn fork(
        registry: Arc<CallbackRegistry>,
        engines: EngineFactory,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            workers.push(fork_pooled_worker(&registry, &engines)?);
            tracing::trace!(slot = index, "Forked worker");
        }
        let controller = if config.overflow_enabled() {
            Some(fork_controller(&registry, &engines)?)
        } else {
            None
        };
        tracing::info!(
            size = config.size,
            max_overflow = config.max_overflow,
            routes = registry.len(),
            "Worker pool forked"
        );
        Ok(Self {
            workers,
            controller,
            config,
        })
    }

    /// Attach the parent ends to the current tokio runtime.
    pub fn activate(self) -> Result<Arc<Pool>, PoolError> {
        let timeout = self.config.transaction_timeout;
        let slots = self
            .workers
            .into_iter()
            .enumerate()
            .map(|(index, ends)| {
                Worker::from_fds(
                    format!("worker-{index}"),
                    ends.request,
                    ends.response,
                    ends.relay,
                    timeout,
                )
                .map(Slot::idle)
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        let overflow = self
            .controller
            .map(|ends| OverflowClient::activate(ends, &self.config))
            .transpose()?;

        Ok(Arc::new(Pool {
            table: StdMutex::new(SlotTable { slots, cursor: 0 }),
            returned: Notify::new(),
            overflow,
            overflow_active: AtomicUsize::new(0),
            config: self.config,
        }))
    }
}

#[cfg(test)]
impl ForkedPool {
    /// Workers on threads of this process instead of forked children.
    pub(crate) fn threaded(registry: Arc<CallbackRegistry>, config: PoolConfig) -> Self {
        let workers = (0..config.size)
            .map(|_| {
                let (req_r, req_w) = pipe_pair().unwrap();
                let (res_r, res_w) = pipe_pair().unwrap();
                let (log_r, log_w) = pipe_pair().unwrap();
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let engines = crate::engine::native_engine();
                    let io = WorkerIo::new(
                        req_r.into_owned_fd(),
                        res_w.into_owned_fd(),
                        log_w.into_owned_fd(),
                    );
                    run_worker(&registry, engines(), io, WorkerMode::Pooled)
                });
                ParentEnds {
                    request: req_w.into_owned_fd(),
                    response: res_r.into_owned_fd(),
                    relay: log_r.into_owned_fd(),
                }
            })
            .collect();
        Self {
            workers,
            controller: None,
            config: config.with_max_overflow(0),
        }
    }
}

fn fork_pooled_worker(
    registry: &CallbackRegistry,
    engines: &EngineFactory,
) -> Result<ParentEnds, SpawnError> {
    let (req_r, req_w) = pipe_pair().map_err(SpawnError::Pipe)?;
    let (res_r, res_w) = pipe_pair().map_err(SpawnError::Pipe)?;
    let (log_r, log_w) = pipe_pair().map_err(SpawnError::Pipe)?;
    let keep = [req_r.as_raw_fd(), res_w.as_raw_fd(), log_w.as_raw_fd()];

    // The child ends move into the closure and are closed here when it drops.
    spawn_detached(&keep, move || {
        install_panic_hook();
        let io = WorkerIo::new(
            req_r.into_owned_fd(),
            res_w.into_owned_fd(),
            log_w.into_owned_fd(),
        );
        run_worker(registry, engines(), io, WorkerMode::Pooled)
    })?;

    Ok(ParentEnds {
        request: req_w.into_owned_fd(),
        response: res_r.into_owned_fd(),
        relay: log_r.into_owned_fd(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{FrameReader, FrameWriter, PipeFd};
    use crate::bridge::protocol::{Response, WorkerCommand};

    /// Pool over hand-driven pipes; no processes are forked.
    struct FakeChild {
        _commands: FrameReader<WorkerCommand>,
        _responses: FrameWriter<Response>,
        _relay: PipeFd,
    }

    fn fake_pool(size: usize, checkout_timeout: Duration) -> (Arc<Pool>, Vec<FakeChild>) {
        let mut workers = Vec::new();
        let mut children = Vec::new();
        for _ in 0..size {
            let (req_r, req_w) = pipe_pair().unwrap();
            let (res_r, res_w) = pipe_pair().unwrap();
            let (log_r, log_w) = pipe_pair().unwrap();
            workers.push(ParentEnds {
                request: req_w.into_owned_fd(),
                response: res_r.into_owned_fd(),
                relay: log_r.into_owned_fd(),
            });
            children.push(FakeChild {
                _commands: FrameReader::new(req_r),
                _responses: FrameWriter::new(res_w),
                _relay: log_w,
            });
        }
        let config = PoolConfig::new(size)
            .with_max_overflow(0)
            .with_checkout_timeout(checkout_timeout);
        let pool = ForkedPool {
            workers,
            controller: None,
            config,
        }
        .activate()
        .unwrap();
        (pool, children)
    }

    #[tokio::test]
    async fn checkouts_return_distinct_slots_round_robin() {
        let (pool, _children) = fake_pool(3, Duration::from_millis(20));

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        let c = pool.checkout().await.unwrap();
        assert_eq!(
            [a.slot(), b.slot(), c.slot()],
            [SlotIndex::Pooled(0), SlotIndex::Pooled(1), SlotIndex::Pooled(2)]
        );
        assert_eq!(pool.snapshot().busy, 3);

        // Cursor moved past slot 2; slot 1 is the only one free.
        pool.checkin(b);
        let d = pool.checkout().await.unwrap();
        assert_eq!(d.slot(), SlotIndex::Pooled(1));
        drop((a, c, d));
        assert_eq!(pool.snapshot().idle, 3);
    }

    #[tokio::test]
    async fn saturated_pool_times_out_without_overflow() {
        let (pool, _children) = fake_pool(1, Duration::from_millis(20));
        let _held = pool.checkout().await.unwrap();

        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, PoolError::Saturated { .. }), "{err}");
    }

    #[tokio::test]
    async fn waiting_checkout_wakes_on_checkin() {
        let (pool, _children) = fake_pool(1, Duration::from_secs(5));
        let held = pool.checkout().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout().await.map(|l| l.slot()) })
        };
        tokio::task::yield_now().await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), SlotIndex::Pooled(0));
    }

    #[tokio::test]
    async fn dead_and_streaming_workers_poison_their_slot() {
        let (pool, _children) = fake_pool(2, Duration::from_millis(20));

        let mut a = pool.checkout().await.unwrap();
        a.worker().set_state(WorkerState::Dead);
        let mut b = pool.checkout().await.unwrap();
        b.worker().set_state(WorkerState::Streaming);
        drop((a, b));

        let snapshot = pool.snapshot();
        assert_eq!((snapshot.idle, snapshot.dead), (0, 2));

        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { size: 2 }), "{err}");
    }

    #[tokio::test]
    async fn snapshot_counts() {
        let (pool, _children) = fake_pool(2, Duration::from_millis(20));
        let _lease = pool.checkout().await.unwrap();
        assert_eq!(
            pool.snapshot(),
            PoolSnapshot {
                size: 2,
                idle: 1,
                busy: 1,
                dead: 0,
                overflow_active: 0,
                max_overflow: 0,
            }
        );
    }
}
