//! Overflow controller: one-shot workers for load beyond the fixed pool.
//!
//! The controller is a standing process forked next to the pooled workers. For
//! every spill-over the coordinator creates three FIFOs and sends their paths;
//! the controller forks a detached one-shot worker that opens them and runs a
//! single call or a single stream. The controller answers each request so a
//! failed fork surfaces to the caller instead of leaving it blocked on a FIFO.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::bridge::channel::{
    AsyncFrameReader, AsyncFrameWriter, ChannelError, FrameReader, FrameWriter, async_reader,
    async_writer, pipe_pair,
};
use crate::bridge::fifo::{RendezvousPaths, open_worker_ends};
use crate::bridge::protocol::{OverflowReply, OverflowRequest};
use crate::config::PoolConfig;
use crate::engine::EngineFactory;
use crate::handle::Worker;
use crate::process::{SpawnError, spawn_detached};
use crate::registry::CallbackRegistry;
use crate::worker::{WorkerIo, WorkerMode, install_panic_hook, run_worker};

const OVERFLOW_TARGET: &str = "dreadnought::overflow";

#[derive(Debug, thiserror::Error)]
pub enum OverflowError {
    #[error("failed to prepare rendezvous FIFOs: {0}")]
    Fifo(#[source] std::io::Error),

    #[error("overflow controller is gone")]
    ControllerGone,

    #[error("overflow controller channel failed: {0}")]
    Channel(#[from] ChannelError),

    #[error("overflow controller could not spawn a worker: {0}")]
    SpawnFailed(String),

    #[error("rendezvous with overflow worker failed: {0}")]
    Rendezvous(#[source] std::io::Error),

    #[error("overflow worker did not rendezvous within {0:?}")]
    RendezvousTimeout(Duration),
}

/// Parent ends of the controller's command and reply pipes, before activation.
pub struct ControllerEnds {
    commands: OwnedFd,
    replies: OwnedFd,
}

/// Fork the standing controller. Call before any runtime threads exist.
pub fn fork_controller(
    registry: &Arc<CallbackRegistry>,
    engines: &EngineFactory,
) -> Result<ControllerEnds, SpawnError> {
    let (cmd_r, cmd_w) = pipe_pair().map_err(SpawnError::Pipe)?;
    let (ack_r, ack_w) = pipe_pair().map_err(SpawnError::Pipe)?;
    let keep = [cmd_r.as_raw_fd(), ack_w.as_raw_fd()];
    let registry = Arc::clone(registry);
    let engines = Arc::clone(engines);

    spawn_detached(&keep, move || {
        install_panic_hook();
        run_controller(
            &registry,
            &engines,
            FrameReader::new(cmd_r),
            FrameWriter::new(ack_w),
        )
    })?;

    Ok(ControllerEnds {
        commands: cmd_w.into_owned_fd(),
        replies: ack_r.into_owned_fd(),
    })
}

/// Controller loop: one detached one-shot worker per request.
fn run_controller(
    registry: &CallbackRegistry,
    engines: &EngineFactory,
    mut requests: FrameReader<OverflowRequest>,
    mut replies: FrameWriter<OverflowReply>,
) -> i32 {
    tracing::debug!(target: OVERFLOW_TARGET, pid = std::process::id(), "Overflow controller ready");
    loop {
        let request = match requests.recv() {
            Ok(request) => request,
            Err(ChannelError::PeerClosed) => return 0,
            Err(e) => {
                tracing::error!(target: OVERFLOW_TARGET, error = %e, "Overflow controller stopped");
                return 1;
            }
        };
        let OverflowRequest::Spawn {
            request_fifo,
            response_fifo,
            relay_fifo,
        } = request;

        let reply = match spawn_detached(&[], || {
            serve_one_shot(registry, engines, &request_fifo, &response_fifo, &relay_fifo)
        }) {
            Ok(()) => OverflowReply::Spawned,
            Err(e) => {
                tracing::error!(target: OVERFLOW_TARGET, error = %e, "Failed to fork overflow worker");
                OverflowReply::Failed {
                    reason: e.to_string(),
                }
            }
        };
        if replies.send(reply).is_err() {
            return 0;
        }
    }
}

fn serve_one_shot(
    registry: &CallbackRegistry,
    engines: &EngineFactory,
    request: &Path,
    response: &Path,
    relay: &Path,
) -> i32 {
    install_panic_hook();
    match open_worker_ends(request, response, relay) {
        Ok(ends) => {
            let io = WorkerIo::new(ends.request, ends.response, ends.relay);
            run_worker(registry, engines(), io, WorkerMode::OneShot)
        }
        Err(e) => {
            tracing::error!(target: OVERFLOW_TARGET, error = %e, "Overflow worker could not open its FIFOs");
            1
        }
    }
}

struct ControllerChannel {
    commands: AsyncFrameWriter<OverflowRequest>,
    replies: AsyncFrameReader<OverflowReply>,
    /// Replies to requests whose caller was cancelled before reading them.
    owed: usize,
}

/// Coordinator-side connection to the controller.
pub struct OverflowClient {
    channel: Mutex<ControllerChannel>,
    fifo_dir: PathBuf,
    rendezvous_timeout: Duration,
    transaction_timeout: Option<Duration>,
    spawned: AtomicU64,
}

impl OverflowClient {
    /// Wrap the controller pipes. Must run inside a tokio runtime.
    pub fn activate(ends: ControllerEnds, config: &PoolConfig) -> std::io::Result<Self> {
        Ok(Self {
            channel: Mutex::new(ControllerChannel {
                commands: async_writer(ends.commands)?,
                replies: async_reader(ends.replies)?,
                owed: 0,
            }),
            fifo_dir: config.fifo_dir.clone(),
            rendezvous_timeout: config.rendezvous_timeout,
            transaction_timeout: config.transaction_timeout,
            spawned: AtomicU64::new(0),
        })
    }

    /// Have the controller fork a one-shot worker and rendezvous with it.
    ///
    /// Cancelling this leaves a forked worker blocked on FIFOs that are never
    /// opened; [`Pool`](crate::Pool) runs it on its own task.
    pub async fn spawn_worker(&self) -> Result<Worker, OverflowError> {
        let paths = RendezvousPaths::create(&self.fifo_dir).map_err(OverflowError::Fifo)?;
        self.request_spawn(paths.spawn_request()).await?;

        let paths = Arc::new(paths);
        let mut opener = {
            let paths = Arc::clone(&paths);
            tokio::task::spawn_blocking(move || paths.open_coordinator_ends())
        };
        let ends = match tokio::time::timeout(self.rendezvous_timeout, &mut opener).await {
            Ok(Ok(Ok(ends))) => ends,
            Ok(Ok(Err(e))) => return Err(OverflowError::Rendezvous(e)),
            Ok(Err(join)) => return Err(OverflowError::Rendezvous(std::io::Error::other(join))),
            Err(_) => {
                // Release the opener thread (and the worker, if it exists), then
                // close whatever it opened.
                let held = paths.unblock();
                let _ = opener.await;
                drop(held);
                tracing::warn!(timeout = ?self.rendezvous_timeout, "Overflow worker missed the rendezvous");
                return Err(OverflowError::RendezvousTimeout(self.rendezvous_timeout));
            }
        };

        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let label = format!("overflow-{n}");
        tracing::debug!(worker = %label, "Overflow worker attached");
        Worker::from_fds(
            label,
            ends.request,
            ends.response,
            ends.relay,
            self.transaction_timeout,
        )
        .map_err(OverflowError::Rendezvous)
    }

    async fn request_spawn(&self, request: OverflowRequest) -> Result<(), OverflowError> {
        let mut channel = self.channel.lock().await;
        while channel.owed > 0 {
            let stale = next_reply(&mut channel.replies).await;
            channel.owed -= 1;
            tracing::debug!(reply = ?stale, "Discarded controller reply for a cancelled spawn");
        }

        channel
            .commands
            .send(request)
            .await
            .map_err(|e| OverflowError::Channel(ChannelError::from_io(e)))?;
        channel.owed += 1;
        let reply = next_reply(&mut channel.replies).await;
        channel.owed -= 1;
        match reply? {
            OverflowReply::Spawned => Ok(()),
            OverflowReply::Failed { reason } => Err(OverflowError::SpawnFailed(reason)),
        }
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

async fn next_reply(
    replies: &mut AsyncFrameReader<OverflowReply>,
) -> Result<OverflowReply, OverflowError> {
    match replies.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(e)) => Err(OverflowError::Channel(ChannelError::from_io(e))),
        None => Err(OverflowError::ControllerGone),
    }
}
