//! Coordinator-side handle to one worker process.
//!
//! Holds the parent ends of the worker's three pipes. A transaction writes one
//! command and then waits on the response pipe and the relay together, so log
//! lines reach the coordinator's subscriber while the callback is still running.

use std::os::unix::io::OwnedFd;
use std::time::Duration;

use futures::{SinkExt, StreamExt};

use crate::bridge::channel::{
    AsyncFrameReader, AsyncFrameWriter, ChannelError, async_reader, async_receiver, async_writer,
};
use crate::bridge::protocol::{Ident, Response, WorkerCommand};
use crate::relay::RelayReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    /// An execution context is held open for a multi-round exchange.
    Streaming,
    /// Terminal: the process exited or the protocol broke.
    Dead,
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("worker {worker} is dead")]
    WorkerDead { worker: String },

    #[error("worker {worker} closed its channel")]
    PeerClosed { worker: String },

    #[error("protocol error talking to worker {worker}: {source}")]
    Protocol {
        worker: String,
        #[source]
        source: ChannelError,
    },

    #[error("worker {worker} did not answer within {timeout:?}")]
    Timeout { worker: String, timeout: Duration },
}

/// State change an `Ack` to the command in flight brings.
#[derive(Debug, Clone, Copy)]
enum OnAck {
    Open(Ident),
    Close,
}

/// Parent ends of one worker's pipes, plus its state.
pub struct Worker {
    label: String,
    requests: AsyncFrameWriter<WorkerCommand>,
    responses: AsyncFrameReader<Response>,
    relay: RelayReader,
    state: WorkerState,
    timeout: Option<Duration>,
    /// Commands written whose responses have not been read yet.
    outstanding: usize,
    /// A write was abandoned part-way; the request pipe may hold half a frame.
    torn: bool,
    on_ack: Option<OnAck>,
    open_stream: Option<Ident>,
}

impl Worker {
    /// Wrap the parent ends. Must run inside a tokio runtime.
    pub fn from_fds(
        label: impl Into<String>,
        request: OwnedFd,
        response: OwnedFd,
        relay: OwnedFd,
        timeout: Option<Duration>,
    ) -> std::io::Result<Self> {
        let label = label.into();
        Ok(Self {
            requests: async_writer(request)?,
            responses: async_reader(response)?,
            relay: RelayReader::new(async_receiver(relay)?, label.clone()),
            label,
            state: WorkerState::Idle,
            timeout,
            outstanding: 0,
            torn: false,
            on_ack: None,
            open_stream: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == WorkerState::Dead
    }

    pub(crate) fn set_state(&mut self, state: WorkerState) {
        if self.state != WorkerState::Dead {
            self.state = state;
        }
    }

    /// True when no reply is pending and no write was cut short.
    pub fn is_settled(&self) -> bool {
        self.outstanding == 0 && !self.torn
    }

    /// Write one command frame.
    pub async fn send(&mut self, command: WorkerCommand) -> Result<(), TransactionError> {
        self.ensure_alive()?;
        if self.torn {
            return Err(self.torn_write());
        }
        self.torn = true;
        let sent = self.requests.send(command).await;
        self.torn = false;
        match sent.map_err(ChannelError::from_io) {
            Ok(()) => {
                self.outstanding += 1;
                Ok(())
            }
            // Rejected by the encoder before any byte reached the pipe.
            Err(ChannelError::Oversized(too_large)) => Err(TransactionError::Protocol {
                worker: self.label.clone(),
                source: ChannelError::Oversized(too_large),
            }),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Wait for the next response frame, relaying log lines meanwhile.
    pub async fn recv(&mut self) -> Result<Response, TransactionError> {
        self.ensure_alive()?;

        let responses = &mut self.responses;
        let relay = &mut self.relay;
        let wait = async {
            loop {
                tokio::select! {
                    biased;
                    frame = responses.next() => {
                        return match frame {
                            Some(Ok(response)) => Ok(response),
                            Some(Err(e)) => Err(ChannelError::from_io(e)),
                            None => Err(ChannelError::PeerClosed),
                        };
                    }
                    pumped = relay.pump() => {
                        if let Err(e) = pumped {
                            tracing::debug!(error = %e, "Relay read failed");
                        }
                    }
                }
            }
        };

        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.state = WorkerState::Dead;
                    tracing::warn!(worker = %self.label, ?timeout, "Worker timed out");
                    return Err(TransactionError::Timeout {
                        worker: self.label.clone(),
                        timeout,
                    });
                }
            },
            None => wait.await,
        };

        if let Err(e) = self.relay.drain() {
            tracing::debug!(error = %e, "Relay drain failed");
        }
        match outcome {
            Ok(response) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if self.outstanding == 0
                    && let Some(effect) = self.on_ack.take()
                    && response == Response::Ack
                {
                    match effect {
                        OnAck::Open(ident) => {
                            self.open_stream = Some(ident);
                            self.set_state(WorkerState::Streaming);
                        }
                        OnAck::Close => {
                            self.open_stream = None;
                            self.set_state(WorkerState::Busy);
                        }
                    }
                }
                Ok(response)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read and discard replies to commands whose caller went away.
    ///
    /// A torn write cannot be recovered and kills the worker.
    pub async fn settle(&mut self) -> Result<(), TransactionError> {
        if self.torn {
            return Err(self.torn_write());
        }
        while self.outstanding > 0 {
            let stale = self.recv().await?;
            tracing::debug!(worker = %self.label, ?stale, "Discarded reply to an abandoned command");
        }
        Ok(())
    }

    /// Settle, then close a stream the worker still holds open, so the worker
    /// can go back to the pool.
    pub(crate) async fn recover(&mut self) -> Result<(), TransactionError> {
        self.settle().await?;
        let Some(ident) = self.open_stream else {
            return Ok(());
        };
        match self.transaction(WorkerCommand::StopStreaming { ident }).await? {
            Response::Ack => Ok(()),
            other => {
                tracing::warn!(worker = %self.label, response = ?other, "Stream close not acknowledged");
                self.state = WorkerState::Dead;
                Err(TransactionError::WorkerDead {
                    worker: self.label.clone(),
                })
            }
        }
    }

    /// Send one command and wait for its response.
    ///
    /// Replies still owed to an abandoned earlier command are discarded first.
    /// Tracks the streaming state: an acknowledged `StartStreaming` moves the
    /// worker to `Streaming`, an acknowledged `StopStreaming` back to `Busy`.
    pub async fn transaction(&mut self, command: WorkerCommand) -> Result<Response, TransactionError> {
        tracing::trace!(worker = %self.label, kind = command.kind(), ident = %command.ident(), "Transaction");
        self.settle().await?;
        let on_ack = match command {
            WorkerCommand::StartStreaming { ident } => Some(OnAck::Open(ident)),
            WorkerCommand::StopStreaming { .. } => Some(OnAck::Close),
            WorkerCommand::Call { .. } | WorkerCommand::Pull { .. } => None,
        };
        self.send(command).await?;
        self.on_ack = on_ack;
        self.recv().await
    }

    fn ensure_alive(&self) -> Result<(), TransactionError> {
        if self.is_dead() {
            Err(TransactionError::WorkerDead {
                worker: self.label.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn torn_write(&mut self) -> TransactionError {
        self.fail(ChannelError::Io(std::io::Error::other(
            "an earlier write was abandoned mid-frame",
        )))
    }

    fn fail(&mut self, error: ChannelError) -> TransactionError {
        self.state = WorkerState::Dead;
        tracing::warn!(worker = %self.label, error = %error, "Worker marked dead");
        match error {
            ChannelError::PeerClosed => TransactionError::PeerClosed {
                worker: self.label.clone(),
            },
            source => TransactionError::Protocol {
                worker: self.label.clone(),
                source,
            },
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("label", &self.label)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
