//! Worker process - the child side of the coordinator/worker protocol.
//!
//! Runs without an async runtime: the process was forked from the coordinator,
//! so it blocks on its request pipe, executes one command at a time and writes
//! exactly one response per command. The coordinator side is in `handle.rs`.
//!
//! Architecture:
//! - Request pipe: `WorkerCommand` frames, strictly in order, one outstanding
//! - Response pipe: one `Response` frame per command
//! - Relay pipe: route and worker log lines
//!
//! A hangup on the request pipe is the only shutdown signal.

use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use nix::poll::PollTimeout;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::bridge::channel::{ChannelError, FrameReader, FrameWriter, PipeFd, Readiness};
use crate::bridge::protocol::{Ident, Request, Response, WorkerCommand};
use crate::engine::{ExecutionScope, ScriptEngine, invoke_guarded, panic_message};
use crate::registry::CallbackRegistry;
use crate::relay::{RelayLayer, RelaySink, RouteLogger};

/// Filter directive for worker-internal diagnostics shipped over the relay.
pub const WORKER_LOG_ENV: &str = "DN_WORKER_LOG";

const WORKER_TARGET: &str = "dreadnought::worker";

/// How long a worker lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Serve until the request pipe closes.
    Pooled,
    /// Exit after one call, or after one stream has been stopped.
    OneShot,
}

/// Worker-side pipe ends.
pub struct WorkerIo {
    pub requests: FrameReader<WorkerCommand>,
    pub responses: FrameWriter<Response>,
    pub relay: Arc<RelaySink>,
}

impl WorkerIo {
    pub fn new(request: OwnedFd, response: OwnedFd, relay: OwnedFd) -> Self {
        Self {
            requests: FrameReader::new(PipeFd::new(request)),
            responses: FrameWriter::new(PipeFd::new(response)),
            relay: RelaySink::new(PipeFd::new(relay)),
        }
    }
}

/// Route panic reports to the relay instead of the inherited stderr.
///
/// Process-wide; only call this in a worker process.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!(" at {}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: WORKER_TARGET, "panic{}: {}", location, panic_message(info.payload()));
    }));
}

/// Serve commands until the coordinator hangs up. Returns the exit code.
pub fn run_worker(
    registry: &CallbackRegistry,
    engine: Box<dyn ScriptEngine>,
    io: WorkerIo,
    mode: WorkerMode,
) -> i32 {
    let filter = EnvFilter::try_from_env(WORKER_LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber =
        tracing_subscriber::registry().with(RelayLayer::new(Arc::clone(&io.relay)).with_filter(filter));

    tracing::subscriber::with_default(subscriber, || {
        let WorkerIo {
            mut requests,
            mut responses,
            relay,
        } = io;
        let mut session = Session::new(registry, engine, relay, mode);
        match session.serve(&mut requests, &mut responses) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(target: WORKER_TARGET, error = %e, "Worker stopped");
                1
            }
        }
    })
}

struct Session<'a> {
    registry: &'a CallbackRegistry,
    engine: Box<dyn ScriptEngine>,
    relay: Arc<RelaySink>,
    /// One logger per route, so `set_level` sticks across invocations.
    loggers: HashMap<Ident, RouteLogger>,
    mode: WorkerMode,
    /// Ident whose stream holds the execution context.
    open_stream: Option<Ident>,
}

impl<'a> Session<'a> {
    fn new(
        registry: &'a CallbackRegistry,
        engine: Box<dyn ScriptEngine>,
        relay: Arc<RelaySink>,
        mode: WorkerMode,
    ) -> Self {
        Self {
            registry,
            engine,
            relay,
            loggers: HashMap::new(),
            mode,
            open_stream: None,
        }
    }

    fn serve(
        &mut self,
        requests: &mut FrameReader<WorkerCommand>,
        responses: &mut FrameWriter<Response>,
    ) -> Result<(), ChannelError> {
        tracing::debug!(target: WORKER_TARGET, pid = std::process::id(), mode = ?self.mode, "Worker ready");
        loop {
            match requests.wait(PollTimeout::NONE)? {
                Readiness::Readable => {}
                Readiness::Hangup => {
                    tracing::debug!(target: WORKER_TARGET, "Request channel closed");
                    return Ok(());
                }
                Readiness::TimedOut => continue,
            }

            let (response, finished) = match requests.recv() {
                Ok(command) => self.handle(command),
                Err(ChannelError::PeerClosed) => return Ok(()),
                // The frame was consumed, so the stream is still in sync.
                Err(ChannelError::Malformed(e)) => (
                    Response::Fault {
                        exc: format!("malformed command: {e}"),
                    },
                    false,
                ),
                Err(e) => return Err(e),
            };

            match responses.send(response) {
                Ok(()) => {}
                Err(ChannelError::Oversized(too_large)) => {
                    responses.send(fault(format!("response rejected: {too_large}")))?;
                }
                Err(ChannelError::PeerClosed) => return Ok(()),
                Err(e) => return Err(e),
            }

            if finished && self.mode == WorkerMode::OneShot {
                tracing::debug!(target: WORKER_TARGET, "One-shot transaction complete");
                return Ok(());
            }
        }
    }

    /// Returns the response and whether a whole transaction has ended.
    fn handle(&mut self, command: WorkerCommand) -> (Response, bool) {
        tracing::trace!(target: WORKER_TARGET, kind = command.kind(), ident = %command.ident(), "Command received");
        match command {
            WorkerCommand::Call { request } => (self.call(&request), true),
            WorkerCommand::StartStreaming { ident } => {
                let response = self.start_stream(ident);
                let finished = response != Response::Ack;
                (response, finished)
            }
            WorkerCommand::Pull { request } => (self.pull(&request), false),
            WorkerCommand::StopStreaming { ident } => (self.stop_stream(ident), true),
        }
    }

    fn call(&mut self, request: &Request) -> Response {
        if let Some(open) = self.open_stream {
            return fault(format!(
                "stream for ident {open} is open; call for ident {} rejected",
                request.ident
            ));
        }
        let registry = self.registry;
        let entry = match registry.lookup(request.ident) {
            Ok(entry) => entry,
            Err(e) => return fault(e.to_string()),
        };
        let logger = self
            .loggers
            .entry(entry.ident)
            .or_insert_with(|| RouteLogger::new(entry.logger_name.clone(), Arc::clone(&self.relay)));

        match ExecutionScope::enter(self.engine.as_mut()) {
            Ok(mut scope) => scope.invoke(entry, logger, request),
            Err(e) => fault(format!("{e:?}")),
        }
    }

    fn start_stream(&mut self, ident: Ident) -> Response {
        if let Some(open) = self.open_stream {
            return fault(format!("stream for ident {open} is already open"));
        }
        if let Err(e) = self.registry.lookup(ident) {
            return fault(e.to_string());
        }
        if let Err(e) = self.engine.enter() {
            return fault(format!("{e:?}"));
        }
        self.open_stream = Some(ident);
        Response::Ack
    }

    fn pull(&mut self, request: &Request) -> Response {
        match self.open_stream {
            Some(open) if open == request.ident => {}
            Some(open) => {
                return fault(format!(
                    "pull for ident {} while stream {open} is open",
                    request.ident
                ));
            }
            None => {
                return fault(format!(
                    "pull for ident {} without an open stream",
                    request.ident
                ));
            }
        }
        let registry = self.registry;
        let entry = match registry.lookup(request.ident) {
            Ok(entry) => entry,
            Err(e) => return fault(e.to_string()),
        };
        let logger = self
            .loggers
            .entry(entry.ident)
            .or_insert_with(|| RouteLogger::new(entry.logger_name.clone(), Arc::clone(&self.relay)));
        invoke_guarded(self.engine.as_mut(), entry, logger, request)
    }

    fn stop_stream(&mut self, ident: Ident) -> Response {
        match self.open_stream.take() {
            Some(open) => {
                if open != ident {
                    tracing::warn!(target: WORKER_TARGET, %open, %ident, "Stop names a different stream");
                }
                self.engine.leave();
            }
            None => tracing::warn!(target: WORKER_TARGET, %ident, "Stop without an open stream"),
        }
        Response::Ack
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.open_stream.take().is_some() {
            self.engine.leave();
        }
    }
}

fn fault(exc: String) -> Response {
    tracing::warn!(target: WORKER_TARGET, %exc, "Rejecting command");
    Response::Fault { exc }
}
