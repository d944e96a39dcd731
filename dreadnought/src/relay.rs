//! Log relay: free-text log lines from a worker back to the coordinator.
//!
//! Each worker owns the write end of one pipe. Route callbacks log through a
//! [`RouteLogger`] and worker internals log through `tracing` with a
//! [`RelayLayer`] installed, both landing on the same pipe as
//! `"<timestamp> <name> [<LEVEL>] <message>"` lines. The coordinator polls the
//! read end alongside the response channel and re-emits each line through its
//! own subscriber.

use std::cell::Cell;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::os::unix::io::AsFd;
use std::sync::{Arc, Mutex, PoisonError};

use nix::errno::Errno;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::channel::PipeFd;

/// Target under which relayed lines are re-emitted in the coordinator.
pub const ROUTE_TARGET: &str = "dreadnought::route";

const READ_CHUNK: usize = 8 * 1024;
/// Longest relay line buffered while waiting for a newline.
const MAX_LINE: usize = 64 * 1024;

/// Worker-side write end of the relay.
#[derive(Debug)]
pub struct RelaySink {
    fd: Mutex<PipeFd>,
}

impl RelaySink {
    pub fn new(fd: PipeFd) -> Arc<Self> {
        Arc::new(Self { fd: Mutex::new(fd) })
    }

    /// Write one tagged line per line of `message`.
    ///
    /// Errors are dropped: a coordinator that stopped reading also stops sending
    /// requests, and the worker exits on its own once the request pipe closes.
    pub fn write(&self, name: &str, level: Level, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
        let mut out = String::with_capacity(message.len() + name.len() + 40);
        for line in message.lines() {
            let _ = writeln!(out, "{stamp} {name} [{level}] {line}");
        }
        if out.is_empty() {
            let _ = writeln!(out, "{stamp} {name} [{level}] ");
        }
        let mut fd = self.fd.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = fd.write_all(out.as_bytes());
    }
}

/// Logger handed to a route callback, named after the route.
pub struct RouteLogger {
    name: String,
    level: Cell<Level>,
    sink: Arc<RelaySink>,
}

impl RouteLogger {
    pub fn new(name: impl Into<String>, sink: Arc<RelaySink>) -> Self {
        Self {
            name: name.into(),
            level: Cell::new(Level::DEBUG),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> Level {
        self.level.get()
    }

    /// Lines more verbose than `level` are dropped before reaching the pipe.
    pub fn set_level(&self, level: Level) {
        self.level.set(level);
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level.get()
    }

    pub fn log(&self, level: Level, message: impl AsRef<str>) {
        if self.enabled(level) {
            self.sink.write(&self.name, level, message.as_ref());
        }
    }

    pub fn trace(&self, message: impl AsRef<str>) {
        self.log(Level::TRACE, message);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(Level::DEBUG, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(Level::WARN, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Level::ERROR, message);
    }
}

/// Tracing layer for worker processes.
///
/// Ships events over the relay, keeping target and level, so worker diagnostics
/// reach the coordinator's subscriber the same way route logs do.
pub struct RelayLayer {
    sink: Arc<RelaySink>,
}

impl RelayLayer {
    pub fn new(sink: Arc<RelaySink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for RelayLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.sink
            .write(metadata.target(), *metadata.level(), &visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// One relay line split into its parts.
#[derive(Debug, PartialEq, Eq)]
pub struct RelayLine<'a> {
    pub level: Level,
    pub logger: &'a str,
    pub message: &'a str,
}

/// Parse `"<date> <time> <name> [<LEVEL>] <message>"`.
///
/// Route names may themselves contain brackets (`[POST]/echo`), so the level tag
/// is the first bracketed token that parses as a level. Lines that do not match
/// are passed through whole at INFO.
pub fn parse_line(line: &str) -> RelayLine<'_> {
    for (idx, _) in line.match_indices(" [") {
        let rest = &line[idx + 2..];
        let Some(close) = rest.find(']') else { break };
        let Ok(level) = rest[..close].parse::<Level>() else {
            continue;
        };
        let after = &rest[close + 1..];
        if !(after.is_empty() || after.starts_with(' ')) {
            continue;
        }
        let head = &line[..idx];
        // Skip date and time.
        let logger = head.splitn(3, ' ').nth(2).unwrap_or(head);
        return RelayLine {
            level,
            logger,
            message: after.strip_prefix(' ').unwrap_or(after),
        };
    }
    RelayLine {
        level: Level::INFO,
        logger: "",
        message: line,
    }
}

/// Re-emit a relay line through the coordinator's subscriber.
pub fn emit_line(line: &str, worker: &str) {
    let RelayLine {
        level,
        logger,
        message,
    } = parse_line(line);

    macro_rules! emit {
        ($lvl:expr) => {
            tracing::event!(target: ROUTE_TARGET, $lvl, logger = %logger, worker = %worker, "{}", message)
        };
    }

    match level {
        Level::ERROR => emit!(Level::ERROR),
        Level::WARN => emit!(Level::WARN),
        Level::INFO => emit!(Level::INFO),
        Level::DEBUG => emit!(Level::DEBUG),
        _ => emit!(Level::TRACE),
    }
}

/// Coordinator-side read end of one worker's relay.
pub struct RelayReader {
    rx: pipe::Receiver,
    pending: Vec<u8>,
    worker: String,
    closed: bool,
}

impl RelayReader {
    pub fn new(rx: pipe::Receiver, worker: impl Into<String>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            worker: worker.into(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for relay data and emit every complete line.
    ///
    /// Cancel-safe: nothing is consumed unless the read completes. Once the
    /// write end is gone this never resolves, so it can sit in a `select!`
    /// next to the response channel.
    pub async fn pump(&mut self) -> io::Result<()> {
        if self.closed {
            return std::future::pending().await;
        }
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.rx.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };
        if n == 0 {
            self.close();
        } else {
            self.ingest(&buf[..n]);
        }
        Ok(())
    }

    /// Emit whatever is already in the pipe without waiting.
    ///
    /// Reads the descriptor directly: the reactor may not have observed the
    /// readiness yet for bytes written just before the response frame.
    pub fn drain(&mut self) -> io::Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        while !self.closed {
            match nix::unistd::read(self.rx.as_fd(), &mut buf) {
                Ok(0) => self.close(),
                Ok(n) => self.ingest(&buf[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            emit_line(&String::from_utf8_lossy(&line[..pos]), &self.worker);
        }
        // Output without newlines is cut into lines of at most MAX_LINE bytes.
        while self.pending.len() >= MAX_LINE {
            let line: Vec<u8> = self.pending.drain(..MAX_LINE).collect();
            emit_line(&String::from_utf8_lossy(&line), &self.worker);
        }
    }

    fn close(&mut self) {
        self.closed = true;
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            emit_line(&String::from_utf8_lossy(&rest), &self.worker);
        }
    }
}
