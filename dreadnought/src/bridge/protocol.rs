//! Wire protocol types for coordinator-worker communication.
//!
//! Three channels per worker:
//! - **Request channel**: `WorkerCommand` frames, coordinator to worker
//! - **Response channel**: one `Response` frame per command, worker to coordinator
//! - **Relay**: free-text log lines (see `crate::relay`), not framed
//!
//! The overflow controller has its own pair carrying `OverflowRequest`/`OverflowReply`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Index of a registered callback.
///
/// Assigned in registration order and never reused, so the number doubles as the
/// position in the frozen registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ident(usize);

impl Ident {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP method filter attached to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method {0:?}, expected one of GET, POST, PUT, DELETE")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// One inbound call, as handed to a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub ident: Ident,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default)]
    pub qs_params: Map<String, Value>,
    #[serde(default)]
    pub post_data: Map<String, Value>,
    #[serde(default)]
    pub streaming: bool,
    /// Running total of chunk bytes already delivered on this stream.
    #[serde(default)]
    pub bytes_read: u64,
}

impl Request {
    pub fn new(ident: Ident, path: impl Into<String>) -> Self {
        Self {
            ident,
            path: path.into(),
            method: None,
            qs_params: Map::new(),
            post_data: Map::new(),
            streaming: false,
            bytes_read: 0,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_qs_params(mut self, qs_params: Map<String, Value>) -> Self {
        self.qs_params = qs_params;
        self
    }

    pub fn with_post_data(mut self, post_data: Map<String, Value>) -> Self {
        self.post_data = post_data;
        self
    }
}

/// Commands from coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Single execute-and-reply cycle.
    Call { request: Request },

    /// Open an execution context for a multi-round exchange.
    StartStreaming { ident: Ident },

    /// Fetch the next chunk of the open stream.
    Pull { request: Request },

    StopStreaming { ident: Ident },
}

impl WorkerCommand {
    pub fn ident(&self) -> Ident {
        match self {
            WorkerCommand::Call { request } | WorkerCommand::Pull { request } => request.ident,
            WorkerCommand::StartStreaming { ident } | WorkerCommand::StopStreaming { ident } => {
                *ident
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerCommand::Call { .. } => "call",
            WorkerCommand::StartStreaming { .. } => "start_streaming",
            WorkerCommand::Pull { .. } => "pull",
            WorkerCommand::StopStreaming { .. } => "stop_streaming",
        }
    }
}

/// Exactly one of these answers every `WorkerCommand`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Data { data: Value },

    /// Application-declared failure. Not a fault: the worker is healthy.
    Error { error: String },

    /// The callback raised or panicked, or the worker rejected the command.
    Fault { exc: String },

    /// Acknowledges `StartStreaming`/`StopStreaming`.
    Ack,
}

impl Response {
    /// True for a `Data` frame whose payload marks the end of a stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Response::Data { data } if is_empty_payload(data))
    }
}

/// Null, `""`, `[]` and `{}` all terminate a stream.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Coordinator to overflow controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverflowRequest {
    /// Fork a one-shot worker that opens these FIFOs in order.
    Spawn {
        request_fifo: PathBuf,
        response_fifo: PathBuf,
        relay_fifo: PathBuf,
    },
}

/// Overflow controller to coordinator, one per `OverflowRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverflowReply {
    Spawned,
    Failed { reason: String },
}
