//! Callback registry: ident -> (callback, static args, logger, options).
//!
//! Built once in the coordinator with [`RegistryBuilder`], then frozen into an
//! immutable [`CallbackRegistry`] before any worker is forked. Workers inherit
//! the frozen table through fork, so every process sees the same idents. There
//! is no way to add a route to a frozen registry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bridge::protocol::{Ident, Method, Request, Response};
use crate::relay::RouteLogger;

/// Reserved for the built-in health route.
pub const HEALTH_CHECK_PATH: &str = "/health-check";

/// Invocable route logic: `(logger, request, static args) -> reply`.
pub type Callback =
    Arc<dyn Fn(&RouteLogger, &Request, &Value) -> anyhow::Result<Reply> + Send + Sync>;

/// What a callback hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Data(Value),
    /// Application-declared error, surfaced to the client without faulting.
    Error(String),
    /// End of stream.
    Done,
}

impl Reply {
    pub fn data(value: impl Into<Value>) -> Self {
        Reply::Data(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }
}

impl From<Reply> for Response {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Data(data) => Response::Data { data },
            Reply::Error(error) => Response::Error { error },
            Reply::Done => Response::Data { data: Value::Null },
        }
    }
}

/// Options recognized at registration. Unknown keys are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    /// Passed unchanged to every invocation.
    #[serde(default)]
    pub args: Value,
    /// Serve through the streaming sub-protocol.
    #[serde(default)]
    pub stream: bool,
    /// Encode responses as JSON at the HTTP layer.
    #[serde(default)]
    pub json: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouteOptions {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_args(mut self, args: impl Into<Value>) -> Self {
        self.args = args.into();
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Parse a script-supplied options mapping.
    ///
    /// `method` is matched case-insensitively.
    pub fn from_json(value: Value) -> Result<Self, RegistryError> {
        let Value::Object(mut map) = value else {
            return Err(RegistryError::InvalidOptions(
                "options must be a JSON object".to_string(),
            ));
        };
        match map.get("method") {
            None | Some(Value::Null) => {
                map.remove("method");
            }
            Some(Value::String(s)) => {
                let method: Method = s
                    .parse()
                    .map_err(|e: crate::bridge::protocol::UnknownMethod| {
                        RegistryError::InvalidOptions(e.to_string())
                    })?;
                map.insert("method".into(), Value::String(method.as_str().into()));
            }
            Some(other) => {
                return Err(RegistryError::InvalidOptions(format!(
                    "method must be a string, got {other}"
                )));
            }
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| RegistryError::InvalidOptions(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown ident {ident} (registry holds {len} entries)")]
    UnknownIdent { ident: Ident, len: usize },

    #[error("route {method} {path} is already registered")]
    Duplicate { path: String, method: String },

    #[error("{0} is reserved")]
    Reserved(String),

    #[error("route path must start with '/': {0:?}")]
    InvalidPath(String),

    #[error("invalid route options: {0}")]
    InvalidOptions(String),
}

/// One registered route.
#[derive(Clone)]
pub struct CallbackEntry {
    pub ident: Ident,
    pub path: String,
    pub callback: Callback,
    pub static_args: Value,
    /// `"[METHOD]path"`, or `"[http]path"` without a method filter.
    pub logger_name: String,
    pub options: RouteOptions,
}

impl fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("ident", &self.ident)
            .field("path", &self.path)
            .field("static_args", &self.static_args)
            .field("logger_name", &self.logger_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn logger_name(path: &str, method: Option<Method>) -> String {
    match method {
        Some(m) => format!("[{m}]{path}"),
        None => format!("[http]{path}"),
    }
}

/// Mutable registration phase.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<CallbackEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route and return its ident.
    pub fn register<F>(
        &mut self,
        path: impl Into<String>,
        callback: F,
        options: RouteOptions,
    ) -> Result<Ident, RegistryError>
    where
        F: Fn(&RouteLogger, &Request, &Value) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        self.register_callback(path, Arc::new(callback), options)
    }

    pub fn register_callback(
        &mut self,
        path: impl Into<String>,
        callback: Callback,
        options: RouteOptions,
    ) -> Result<Ident, RegistryError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(RegistryError::InvalidPath(path));
        }
        if path == HEALTH_CHECK_PATH {
            return Err(RegistryError::Reserved(path));
        }
        if self
            .entries
            .iter()
            .any(|e| e.path == path && e.options.method == options.method)
        {
            return Err(RegistryError::Duplicate {
                method: options.method.map_or("*", Method::as_str).to_string(),
                path,
            });
        }

        let ident = Ident::new(self.entries.len());
        tracing::debug!(%ident, %path, method = ?options.method, stream = options.stream, "Registered route");
        self.entries.push(CallbackEntry {
            ident,
            logger_name: logger_name(&path, options.method),
            static_args: options.args.clone(),
            path,
            callback,
            options,
        });
        Ok(ident)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn freeze(self) -> Arc<CallbackRegistry> {
        Arc::new(CallbackRegistry {
            entries: self.entries,
        })
    }
}

/// Frozen, read-only route table.
pub struct CallbackRegistry {
    entries: Vec<CallbackEntry>,
}

impl CallbackRegistry {
    pub fn lookup(&self, ident: Ident) -> Result<&CallbackEntry, RegistryError> {
        self.entries
            .get(ident.index())
            .ok_or(RegistryError::UnknownIdent {
                ident,
                len: self.entries.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallbackEntry> {
        self.entries.iter()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}
