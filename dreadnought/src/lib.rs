//! dreadnought: pre-forked worker pool that runs route callbacks out-of-process.
//!
//! Routes are registered into a [`RegistryBuilder`] and frozen. The frozen
//! registry is inherited by a pool of forked workers; the coordinator leases a
//! worker per call and talks to it over length-framed JSON on anonymous pipes,
//! with a third pipe relaying log lines. When every pooled worker is busy a
//! standing overflow controller forks one-shot workers that rendezvous over
//! named pipes.

#[cfg(not(unix))]
compile_error!("dreadnought forks worker processes and only builds on unix");

pub mod bridge;
pub mod config;
pub mod engine;
pub mod handle;
pub mod overflow;
pub mod permit;
pub mod process;
pub mod registry;
pub mod relay;
pub mod service;
pub mod transport;
pub mod worker;
mod version;

pub use bridge::protocol::{Ident, Method, Request, Response, WorkerCommand};
pub use config::{ConfigError, PoolConfig};
pub use engine::{EngineFactory, NativeEngine, ScriptEngine, native_engine};
pub use handle::{TransactionError, Worker, WorkerState};
pub use permit::{ForkedPool, Lease, Pool, PoolError, PoolSnapshot, SlotIndex};
pub use registry::{
    Callback, CallbackEntry, CallbackRegistry, RegistryBuilder, RegistryError, Reply, RouteOptions,
};
pub use relay::RouteLogger;
pub use service::{CallError, HealthSnapshot, HealthStatus, RouteService};
pub use version::{DREADNOUGHT_VERSION, VersionInfo};
