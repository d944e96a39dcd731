//! IPC bridge between the coordinator and its worker processes.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerCommand/Response, OverflowRequest/Reply)
//! - **codec**: Length-prefixed JSON framing shared by every pipe
//! - **channel**: Blocking frame I/O for workers, tokio pipe wrappers for the coordinator
//! - **fifo**: Named-pipe rendezvous used by overflow workers

pub mod channel;
pub mod codec;
pub mod fifo;
pub mod protocol;
