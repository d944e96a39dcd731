//! HTTP transport.

mod routes;
mod server;

pub use routes::routes;
pub use server::{DEFAULT_PORT, ServerConfig, serve};
