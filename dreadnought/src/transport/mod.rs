//! Transport layer.
//!
//! HTTP via axum is the only transport; it holds a `RouteService` and nothing
//! else, so another front end can be added beside it.

pub mod http;

pub use http::{ServerConfig, serve};
