//! dreadnought server: fork the worker pool, then serve its routes over HTTP.

mod demo;

use std::sync::Arc;

use dreadnought::transport::{ServerConfig, serve};
use dreadnought::{ForkedPool, PoolConfig, RouteService, VersionInfo, native_engine};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// `RUST_LOG` wins; otherwise `DN_LOG` sets the level for our own targets.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DN_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "dreadnought={level},dreadnought_server={level},dreadnought::route={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let pool_config = PoolConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;
    let registry = demo::registry()?;

    // Fork while this process is still single-threaded.
    let forked = ForkedPool::fork(Arc::clone(&registry), native_engine(), pool_config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let pool = forked.activate()?;
        let service = RouteService::new(registry, pool)
            .with_version(VersionInfo::new().with_engine("native"));
        serve(server_config, Arc::new(service)).await
    })
}
