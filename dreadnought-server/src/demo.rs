//! Built-in routes served by the binary.

use std::sync::Arc;

use dreadnought::{
    CallbackRegistry, Method, RegistryBuilder, RegistryError, Reply, Request, RouteLogger,
    RouteOptions,
};
use serde_json::{Value, json};

fn hello(log: &RouteLogger, request: &Request, greeting: &Value) -> anyhow::Result<Reply> {
    let name = request
        .qs_params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("world");
    log.info(format!("greeting {name}"));
    let greeting = greeting.as_str().unwrap_or("hello");
    Ok(Reply::data(format!("{greeting} {name}")))
}

fn echo(_: &RouteLogger, request: &Request, _: &Value) -> anyhow::Result<Reply> {
    Ok(Reply::data(Value::Object(request.post_data.clone())))
}

/// Streams `0..n` one number per chunk, `n` from the query string.
fn count(log: &RouteLogger, request: &Request, _: &Value) -> anyhow::Result<Reply> {
    let n: u64 = match request.qs_params.get("n").and_then(Value::as_str) {
        Some(n) => n.parse()?,
        None => 10,
    };
    // Each chunk is "<i>\n"; bytes_read tells us how far we got.
    let mut sent = 0;
    let mut i = 0;
    while sent < request.bytes_read {
        sent += format!("{i}\n").len() as u64;
        i += 1;
    }
    if i >= n {
        log.debug("done");
        return Ok(Reply::Done);
    }
    Ok(Reply::data(format!("{i}\n")))
}

fn divide(_: &RouteLogger, request: &Request, _: &Value) -> anyhow::Result<Reply> {
    let arg = |key: &str| {
        request
            .qs_params
            .get(key)
            .and_then(Value::as_str)
            .map(str::parse::<i64>)
            .transpose()
    };
    let (Some(a), Some(b)) = (arg("a")?, arg("b")?) else {
        return Ok(Reply::error("a and b are required"));
    };
    anyhow::ensure!(b != 0, "divide by zero");
    Ok(Reply::data(json!({ "quotient": a / b, "remainder": a % b })))
}

pub fn registry() -> Result<Arc<CallbackRegistry>, RegistryError> {
    let mut builder = RegistryBuilder::new();
    builder.register(
        "/hello",
        hello,
        RouteOptions::default()
            .with_method(Method::Get)
            .with_args("hello"),
    )?;
    builder.register(
        "/echo",
        echo,
        RouteOptions::default().with_method(Method::Post).json(),
    )?;
    builder.register("/count", count, RouteOptions::default().streaming())?;
    builder.register("/divide", divide, RouteOptions::default().json())?;
    Ok(builder.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_demo_route() {
        let registry = registry().unwrap();
        let paths: Vec<_> = registry.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["/hello", "/echo", "/count", "/divide"]);
        assert!(registry.iter().any(|e| e.options.stream));
    }
}
