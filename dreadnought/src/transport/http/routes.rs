//! HTTP route handlers.
//!
//! One axum route per registered path. Method-filtered entries are merged
//! into the path's `MethodRouter`; an entry without a filter becomes its
//! fallback, so it answers every method the others do not claim.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{Method as HttpMethod, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{MethodFilter, MethodRouter, get},
};
use futures::StreamExt;
use serde_json::{Map, Value};

use crate::bridge::protocol::{Ident, Method, Request};
use crate::registry::{CallbackEntry, HEALTH_CHECK_PATH};
use crate::service::{CallError, HealthSnapshot, RouteService};

type Service = Arc<RouteService>;

/// What a route handler needs from its registry entry.
#[derive(Debug, Clone)]
struct Endpoint {
    ident: Ident,
    path: String,
    stream: bool,
    json: bool,
}

impl From<&CallbackEntry> for Endpoint {
    fn from(entry: &CallbackEntry) -> Self {
        Self {
            ident: entry.ident,
            path: entry.path.clone(),
            stream: entry.options.stream,
            json: entry.options.json,
        }
    }
}

fn method_filter(method: Method) -> MethodFilter {
    match method {
        Method::Get => MethodFilter::GET,
        Method::Post => MethodFilter::POST,
        Method::Put => MethodFilter::PUT,
        Method::Delete => MethodFilter::DELETE,
    }
}

async fn health_check(State(service): State<Service>) -> Json<HealthSnapshot> {
    Json(service.health())
}

async fn dispatch(
    endpoint: Endpoint,
    service: Service,
    method: HttpMethod,
    qs: HashMap<String, String>,
    body: Option<Map<String, Value>>,
) -> Response {
    let qs_params = qs.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    let mut request = Request::new(endpoint.ident, endpoint.path.clone())
        .with_qs_params(qs_params)
        .with_post_data(body.unwrap_or_default());
    request.method = method.as_str().parse().ok();

    if endpoint.stream {
        stream_response(&endpoint, service.stream(request)).await
    } else {
        match service.call(request).await {
            Ok(data) => data_response(&endpoint, data),
            Err(e) => error_response(&endpoint, e),
        }
    }
}

fn data_response(endpoint: &Endpoint, data: Value) -> Response {
    match data {
        Value::String(text) if !endpoint.json => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response(),
        other => Json(other).into_response(),
    }
}

/// Chunked body fed by the worker stream.
///
/// The first chunk is awaited before the status line goes out, so a stream
/// that fails to open still gets a proper error status. Later errors cut the
/// body short.
async fn stream_response(
    endpoint: &Endpoint,
    mut chunks: futures::stream::BoxStream<'static, Result<Value, CallError>>,
) -> Response {
    let first = match chunks.next().await {
        None => None,
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return error_response(endpoint, e),
    };
    let content_type = if endpoint.json {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };

    let path = endpoint.path.clone();
    let body = futures::stream::iter(first.map(Ok))
        .chain(chunks)
        .map(move |item| match item {
            Ok(chunk) => Ok(chunk_bytes(chunk)),
            Err(e) => {
                tracing::warn!(%path, error = %e, "Stream failed mid-body");
                Err(e)
            }
        });
    ([(header::CONTENT_TYPE, content_type)], Body::from_stream(body)).into_response()
}

fn chunk_bytes(chunk: Value) -> Bytes {
    match chunk {
        Value::String(text) => Bytes::from(text),
        other => Bytes::from(other.to_string()),
    }
}

fn error_response(endpoint: &Endpoint, err: CallError) -> Response {
    let (status, body) = match &err {
        CallError::Application(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": error }),
        ),
        e if e.is_unavailable() => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "exc": e.to_string() }),
        ),
        e => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "exc": e.to_string() }),
        ),
    };
    match err {
        CallError::Application(_) => {
            tracing::debug!(path = %endpoint.path, error = %err, "Route returned an error")
        }
        _ => tracing::error!(path = %endpoint.path, error = %err, "Route failed"),
    }
    (status, Json(body)).into_response()
}

/// Build the router for every route in the service's registry.
pub fn routes(service: Service) -> Router {
    let mut paths: BTreeMap<String, MethodRouter<Service>> = BTreeMap::new();
    for entry in service.registry().iter() {
        let endpoint = Endpoint::from(entry);
        let handler = move |State(service): State<Service>,
                            method: HttpMethod,
                            Query(qs): Query<HashMap<String, String>>,
                            body: Option<Json<Map<String, Value>>>| {
            let endpoint = endpoint.clone();
            async move { dispatch(endpoint, service, method, qs, body.map(|Json(b)| b)).await }
        };
        let router = paths.remove(&entry.path).unwrap_or_else(MethodRouter::new);
        let router = match entry.options.method {
            Some(method) => router.on(method_filter(method), handler),
            None => router.fallback(handler),
        };
        paths.insert(entry.path.clone(), router);
    }

    paths
        .into_iter()
        .fold(
            Router::new().route(HEALTH_CHECK_PATH, get(health_check)),
            |app, (path, router)| app.route(&path, router),
        )
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::permit::ForkedPool;
    use crate::registry::{RegistryBuilder, Reply, RouteOptions};
    use crate::relay::RouteLogger;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn service() -> Service {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                "/hello",
                |_: &RouteLogger, req: &Request, _: &Value| {
                    let name = req.qs_params.get("name").and_then(Value::as_str).unwrap_or("world");
                    Ok(Reply::data(format!("hello {name}")))
                },
                RouteOptions::default().with_method(Method::Get),
            )
            .unwrap();
        builder
            .register(
                "/hello",
                |_: &RouteLogger, req: &Request, _: &Value| Ok(Reply::Data(Value::Object(req.post_data.clone()))),
                RouteOptions::default().with_method(Method::Post),
            )
            .unwrap();
        builder
            .register(
                "/method",
                |_: &RouteLogger, req: &Request, args: &Value| {
                    Ok(Reply::data(serde_json::json!({
                        "method": req.method.map(Method::as_str),
                        "args": args,
                    })))
                },
                RouteOptions::default().with_args(serde_json::json!([1, 2])).json(),
            )
            .unwrap();
        builder
            .register(
                "/letters",
                |_: &RouteLogger, req: &Request, _: &Value| {
                    Ok(match req.bytes_read {
                        0 => Reply::data("a"),
                        1 => Reply::data("b"),
                        _ => Reply::Done,
                    })
                },
                RouteOptions::default().streaming(),
            )
            .unwrap();
        builder
            .register(
                "/teapot",
                |_: &RouteLogger, _: &Request, _: &Value| Ok(Reply::error("short and stout")),
                RouteOptions::default(),
            )
            .unwrap();
        builder
            .register(
                "/div",
                |_: &RouteLogger, _: &Request, _: &Value| anyhow::bail!("divide by zero"),
                RouteOptions::default(),
            )
            .unwrap();
        let registry = builder.freeze();
        let config = PoolConfig::new(1).with_checkout_timeout(Duration::from_millis(100));
        let pool = ForkedPool::threaded(Arc::clone(&registry), config)
            .activate()
            .unwrap();
        Arc::new(RouteService::new(registry, pool))
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn response_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn get_route_receives_query_string() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::get("/hello?name=pool").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "hello pool");
    }

    #[tokio::test]
    async fn post_route_receives_json_body() {
        let app = routes(service());
        let response = app
            .oneshot(
                HttpRequest::post("/hello")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"a":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn unclaimed_method_is_rejected() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::delete("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unfiltered_route_answers_any_method() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::put("/method").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        insta::assert_json_snapshot!(response_json(response).await, @r#"
        {
          "args": [
            1,
            2
          ],
          "method": "PUT"
        }
        "#);
    }

    #[tokio::test]
    async fn streaming_route_sends_chunks() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::get("/letters").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ab");
    }

    #[tokio::test]
    async fn application_error_is_500_with_error() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::get("/teapot").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response_json(response).await,
            serde_json::json!({"error": "short and stout"})
        );
    }

    #[tokio::test]
    async fn fault_is_500_with_exc() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::get("/div").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = response_json(response).await;
        assert!(json["exc"].as_str().unwrap().contains("divide by zero"), "{json}");
    }

    #[tokio::test]
    async fn saturated_pool_is_503() {
        let service = service();
        let _held = service.pool().checkout().await.unwrap();
        let app = routes(Arc::clone(&service));

        let response = app
            .oneshot(HttpRequest::get("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_check_reports_pool() {
        let app = routes(service());
        let response = app
            .oneshot(HttpRequest::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["routes"], 6);
        assert_eq!(json["pool"]["size"], 1);
        assert!(json["version"]["dreadnought"].is_string());
    }
}
