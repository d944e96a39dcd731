//! RouteService: the context object transports hold.
//!
//! Owns the frozen registry and the pool. Every inbound call is one checkout,
//! one transaction (or one open/pull*/close stream) and one checkin.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

use crate::bridge::protocol::{Ident, Request, Response, WorkerCommand, is_empty_payload};
use crate::handle::{TransactionError, WorkerState};
use crate::permit::{Lease, Pool, PoolError, PoolSnapshot};
use crate::registry::{CallbackEntry, CallbackRegistry, RegistryError};
use crate::version::VersionInfo;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The callback replied `Error`. The worker is healthy.
    #[error("{0}")]
    Application(String),

    /// The callback raised, or the worker rejected the command.
    #[error("{0}")]
    Fault(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl CallError {
    /// No worker could be had; retrying later may succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CallError::Pool(PoolError::Saturated { .. } | PoolError::Exhausted { .. })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// A worker is idle, or overflow can absorb the next call.
    Ready,
    /// Every slot and every overflow permit is taken.
    Busy,
    /// Some slots are poisoned; the rest still serve.
    Degraded,
    /// No slot left and no overflow.
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub version: VersionInfo,
    pub routes: usize,
    pub pool: PoolSnapshot,
}

impl HealthStatus {
    fn of(pool: &PoolSnapshot) -> Self {
        let overflow_room = pool.overflow_active < pool.max_overflow;
        if pool.dead == pool.size && pool.max_overflow == 0 {
            HealthStatus::Unavailable
        } else if pool.idle == 0 && !overflow_room {
            HealthStatus::Busy
        } else if pool.dead > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ready
        }
    }
}

pub struct RouteService {
    registry: Arc<CallbackRegistry>,
    pool: Arc<Pool>,
    version: VersionInfo,
}

impl RouteService {
    pub fn new(registry: Arc<CallbackRegistry>, pool: Arc<Pool>) -> Self {
        Self {
            registry,
            pool,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn lookup(&self, ident: Ident) -> Result<&CallbackEntry, RegistryError> {
        self.registry.lookup(ident)
    }

    /// One execute-and-reply cycle on a leased worker.
    pub async fn call(&self, request: Request) -> Result<Value, CallError> {
        self.registry.lookup(request.ident)?;
        let mut lease = self.pool.checkout().await?;
        let response = lease
            .worker()
            .transaction(WorkerCommand::Call { request })
            .await?;
        let outcome = match response {
            Response::Data { data } => Ok(data),
            Response::Error { error } => Err(CallError::Application(error)),
            Response::Fault { exc } => Err(CallError::Fault(exc)),
            Response::Ack => Err(protocol_violation(&mut lease, "call")),
        };
        self.pool.checkin(lease);
        outcome
    }

    /// Lazy chunk sequence for a streaming route.
    ///
    /// Nothing is checked out until the stream is first polled. The sequence
    /// ends at the first empty chunk, or after yielding one error. Dropping
    /// it early still closes the worker's stream.
    pub fn stream(&self, request: Request) -> BoxStream<'static, Result<Value, CallError>> {
        let phase = Phase::Pending {
            pool: Arc::clone(&self.pool),
            registry: Arc::clone(&self.registry),
            request,
        };
        futures::stream::unfold(phase, next_chunk).boxed()
    }

    pub fn health(&self) -> HealthSnapshot {
        let pool = self.pool.snapshot();
        HealthSnapshot {
            status: HealthStatus::of(&pool),
            version: self.version.clone(),
            routes: self.registry.len(),
            pool,
        }
    }
}

enum Phase {
    Pending {
        pool: Arc<Pool>,
        registry: Arc<CallbackRegistry>,
        request: Request,
    },
    Open(StreamSession),
    Done,
}

async fn next_chunk(phase: Phase) -> Option<(Result<Value, CallError>, Phase)> {
    let mut session = match phase {
        Phase::Pending {
            pool,
            registry,
            request,
        } => match StreamSession::open(&pool, &registry, request).await {
            Ok(session) => session,
            Err(e) => return Some((Err(e), Phase::Done)),
        },
        Phase::Open(session) => session,
        Phase::Done => return None,
    };

    match session.pull().await {
        Ok(Some(chunk)) => Some((Ok(chunk), Phase::Open(session))),
        Ok(None) => {
            session.close().await;
            None
        }
        Err(e) => {
            session.close().await;
            Some((Err(e), Phase::Done))
        }
    }
}

/// A worker holding an open stream.
struct StreamSession {
    lease: Option<Lease>,
    request: Request,
}

impl StreamSession {
    async fn open(
        pool: &Arc<Pool>,
        registry: &CallbackRegistry,
        mut request: Request,
    ) -> Result<Self, CallError> {
        registry.lookup(request.ident)?;
        request.streaming = true;
        request.bytes_read = 0;

        let mut lease = pool.checkout().await?;
        let ident = request.ident;
        match lease
            .worker()
            .transaction(WorkerCommand::StartStreaming { ident })
            .await?
        {
            Response::Ack => Ok(Self {
                lease: Some(lease),
                request,
            }),
            Response::Fault { exc } => Err(CallError::Fault(exc)),
            Response::Error { error } => Err(CallError::Application(error)),
            Response::Data { .. } => Err(protocol_violation(&mut lease, "start_streaming")),
        }
    }

    /// `None` at end of stream.
    async fn pull(&mut self) -> Result<Option<Value>, CallError> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(None);
        };
        let response = lease
            .worker()
            .transaction(WorkerCommand::Pull {
                request: self.request.clone(),
            })
            .await?;
        match response {
            Response::Data { data } if is_empty_payload(&data) => Ok(None),
            Response::Data { data } => {
                self.request.bytes_read += chunk_len(&data);
                Ok(Some(data))
            }
            Response::Error { error } => Err(CallError::Application(error)),
            Response::Fault { exc } => Err(CallError::Fault(exc)),
            Response::Ack => Err(protocol_violation(lease, "pull")),
        }
    }

    async fn close(mut self) {
        if let Some(lease) = self.lease.take() {
            stop_stream(lease, self.request.ident).await;
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if lease.worker_state() != Some(WorkerState::Streaming) {
            return;
        }
        // Consumer went away mid-stream. Without a runtime the lease drops
        // while still streaming and the pool poisons the slot.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let ident = self.request.ident;
            handle.spawn(stop_stream(lease, ident));
        }
    }
}

async fn stop_stream(mut lease: Lease, ident: Ident) {
    if lease.worker_state() != Some(WorkerState::Streaming) {
        return;
    }
    match lease
        .worker()
        .transaction(WorkerCommand::StopStreaming { ident })
        .await
    {
        Ok(Response::Ack) => {}
        Ok(other) => {
            protocol_violation(&mut lease, "stop_streaming");
            tracing::warn!(response = ?other, "Stream close not acknowledged");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to close stream"),
    }
}

/// Kill the leased worker: it answered with the wrong frame kind.
fn protocol_violation(lease: &mut Lease, kind: &str) -> CallError {
    let worker = lease.worker();
    tracing::error!(worker = %worker.label(), kind, "Unexpected response kind");
    worker.set_state(WorkerState::Dead);
    CallError::Fault(format!("worker {} sent an unexpected response to {kind}", worker.label()))
}

/// Bytes a chunk adds to `bytes_read`.
fn chunk_len(data: &Value) -> u64 {
    let len = match data {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    len as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::permit::ForkedPool;
    use crate::registry::{RegistryBuilder, Reply, RouteOptions};
    use crate::relay::RouteLogger;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::time::Duration;

    /// ident 0: echo post_data["payload"]
    /// ident 1: stream "a", "b", ""
    /// ident 2: stream "a", then error "boom"
    /// ident 3: fail with "divide by zero"
    /// ident 4: application error
    fn registry() -> Arc<CallbackRegistry> {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                "/echo",
                |_: &RouteLogger, req: &Request, _: &Value| {
                    Ok(Reply::Data(req.post_data.get("payload").cloned().unwrap_or(Value::Null)))
                },
                RouteOptions::default(),
            )
            .unwrap();
        builder
            .register(
                "/letters",
                |_: &RouteLogger, req: &Request, _: &Value| {
                    Ok(match req.bytes_read {
                        0 => Reply::data("a"),
                        1 => Reply::data("b"),
                        _ => Reply::data(""),
                    })
                },
                RouteOptions::default().streaming(),
            )
            .unwrap();
        builder
            .register(
                "/boom",
                |_: &RouteLogger, req: &Request, _: &Value| {
                    Ok(match req.bytes_read {
                        0 => Reply::data("a"),
                        _ => Reply::error("boom"),
                    })
                },
                RouteOptions::default().streaming(),
            )
            .unwrap();
        builder
            .register(
                "/div",
                |_: &RouteLogger, _: &Request, _: &Value| anyhow::bail!("divide by zero"),
                RouteOptions::default(),
            )
            .unwrap();
        builder
            .register(
                "/teapot",
                |_: &RouteLogger, _: &Request, _: &Value| Ok(Reply::error("short and stout")),
                RouteOptions::default(),
            )
            .unwrap();
        builder.freeze()
    }

    fn service(size: usize) -> RouteService {
        let registry = registry();
        let config = PoolConfig::new(size).with_checkout_timeout(Duration::from_millis(200));
        let pool = ForkedPool::threaded(Arc::clone(&registry), config)
            .activate()
            .unwrap();
        RouteService::new(registry, pool)
    }

    fn echo(payload: Value) -> Request {
        let mut post_data = serde_json::Map::new();
        post_data.insert("payload".into(), payload);
        Request::new(Ident::new(0), "/echo").with_post_data(post_data)
    }

    #[tokio::test]
    async fn call_echoes_payload() {
        let service = service(1);
        let payload = json!({"x": [1, 2, 3], "y": "z"});
        assert_eq!(service.call(echo(payload.clone())).await.unwrap(), payload);
        assert_eq!(service.health().pool.idle, 1);
    }

    #[tokio::test]
    async fn fault_then_recovery() {
        let service = service(1);
        let err = service
            .call(Request::new(Ident::new(3), "/div"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Fault(ref exc) if exc.contains("divide by zero")), "{err}");

        assert_eq!(service.call(echo(json!("ok"))).await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn application_error_is_not_a_fault() {
        let service = service(1);
        let err = service
            .call(Request::new(Ident::new(4), "/teapot"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Application(ref e) if e == "short and stout"));
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    async fn unknown_ident_rejected_before_checkout() {
        let service = service(1);
        let err = service
            .call(Request::new(Ident::new(99), "/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Registry(RegistryError::UnknownIdent { .. })));
    }

    #[tokio::test]
    async fn stream_ends_on_empty_chunk() {
        let service = service(1);
        let chunks: Vec<Value> = service
            .stream(Request::new(Ident::new(1), "/letters"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec![json!("a"), json!("b")]);

        // Stream closed cleanly: the worker is back and serves calls.
        assert_eq!(service.health().pool.idle, 1);
        assert_eq!(service.call(echo(json!(1))).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn stream_error_after_first_chunk() {
        let service = service(1);
        let items: Vec<_> = service
            .stream(Request::new(Ident::new(2), "/boom"))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!("a"));
        assert!(matches!(&items[1], Err(CallError::Application(e)) if e == "boom"));

        assert_eq!(service.call(echo(json!(2))).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn abandoned_stream_is_closed() {
        let service = service(1);
        let mut chunks = service.stream(Request::new(Ident::new(1), "/letters"));
        assert_eq!(chunks.next().await.unwrap().unwrap(), json!("a"));
        drop(chunks);

        // The spawned close returns the worker; the next checkout waits for it.
        assert_eq!(service.call(echo(json!(3))).await.unwrap(), json!(3));
        assert_eq!(service.health().pool.dead, 0);
    }

    #[tokio::test]
    async fn saturated_pool_is_unavailable() {
        let service = service(1);
        let _held = service.pool().checkout().await.unwrap();
        let err = service.call(echo(json!(0))).await.unwrap_err();
        assert!(err.is_unavailable(), "{err}");
        assert_eq!(service.health().status, HealthStatus::Busy);
    }

    #[test]
    fn health_status_from_snapshot() {
        let snapshot = |idle, busy, dead, overflow_active, max_overflow| PoolSnapshot {
            size: 2,
            idle,
            busy,
            dead,
            overflow_active,
            max_overflow,
        };
        assert_eq!(HealthStatus::of(&snapshot(2, 0, 0, 0, 0)), HealthStatus::Ready);
        assert_eq!(HealthStatus::of(&snapshot(0, 2, 0, 1, 2)), HealthStatus::Ready);
        assert_eq!(HealthStatus::of(&snapshot(0, 2, 0, 0, 0)), HealthStatus::Busy);
        assert_eq!(HealthStatus::of(&snapshot(1, 0, 1, 0, 0)), HealthStatus::Degraded);
        assert_eq!(HealthStatus::of(&snapshot(0, 0, 2, 0, 0)), HealthStatus::Unavailable);
        assert_eq!(HealthStatus::of(&snapshot(0, 0, 2, 0, 1)), HealthStatus::Degraded);
    }
}
