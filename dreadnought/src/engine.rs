//! Script execution context inside a worker.
//!
//! Each worker owns one engine, built after fork by an [`EngineFactory`]. The
//! engine is entered around every call (via [`ExecutionScope`]) and held entered
//! for the lifetime of an open stream.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::bridge::protocol::{Request, Response};
use crate::registry::{CallbackEntry, Reply};
use crate::relay::RouteLogger;

/// The embedded script runtime of one worker.
pub trait ScriptEngine {
    /// Acquire the context before invoking callbacks.
    fn enter(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release the context. Called once per successful `enter`.
    fn leave(&mut self) {}

    fn invoke(
        &mut self,
        entry: &CallbackEntry,
        logger: &RouteLogger,
        request: &Request,
    ) -> anyhow::Result<Reply> {
        (entry.callback)(logger, request, &entry.static_args)
    }
}

/// Runs registered Rust closures directly.
#[derive(Debug, Default)]
pub struct NativeEngine {
    entered: bool,
}

impl ScriptEngine for NativeEngine {
    fn enter(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.entered, "execution context entered twice");
        self.entered = true;
        Ok(())
    }

    fn leave(&mut self) {
        self.entered = false;
    }
}

/// Builds one engine per worker process.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync>;

pub fn native_engine() -> EngineFactory {
    Arc::new(|| Box::new(NativeEngine::default()))
}

/// Entered context, left again on drop.
pub struct ExecutionScope<'a> {
    engine: &'a mut dyn ScriptEngine,
}

impl<'a> ExecutionScope<'a> {
    pub fn enter(engine: &'a mut dyn ScriptEngine) -> anyhow::Result<Self> {
        engine.enter()?;
        Ok(Self { engine })
    }

    pub fn invoke(&mut self, entry: &CallbackEntry, logger: &RouteLogger, request: &Request) -> Response {
        invoke_guarded(self.engine, entry, logger, request)
    }
}

impl Drop for ExecutionScope<'_> {
    fn drop(&mut self) {
        self.engine.leave();
    }
}

/// Invoke a callback, turning errors and panics into `Fault`.
pub fn invoke_guarded(
    engine: &mut dyn ScriptEngine,
    entry: &CallbackEntry,
    logger: &RouteLogger,
    request: &Request,
) -> Response {
    match catch_unwind(AssertUnwindSafe(|| engine.invoke(entry, logger, request))) {
        Ok(Ok(reply)) => reply.into(),
        Ok(Err(e)) => Response::Fault {
            exc: format!("{e:?}"),
        },
        Err(payload) => Response::Fault {
            exc: format!("callback panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::pipe_pair;
    use crate::bridge::protocol::Ident;
    use crate::registry::{RegistryBuilder, RouteOptions};
    use crate::relay::RelaySink;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct CountingEngine {
        enters: usize,
        leaves: usize,
    }

    impl ScriptEngine for CountingEngine {
        fn enter(&mut self) -> anyhow::Result<()> {
            self.enters += 1;
            Ok(())
        }

        fn leave(&mut self) {
            self.leaves += 1;
        }
    }

    fn fixture() -> (Arc<crate::registry::CallbackRegistry>, RouteLogger) {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                "/ok",
                |_: &RouteLogger, _: &Request, args: &Value| Ok(Reply::Data(args.clone())),
                RouteOptions::default().with_args(json!("static")),
            )
            .unwrap();
        builder
            .register(
                "/div",
                |_: &RouteLogger, _: &Request, _: &Value| Err(anyhow::anyhow!("divide by zero")),
                RouteOptions::default(),
            )
            .unwrap();
        builder
            .register(
                "/panic",
                |_: &RouteLogger, _: &Request, _: &Value| panic!("index out of bounds"),
                RouteOptions::default(),
            )
            .unwrap();
        let (_r, w) = pipe_pair().unwrap();
        (builder.freeze(), RouteLogger::new("test", RelaySink::new(w)))
    }

    #[test]
    fn scope_leaves_on_every_path() {
        let (registry, logger) = fixture();
        let mut engine = CountingEngine::default();

        for ident in 0..3 {
            let entry = registry.lookup(Ident::new(ident)).unwrap();
            let request = Request::new(entry.ident, entry.path.clone());
            let mut scope = ExecutionScope::enter(&mut engine).unwrap();
            let _ = scope.invoke(entry, &logger, &request);
        }

        assert_eq!(engine.enters, 3);
        assert_eq!(engine.leaves, 3);
    }

    #[test]
    fn errors_and_panics_become_faults() {
        let (registry, logger) = fixture();
        let mut engine = NativeEngine::default();
        let run = |engine: &mut NativeEngine, ident| {
            let entry = registry.lookup(Ident::new(ident)).unwrap();
            let mut scope = ExecutionScope::enter(engine).unwrap();
            scope.invoke(entry, &logger, &Request::new(entry.ident, entry.path.clone()))
        };

        assert_eq!(
            run(&mut engine, 0),
            Response::Data {
                data: json!("static")
            }
        );
        match run(&mut engine, 1) {
            Response::Fault { exc } => assert!(exc.contains("divide by zero"), "{exc}"),
            other => panic!("expected fault, got {other:?}"),
        }
        match run(&mut engine, 2) {
            Response::Fault { exc } => assert!(exc.contains("index out of bounds"), "{exc}"),
            other => panic!("expected fault, got {other:?}"),
        }
        // Still usable after a panic.
        assert!(matches!(run(&mut engine, 0), Response::Data { .. }));
    }

    #[test]
    fn native_engine_rejects_nested_enter() {
        let mut engine = NativeEngine::default();
        engine.enter().unwrap();
        assert!(engine.enter().is_err());
        engine.leave();
        engine.enter().unwrap();
    }
}
