use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::ids::CallId;
use crate::protocol::{Direction, Metadata, Source};

/// Immutable per-invocation context, passed through the channel's dispatch
/// pipeline and into handlers.
///
/// For invocations that arrived from the wire, the fields are taken
/// verbatim from the CALL packet; for locally issued invocations they are
/// synthesized by the tagging stage.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Correlation id of this invocation.
    pub id: CallId,
    /// Where the invocation originated.
    pub source: Source,
    /// CALL or RETURN leg.
    pub direction: Direction,
    /// Application metadata carried alongside the call.
    pub metadata: Metadata,
}

impl CallContext {
    /// Synthesize the context for a freshly issued call (tagging stage).
    pub(crate) fn tag(source: Source, metadata: Metadata) -> Self {
        // ---
        Self {
            id: CallId::generate(),
            source,
            direction: Direction::Call,
            metadata,
        }
    }
}

/// Type-erased async handler for one named operation.
///
/// Takes the call arguments and context, returns the result values.
/// Wrapped in `Arc` for cheap cloning when spawning dispatch tasks.
pub(crate) type BoxedHandler = Arc<
    dyn Fn(Vec<Value>, CallContext) -> Pin<Box<dyn Future<Output = Vec<Value>> + Send>>
        + Send
        + Sync,
>;

/// Registry of named operation handlers.
///
/// Shared between a lifecycle owner (client or server) and every channel it
/// creates, so registrations survive reconnects. An unregistered name
/// resolves to an empty result vector rather than an error.
pub struct Handlers {
    // ---
    map: RwLock<HashMap<String, BoxedHandler>>,
}

impl Handlers {
    /// Create an empty, shareable registry.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            map: RwLock::new(HashMap::new()),
        })
    }

    /// Register an async handler for a named operation.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<Value>> + Send + 'static,
    {
        // ---
        let wrapped: BoxedHandler = Arc::new(move |args, ctx| Box::pin(handler(args, ctx)));

        let mut map = match self.map.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(name.into(), wrapped);
    }

    /// Look up the handler for a name, if any.
    pub(crate) fn get(&self, name: &str) -> Option<BoxedHandler> {
        // ---
        let map = match self.map.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registered_handler_runs() {
        // ---
        let handlers = Handlers::new();
        handlers.on("echo", |args, _ctx| async move { args });

        let handler = handlers.get("echo").unwrap();
        let ctx = CallContext::tag(Source::Client, Metadata::new());
        let out = handler(vec![json!(1)], ctx).await;
        assert_eq!(out, vec![json!(1)]);
    }

    #[test]
    fn test_unknown_name_is_none() {
        // ---
        let handlers = Handlers::new();
        assert!(handlers.get("missing").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        // ---
        let handlers = Handlers::new();
        handlers.on("op", |_args, _ctx| async { vec![json!("first")] });
        handlers.on("op", |_args, _ctx| async { vec![json!("second")] });

        let handler = handlers.get("op").unwrap();
        let ctx = CallContext::tag(Source::Server, Metadata::new());
        let out = futures::executor::block_on(handler(vec![], ctx));
        assert_eq!(out, vec![json!("second")]);
    }
}
