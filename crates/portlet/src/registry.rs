//! Host functions callable from the worker.
//!
//! Inbound calls name their target as `module` + `function`; the registry maps
//! that pair to a handler. Names not registered are rejected with an
//! `undefined_function` failure instead of being looked up dynamically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::protocol::{RemoteError, RequestId};
use crate::error::BridgeError;
use crate::session::Session;

/// Failure raised by a handler; becomes the failure result sent back.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("{category}: {reason}")]
    Failed {
        category: String,
        reason: String,
        trace: Vec<String>,
    },

    /// A call the handler made back across the bridge failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl InvocationError {
    pub fn new(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            category: category.into(),
            reason: reason.into(),
            trace: Vec::new(),
        }
    }

    pub fn bad_args(reason: impl Into<String>) -> Self {
        Self::BadArgs(reason.into())
    }

    /// Wire form of this failure. `location` is appended to the trace.
    pub fn into_remote(self, location: &str) -> RemoteError {
        let (category, reason, mut trace) = match self {
            Self::BadArgs(reason) => ("bad_args".to_string(), reason, Vec::new()),
            Self::Failed {
                category,
                reason,
                trace,
            } => (category, reason, trace),
            // Keep the original failure when a nested remote call raised.
            Self::Bridge(BridgeError::Remote(remote)) => {
                (remote.category, remote.reason, remote.trace)
            }
            Self::Bridge(other) => ("bridge_error".to_string(), other.to_string(), Vec::new()),
        };
        trace.push(location.to_string());
        RemoteError {
            category,
            reason,
            trace,
        }
    }
}

/// Per-invocation information handed to a handler.
#[derive(Clone)]
pub struct CallContext {
    session: Session,
    module: String,
    function: String,
    id: Option<RequestId>,
}

impl CallContext {
    pub(crate) fn new(
        session: Session,
        module: impl Into<String>,
        function: impl Into<String>,
        id: Option<RequestId>,
    ) -> Self {
        Self {
            session,
            module: module.into(),
            function: function.into(),
            id,
        }
    }

    /// Session that delivered this invocation; handlers may call back
    /// through it.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Request id of the inbound call; `None` for notifications.
    pub fn request_id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn is_notify(&self) -> bool {
        self.id.is_none()
    }
}

/// A host function the worker may invoke.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, InvocationError>;
}

/// Adapter turning an async closure into a [`Handler`].
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
{
    async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, InvocationError> {
        (self.0)(ctx, args).await
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `module.function`, replacing any previous one.
    pub fn with_handler(
        mut self,
        module: impl Into<String>,
        function: impl Into<String>,
        handler: impl Handler,
    ) -> Self {
        let key = (module.into(), function.into());
        if self.handlers.insert(key.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(module = %key.0, function = %key.1, "Replaced registered function");
        }
        self
    }

    pub fn with_fn<F, Fut>(
        self,
        module: impl Into<String>,
        function: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
    {
        self.with_handler(module, function, FnHandler(f))
    }

    pub fn lookup(&self, module: &str, function: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&(module.to_string(), function.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Pull the integer argument at `index`, as most numeric handlers need.
pub fn int_arg(args: &[Value], index: usize) -> Result<i64, InvocationError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| InvocationError::bad_args(format!("argument {index} must be an integer")))
}
