//! Concurrent execution of inbound invocations.
//!
//! Every inbound Call or Notify runs in its own task, so a slow host function
//! never holds up the session's read loop or other invocations. Calls write
//! their Response through the shared writer when they finish.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::bridge::protocol::{CallResult, Envelope, RemoteError, RequestId};
use crate::bridge::transport::{SharedWriter, is_rejected_frame};
use crate::registry::{CallContext, FunctionRegistry, Handler};
use crate::session::{Session, WeakSession, WriteFailure};

pub struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    writer: ResponseWriter,
    session: WeakSession,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<FunctionRegistry>,
        writer: SharedWriter,
        failures: mpsc::UnboundedSender<WriteFailure>,
        session: WeakSession,
    ) -> Self {
        Self {
            registry,
            writer: ResponseWriter { writer, failures },
            session,
            tasks: JoinSet::new(),
        }
    }

    /// Run `module.function` and answer with a Response carrying `id`.
    pub fn dispatch_call(
        &mut self,
        id: RequestId,
        module: String,
        function: String,
        args: Vec<Value>,
    ) {
        let target = format!("{module}.{function}");
        let prepared = self.prepare(&module, &function);
        let writer = self.writer.clone();

        tracing::debug!(%id, %target, "Dispatching inbound call");
        self.tasks.spawn(async move {
            let result = match prepared {
                Ok((handler, session)) => {
                    let ctx = CallContext::new(session, module, function, Some(id));
                    invoke(handler, ctx, args, &target).await
                }
                Err(error) => CallResult::Failure(error),
            };
            if !result.is_success() {
                tracing::debug!(%id, %target, "Inbound call failed");
            }
            writer.respond(id, result, &target).await;
        });
    }

    /// Run `module.function` with no response; failures are only logged.
    pub fn dispatch_notify(&mut self, module: String, function: String, args: Vec<Value>) {
        let target = format!("{module}.{function}");
        let prepared = self.prepare(&module, &function);

        tracing::debug!(%target, "Dispatching inbound notify");
        self.tasks.spawn(async move {
            let result = match prepared {
                Ok((handler, session)) => {
                    let ctx = CallContext::new(session, module, function, None);
                    invoke(handler, ctx, args, &target).await
                }
                Err(error) => CallResult::Failure(error),
            };
            if let CallResult::Failure(error) = result {
                tracing::warn!(
                    %target,
                    category = %error.category,
                    reason = %error.reason,
                    "Notify handler failed"
                );
            }
        });
    }

    /// Answer an inbound call without running it.
    pub fn reject_call(&mut self, id: RequestId, error: RemoteError) {
        let writer = self.writer.clone();
        self.tasks.spawn(async move {
            writer
                .respond(id, CallResult::Failure(error), "rejected call")
                .await;
        });
    }

    fn prepare(
        &self,
        module: &str,
        function: &str,
    ) -> Result<(Arc<dyn Handler>, Session), RemoteError> {
        let handler = self.registry.lookup(module, function).ok_or_else(|| {
            RemoteError::new(
                "undefined_function",
                format!("{module}.{function} is not registered"),
            )
        })?;
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| RemoteError::new("session_closed", "session is shutting down"))?;
        Ok((handler, session))
    }

    /// Number of invocations still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next invocation to finish. None when nothing is running.
    pub async fn join_next(&mut self) -> Option<()> {
        let joined = self.tasks.join_next().await?;
        if let Err(e) = joined
            && !e.is_cancelled()
        {
            tracing::error!(error = %e, "Dispatch task failed");
        }
        Some(())
    }

    /// Cancel every running invocation. Their callers get no response.
    pub fn abort_all(&mut self) -> usize {
        let count = self.tasks.len();
        if count > 0 {
            tracing::warn!(count, "Aborting in-flight invocations");
        }
        self.tasks.abort_all();
        count
    }
}

/// Response path shared by dispatch tasks.
#[derive(Clone)]
struct ResponseWriter {
    writer: SharedWriter,
    failures: mpsc::UnboundedSender<WriteFailure>,
}

impl ResponseWriter {
    async fn respond(&self, id: RequestId, result: CallResult, target: &str) {
        let error = match self.writer.send(Envelope::Response { id, result }).await {
            Ok(()) => return,
            Err(e) => e,
        };

        if !is_rejected_frame(&error) {
            tracing::warn!(%id, %target, error = %error, "Failed to write response");
            let _ = self.failures.send(WriteFailure::Fatal(error));
            return;
        }

        // The caller still needs an answer for this id.
        tracing::warn!(%id, %target, error = %error, "Response rejected by codec");
        let fallback = CallResult::failure(
            "bridge_error",
            format!("response could not be sent: {error}"),
            vec![target.to_string()],
        );
        if let Err(e) = self
            .writer
            .send(Envelope::Response {
                id,
                result: fallback,
            })
            .await
            && !is_rejected_frame(&e)
        {
            let _ = self.failures.send(WriteFailure::Fatal(e));
        }
    }
}

async fn invoke(
    handler: Arc<dyn Handler>,
    ctx: CallContext,
    args: Vec<Value>,
    target: &str,
) -> CallResult {
    // A panicking handler must still answer, or the caller waits forever.
    match AssertUnwindSafe(handler.invoke(ctx, args))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => CallResult::success(value),
        Ok(Err(e)) => CallResult::Failure(e.into_remote(target)),
        Err(panic) => {
            let reason = panic_message(&panic);
            tracing::error!(%target, %reason, "Handler panicked");
            CallResult::failure("panic", reason, vec![target.to_string()])
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::{FrameReader, Transport};
    use crate::config::PacketWidth;
    use crate::registry::{InvocationError, int_arg};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    /// Dispatcher writing into one end of a duplex; the other end is returned
    /// for reading responses. The session handle must be kept alive.
    fn harness(registry: FunctionRegistry) -> (Dispatcher, FrameReader, Session) {
        harness_with_limit(registry, PacketWidth::Four.max_frame_length())
    }

    fn harness_with_limit(
        registry: FunctionRegistry,
        max_frame_length: usize,
    ) -> (Dispatcher, FrameReader, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(a);
        let writer = Transport::new(read, write, PacketWidth::Four, max_frame_length).writer();
        let (peer_reader, _peer_writer) = Transport::from_stream(b, PacketWidth::Four).into_parts();
        let (session, weak) = Session::detached(Duration::from_secs(1));
        let (failures, _) = mpsc::unbounded_channel();
        (
            Dispatcher::new(Arc::new(registry), writer, failures, weak),
            peer_reader,
            session,
        )
    }

    async fn next_response(reader: &mut FrameReader) -> (RequestId, CallResult) {
        match reader.next().await.unwrap().unwrap().unwrap() {
            Envelope::Response { id, result } => (id, result),
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn math() -> FunctionRegistry {
        FunctionRegistry::new()
            .with_fn("math", "add", |_ctx, args| async move {
                Ok::<_, InvocationError>(json!(int_arg(&args, 0)? + int_arg(&args, 1)?))
            })
            .with_fn("math", "slow", |_ctx, args| async move {
                let ms = int_arg(&args, 0)?;
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok::<_, InvocationError>(json!(ms))
            })
            .with_fn("math", "explode", |_ctx, _args| async move {
                if true {
                    panic!("boom");
                }
                Ok::<_, InvocationError>(Value::Null)
            })
            .with_fn("math", "sqrt", |_ctx, _args| async move {
                Err::<Value, _>(InvocationError::new("ValueError", "math domain error"))
            })
            .with_fn("math", "digits", |_ctx, args| async move {
                let n = int_arg(&args, 0)?;
                Ok::<_, InvocationError>(json!("9".repeat(n as usize)))
            })
    }

    #[tokio::test]
    async fn call_writes_success_response() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.dispatch_call(
            RequestId::new(7),
            "math".to_string(),
            "add".to_string(),
            vec![json!(2), json!(3)],
        );

        let (id, result) = next_response(&mut reader).await;
        assert_eq!(id, RequestId::new(7));
        assert_eq!(result.into_result().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn unknown_function_is_undefined() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.dispatch_call(
            RequestId::new(1),
            "math".to_string(),
            "cube".to_string(),
            vec![],
        );

        let (_, result) = next_response(&mut reader).await;
        let err = result.into_result().unwrap_err();
        assert_eq!(err.category, "undefined_function");
        assert_eq!(err.reason, "math.cube is not registered");
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_failures() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.dispatch_call(
            RequestId::new(1),
            "math".to_string(),
            "sqrt".to_string(),
            vec![json!(-1)],
        );
        let (_, result) = next_response(&mut reader).await;
        let err = result.into_result().unwrap_err();
        assert_eq!(err.category, "ValueError");
        assert_eq!(err.trace, vec!["math.sqrt"]);

        dispatcher.dispatch_call(
            RequestId::new(2),
            "math".to_string(),
            "explode".to_string(),
            vec![],
        );
        let (id, result) = next_response(&mut reader).await;
        assert_eq!(id, RequestId::new(2));
        let err = result.into_result().unwrap_err();
        assert_eq!(err.category, "panic");
        assert_eq!(err.reason, "boom");
    }

    #[tokio::test]
    async fn bad_arguments_are_reported() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.dispatch_call(
            RequestId::new(3),
            "math".to_string(),
            "add".to_string(),
            vec![json!("two")],
        );
        let (_, result) = next_response(&mut reader).await;
        assert_eq!(result.into_result().unwrap_err().category, "bad_args");
    }

    #[tokio::test]
    async fn slow_call_does_not_block_later_ones() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.dispatch_call(
            RequestId::new(1),
            "math".to_string(),
            "slow".to_string(),
            vec![json!(100)],
        );
        dispatcher.dispatch_call(
            RequestId::new(2),
            "math".to_string(),
            "add".to_string(),
            vec![json!(1), json!(1)],
        );
        assert_eq!(dispatcher.in_flight(), 2);

        let (first, _) = next_response(&mut reader).await;
        let (second, _) = next_response(&mut reader).await;
        assert_eq!(first, RequestId::new(2));
        assert_eq!(second, RequestId::new(1));

        while dispatcher.join_next().await.is_some() {}
        assert!(dispatcher.is_idle());
    }

    #[tokio::test]
    async fn notify_writes_nothing() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.dispatch_notify("math".to_string(), "sqrt".to_string(), vec![]);
        dispatcher.dispatch_notify("nope".to_string(), "missing".to_string(), vec![]);
        while dispatcher.join_next().await.is_some() {}

        // Only the marker call's response shows up.
        dispatcher.dispatch_call(
            RequestId::new(9),
            "math".to_string(),
            "add".to_string(),
            vec![json!(0), json!(0)],
        );
        let (id, _) = next_response(&mut reader).await;
        assert_eq!(id, RequestId::new(9));
    }

    #[tokio::test]
    async fn dropped_session_answers_session_closed() {
        let (mut dispatcher, mut reader, session) = harness(math());
        drop(session);
        dispatcher.dispatch_call(
            RequestId::new(4),
            "math".to_string(),
            "add".to_string(),
            vec![json!(1), json!(2)],
        );
        let (_, result) = next_response(&mut reader).await;
        assert_eq!(result.into_result().unwrap_err().category, "session_closed");
    }

    #[tokio::test]
    async fn reject_call_answers_with_given_error() {
        let (mut dispatcher, mut reader, _session) = harness(math());
        dispatcher.reject_call(
            RequestId::new(5),
            RemoteError::new("session_stopping", "no new work"),
        );
        let (id, result) = next_response(&mut reader).await;
        assert_eq!(id, RequestId::new(5));
        assert_eq!(result.into_result().unwrap_err().category, "session_stopping");
    }

    #[tokio::test]
    async fn unsendable_response_still_answers_the_caller() {
        let (mut dispatcher, mut reader, _session) = harness_with_limit(math(), 256);
        dispatcher.dispatch_call(
            RequestId::new(6),
            "math".to_string(),
            "digits".to_string(),
            vec![json!(1000)],
        );
        let (id, result) = next_response(&mut reader).await;
        assert_eq!(id, RequestId::new(6));
        let err = result.into_result().unwrap_err();
        assert_eq!(err.category, "bridge_error");
        assert_eq!(err.trace, vec!["math.digits"]);

        // The stream is intact for the next response.
        dispatcher.dispatch_call(
            RequestId::new(7),
            "math".to_string(),
            "digits".to_string(),
            vec![json!(3)],
        );
        let (id, result) = next_response(&mut reader).await;
        assert_eq!(id, RequestId::new(7));
        assert_eq!(result.into_result().unwrap(), json!("999"));
    }

    #[tokio::test]
    async fn abort_all_cancels_running_work() {
        let (mut dispatcher, _reader, _session) = harness(math());
        dispatcher.dispatch_call(
            RequestId::new(1),
            "math".to_string(),
            "slow".to_string(),
            vec![json!(10_000)],
        );
        assert_eq!(dispatcher.abort_all(), 1);
        assert!(dispatcher.join_next().await.is_some());
        assert!(dispatcher.join_next().await.is_none());
    }
}
