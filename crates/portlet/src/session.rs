//! Bridge session: one actor per worker.
//!
//! The actor task owns the correlation table and the worker process. Callers
//! talk to it through [`Session`] handles over a command channel; inbound
//! frames arrive from the transport reader task. Both are multiplexed in a
//! single `select!` loop together with call deadlines and finished
//! invocations, so table mutations are strictly serialized.
//!
//! The actor never waits on the transport. Outbound frames go to a writer
//! task through a bounded queue, so a worker that stops reading cannot hold
//! up deadlines, response routing or `stop`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{Envelope, RemoteError, RequestId, validate_target};
use crate::bridge::transport::{
    InboundFrame, SharedWriter, Transport, is_rejected_frame, launch, spawn_reader,
};
use crate::config::BridgeConfig;
use crate::correlation::{CorrelationTable, Waiter};
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;

const COMMAND_BUFFER: usize = 64;

/// Frames waiting for the writer task. When full, new calls and casts fail
/// with `WouldBlock` instead of queueing behind a stalled worker.
const OUTBOUND_BUFFER: usize = 256;

pub(crate) enum Command {
    Call {
        module: String,
        function: String,
        args: Vec<Value>,
        timeout: Duration,
        reply: Waiter,
    },
    Cast {
        module: String,
        function: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Outstanding {
        reply: oneshot::Sender<Vec<RequestId>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    /// Answer a command the session will no longer carry out.
    fn reject(self, error: impl Fn() -> BridgeError) {
        match self {
            Command::Call { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Command::Cast { reply, .. } => {
                let _ = reply.send(Err(error()));
            }
            Command::Outstanding { reply } => {
                let _ = reply.send(Vec::new());
            }
            Command::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Handle to a running bridge session.
///
/// Cheap to clone. The session stops when [`Session::stop`] is called, when
/// the transport fails, or when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    call_timeout: Duration,
}

/// Non-owning handle held by the dispatcher, so running invocations can call
/// back without keeping the session alive on their own.
#[derive(Clone)]
pub(crate) struct WeakSession {
    commands: mpsc::WeakSender<Command>,
    call_timeout: Duration,
}

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.commands.upgrade().map(|commands| Session {
            commands,
            call_timeout: self.call_timeout,
        })
    }
}

impl Session {
    /// Launch the worker described by `config` and start the session actor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        let (transport, child) = launch(&config)?;
        tracing::info!(pid = ?child.id(), "Worker started");
        Ok(Self::spawn_actor(transport, Some(child), config))
    }

    /// Run a session over an already connected transport (socket, in-memory
    /// duplex). No process is managed.
    pub fn from_transport(transport: Transport, config: BridgeConfig) -> Self {
        Self::spawn_actor(transport, None, config)
    }

    fn spawn_actor(transport: Transport, child: Option<Child>, config: BridgeConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let weak = WeakSession {
            commands: commands_tx.downgrade(),
            call_timeout: config.call_timeout,
        };

        let (reader, writer) = transport.into_parts();
        let (inbound, reader_task) = spawn_reader(reader);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (failures, write_failures) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_outbound(
            writer.clone(),
            outbound_rx,
            failures.clone(),
        ));
        let actor = SessionActor {
            commands: commands_rx,
            inbound,
            reader_task,
            outbound,
            write_failures,
            writer_task,
            writer: writer.clone(),
            table: CorrelationTable::new(),
            dispatcher: Dispatcher::new(Arc::new(config.functions), writer, failures, weak),
            child,
            shutdown_timeout: config.shutdown_timeout,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            call_timeout: config.call_timeout,
        }
    }

    /// Call `module.function` and wait for its result, using the session's
    /// default timeout.
    pub async fn call(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, BridgeError> {
        self.call_with_timeout(module, function, args, self.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        validate_target(module, function)?;
        if timeout.is_zero() {
            return Err(BridgeError::Protocol(
                "call timeout must be greater than zero".to_string(),
            ));
        }

        let (reply, response) = oneshot::channel();
        self.send(Command::Call {
            module: module.to_string(),
            function: function.to_string(),
            args,
            timeout,
            reply,
        })
        .await?;
        response.await.map_err(|_| BridgeError::Stopped)?
    }

    /// Invoke `module.function` without waiting for it to run.
    ///
    /// Returns once the notification is written.
    pub async fn cast(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<(), BridgeError> {
        validate_target(module, function)?;

        let (reply, written) = oneshot::channel();
        self.send(Command::Cast {
            module: module.to_string(),
            function: function.to_string(),
            args,
            reply,
        })
        .await?;
        written.await.map_err(|_| BridgeError::Stopped)?
    }

    /// Identifiers of calls still waiting for a response.
    pub async fn outstanding(&self) -> Result<Vec<RequestId>, BridgeError> {
        let (reply, ids) = oneshot::channel();
        self.send(Command::Outstanding { reply }).await?;
        ids.await.map_err(|_| BridgeError::Stopped)
    }

    /// Stop the session and release the worker.
    ///
    /// Waits up to the shutdown timeout for running inbound invocations to
    /// answer. Calls still pending afterwards fail with `Stopped`. Stopping
    /// an already stopped session succeeds.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_err() {
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn default_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn send(&self, command: Command) -> Result<(), BridgeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BridgeError::Stopped)
    }

    /// A handle with no actor behind it, for exercising the dispatcher alone.
    #[cfg(test)]
    pub(crate) fn detached(call_timeout: Duration) -> (Self, WeakSession) {
        let (commands, mut rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let weak = WeakSession {
            commands: commands.downgrade(),
            call_timeout,
        };
        (
            Self {
                commands,
                call_timeout,
            },
            weak,
        )
    }
}

/// A frame handed to the writer task, tagged with who waits on it.
struct Outbound {
    envelope: Envelope,
    origin: Origin,
}

enum Origin {
    Call(RequestId),
    Cast(oneshot::Sender<Result<(), BridgeError>>),
}

/// Write errors reported back to the actor.
pub(crate) enum WriteFailure {
    /// The codec refused one call's frame; nothing reached the stream.
    Rejected { id: RequestId, error: io::Error },
    /// The stream itself failed and the writer is unusable.
    Fatal(io::Error),
}

fn queue_error<T>(error: &TrySendError<T>) -> BridgeError {
    match error {
        TrySendError::Full(_) => BridgeError::Io(io::Error::new(
            io::ErrorKind::WouldBlock,
            "outbound queue full",
        )),
        TrySendError::Closed(_) => BridgeError::TransportClosed,
    }
}

/// Drain the outbound queue into the transport, one frame at a time.
async fn write_outbound(
    writer: SharedWriter,
    mut queue: mpsc::Receiver<Outbound>,
    failures: mpsc::UnboundedSender<WriteFailure>,
) {
    while let Some(Outbound { envelope, origin }) = queue.recv().await {
        let result = writer.send(envelope).await;
        let fatal = matches!(&result, Err(e) if !is_rejected_frame(e));

        match (origin, result) {
            (Origin::Call(_), Ok(())) => {}
            (Origin::Cast(reply), Ok(())) => {
                let _ = reply.send(Ok(()));
            }
            (Origin::Call(id), Err(error)) if !fatal => {
                tracing::warn!(%id, error = %error, "Call frame rejected");
                let _ = failures.send(WriteFailure::Rejected { id, error });
            }
            (Origin::Cast(reply), Err(error)) if !fatal => {
                let _ = reply.send(Err(BridgeError::Io(error)));
            }
            (origin, Err(error)) => {
                if let Origin::Cast(reply) = origin {
                    let _ = reply.send(Err(BridgeError::TransportClosed));
                }
                let _ = failures.send(WriteFailure::Fatal(error));
                break;
            }
        }
    }
}

struct SessionActor {
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<InboundFrame>,
    reader_task: JoinHandle<()>,
    outbound: mpsc::Sender<Outbound>,
    write_failures: mpsc::UnboundedReceiver<WriteFailure>,
    writer_task: JoinHandle<()>,
    writer: SharedWriter,
    table: CorrelationTable,
    dispatcher: Dispatcher,
    child: Option<Child>,
    shutdown_timeout: Duration,
}

impl SessionActor {
    async fn run(mut self) {
        let stop_replies = loop {
            tokio::select! {
                biased;

                frame = self.inbound.recv() => match frame {
                    Some(InboundFrame::Envelope(envelope)) => self.route(envelope),
                    Some(InboundFrame::Malformed(e)) => {
                        tracing::warn!(error = %e, "Dropping malformed frame");
                    }
                    Some(InboundFrame::Failed(e)) => {
                        tracing::error!(error = %e, "Transport failed");
                        self.close_transport().await;
                        return;
                    }
                    None => {
                        tracing::warn!("Transport closed (worker exited?)");
                        self.close_transport().await;
                        return;
                    }
                },

                Some(failure) = self.write_failures.recv() => {
                    if let Err(e) = self.write_failed(failure) {
                        tracing::error!(error = %e, "Transport write failed");
                        self.close_transport().await;
                        return;
                    }
                }

                Some(id) = self.table.next_expired(), if !self.table.is_empty() => {
                    tracing::debug!(%id, "Call timed out");
                }

                Some(()) = self.dispatcher.join_next(), if !self.dispatcher.is_idle() => {}

                command = self.commands.recv() => match command {
                    Some(Command::Stop { reply }) => break vec![reply],
                    Some(command) => self.execute(command),
                    None => {
                        tracing::debug!("All session handles dropped");
                        break Vec::new();
                    }
                },
            }
        };

        self.shutdown(stop_replies).await;
    }

    fn route(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Response { id, result } => {
                if !self.table.resolve(id, result) {
                    tracing::debug!(%id, "Discarding response for unknown or expired request");
                }
            }
            Envelope::Call {
                id,
                module,
                function,
                args,
            } => self.dispatcher.dispatch_call(id, module, function, args),
            Envelope::Notify {
                module,
                function,
                args,
            } => self.dispatcher.dispatch_notify(module, function, args),
        }
    }

    /// Fail the one call a rejected frame belonged to. A fatal error is
    /// handed back to the caller.
    fn write_failed(&mut self, failure: WriteFailure) -> Result<(), io::Error> {
        match failure {
            WriteFailure::Rejected { id, error } => {
                self.table.fail(id, BridgeError::Io(error));
                Ok(())
            }
            WriteFailure::Fatal(error) => Err(error),
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Call {
                module,
                function,
                args,
                timeout,
                reply,
            } => {
                let id = self.table.allocate_id();
                self.table
                    .register(id, reply, format!("{module}.{function}"), timeout);
                tracing::debug!(%id, %module, %function, ?timeout, "Sending call");

                let envelope = Envelope::Call {
                    id,
                    module,
                    function,
                    args,
                };
                let outbound = Outbound {
                    envelope,
                    origin: Origin::Call(id),
                };
                if let Err(e) = self.outbound.try_send(outbound) {
                    tracing::warn!(%id, "Outbound queue unavailable, failing call");
                    self.table.fail(id, queue_error(&e));
                }
            }
            Command::Cast {
                module,
                function,
                args,
                reply,
            } => {
                tracing::debug!(%module, %function, "Sending notify");
                let outbound = Outbound {
                    envelope: Envelope::Notify {
                        module,
                        function,
                        args,
                    },
                    origin: Origin::Cast(reply),
                };
                if let Err(e) = self.outbound.try_send(outbound) {
                    let error = queue_error(&e);
                    if let Origin::Cast(reply) = e.into_inner().origin {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            Command::Outstanding { reply } => {
                let _ = reply.send(self.table.ids());
            }
            Command::Stop { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    /// Orderly stop: let running invocations answer, then tear down.
    async fn shutdown(mut self, mut stop_replies: Vec<oneshot::Sender<()>>) {
        tracing::info!(
            in_flight = self.dispatcher.in_flight(),
            pending = self.table.len(),
            "Stopping session"
        );

        let grace = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(grace);
        let mut transport_open = true;
        let mut commands_open = true;

        while !self.dispatcher.is_idle() {
            tokio::select! {
                biased;

                _ = &mut grace => {
                    self.dispatcher.abort_all();
                    break;
                }

                frame = self.inbound.recv(), if transport_open => match frame {
                    Some(InboundFrame::Envelope(envelope)) => self.route_stopping(envelope),
                    Some(InboundFrame::Malformed(e)) => {
                        tracing::warn!(error = %e, "Dropping malformed frame");
                    }
                    Some(InboundFrame::Failed(_)) | None => {
                        transport_open = false;
                        self.table.fail_all(|| BridgeError::TransportClosed);
                    }
                },

                Some(failure) = self.write_failures.recv() => {
                    if let Err(e) = self.write_failed(failure) {
                        tracing::error!(error = %e, "Transport write failed while stopping");
                        self.table.fail_all(|| BridgeError::TransportClosed);
                    }
                }

                Some(id) = self.table.next_expired(), if !self.table.is_empty() => {
                    tracing::debug!(%id, "Call timed out");
                }

                Some(()) = self.dispatcher.join_next() => {}

                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Stop { reply }) => stop_replies.push(reply),
                    Some(command) => command.reject(|| BridgeError::Stopped),
                    None => commands_open = false,
                },
            }
        }

        self.commands.close();
        let failed = self.table.fail_all(|| BridgeError::Stopped);
        if failed > 0 {
            tracing::info!(failed, "Failed pending calls on stop");
        }
        self.teardown(|| BridgeError::Stopped).await;
        for reply in stop_replies {
            let _ = reply.send(());
        }
        tracing::info!("Session stopped");
    }

    /// While stopping, responses still resolve callers but no new work starts.
    fn route_stopping(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Call { id, .. } => self.dispatcher.reject_call(
                id,
                RemoteError::new("session_stopping", "session is shutting down"),
            ),
            Envelope::Notify {
                module, function, ..
            } => {
                tracing::debug!(%module, %function, "Dropping notify received while stopping");
            }
            response => self.route(response),
        }
    }

    /// The worker went away: fail everything now instead of waiting out
    /// deadlines.
    async fn close_transport(mut self) {
        self.commands.close();
        let failed = self.table.fail_all(|| BridgeError::TransportClosed);
        if failed > 0 {
            tracing::warn!(failed, "Failed pending calls after transport closed");
        }
        self.dispatcher.abort_all();
        self.teardown(|| BridgeError::TransportClosed).await;
    }

    async fn teardown(mut self, error: impl Fn() -> BridgeError) {
        while let Ok(command) = self.commands.try_recv() {
            command.reject(&error);
        }

        // Queued frames get the grace period to drain, then are dropped.
        drop(self.outbound);
        if tokio::time::timeout(self.shutdown_timeout, &mut self.writer_task)
            .await
            .is_err()
        {
            tracing::warn!("Transport write stalled, dropping queued frames");
            self.writer_task.abort();
        }
        self.dispatcher.abort_all();

        if tokio::time::timeout(self.shutdown_timeout, self.writer.close())
            .await
            .is_err()
        {
            tracing::warn!("Timed out closing transport writer");
        }
        release_child(self.child.take(), self.shutdown_timeout).await;
        self.reader_task.abort();
    }
}

/// Closing our end gives the worker EOF; escalate if it does not exit.
async fn release_child(child: Option<Child>, grace: Duration) {
    let Some(mut child) = child else {
        return;
    };

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(%status, "Worker exited");
            return;
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker"),
        Err(_) => tracing::warn!("Worker still running after EOF, terminating"),
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(error = %e, "Failed to send SIGTERM to worker");
        } else if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            tracing::info!(%status, "Worker exited after SIGTERM");
            return;
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}
