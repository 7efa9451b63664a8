//! Worker process transport.
//!
//! Two channel layouts, chosen by `BridgeConfig::use_stdio`:
//! - **stdio**: frames over the child's stdin/stdout, stderr inherited
//! - **fd 3/4** (unix only): child keeps the host's stdio; it reads frames
//!   on fd 3 and writes them on fd 4

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{EnvelopeCodec, MalformedFrame};
use super::protocol::Envelope;
use crate::config::{BridgeConfig, EnvOverride, PacketWidth};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub type FrameReader = FramedRead<BoxedReader, EnvelopeCodec>;
type FrameWriter = FramedWrite<BoxedWriter, EnvelopeCodec>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} not captured")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
///
/// Returns the bare command; stdio wiring, environment overrides and the
/// working directory are applied by [`launch`].
pub trait WorkerSpawner: Send + Sync {
    fn command(&self, config: &BridgeConfig) -> Command;
}

/// Runs `<interpreter> -u -m <runtime_module>` with framing flags.
pub struct InterpreterSpawner;

impl WorkerSpawner for InterpreterSpawner {
    fn command(&self, config: &BridgeConfig) -> Command {
        let mut command = Command::new(&config.interpreter);
        command
            .arg("-u")
            .arg("-m")
            .arg(&config.runtime_module)
            .args(launch_args(config));

        if !config.module_search_path.is_empty() {
            let mut paths = config.module_search_path.clone();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            match std::env::join_paths(paths) {
                Ok(joined) => {
                    command.env("PYTHONPATH", joined);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring unusable module search path");
                }
            }
        }

        command
    }
}

/// Runs an arbitrary program that speaks the framing directly.
pub struct ProgramSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProgramSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for ProgramSpawner {
    fn command(&self, _config: &BridgeConfig) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// Flags telling the worker runtime how frames are laid out.
pub fn launch_args(config: &BridgeConfig) -> Vec<String> {
    vec![
        format!("--packet={}", config.packet),
        if config.use_stdio {
            "--stdio".to_string()
        } else {
            "--nouse_stdio".to_string()
        },
        format!("--buffer_size={}", config.effective_max_frame_length()),
    ]
}

/// Serialized write access to the outbound frame stream.
///
/// Each `send` holds the lock for a whole frame, so concurrent writers never
/// interleave bytes.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Option<FrameWriter>>>,
}

impl SharedWriter {
    fn new(writer: FrameWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Write one frame.
    ///
    /// A frame the codec refuses (see [`is_rejected_frame`]) leaves the stream
    /// untouched. Any other failure may leave a partial frame behind, so the
    /// writer is dropped and every later send fails with `BrokenPipe`.
    pub async fn send(&self, envelope: Envelope) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport writer closed",
            ));
        };
        let result = writer.send(envelope).await;
        if let Err(e) = &result
            && !is_rejected_frame(e)
        {
            tracing::warn!(error = %e, "Transport write failed, closing writer");
            *guard = None;
        }
        result
    }

    /// Flush and drop the writer; the peer sees end of stream.
    pub async fn close(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Error closing transport writer");
        }
    }
}

/// True when `send` failed because the codec refused the frame (too long for
/// the packet width, or not serializable). Nothing reached the stream.
pub fn is_rejected_frame(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
    )
}

/// Framed byte stream to one worker.
pub struct Transport {
    reader: FrameReader,
    writer: SharedWriter,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W, packet: PacketWidth, max_frame_length: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let reader: BoxedReader = Box::pin(reader);
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            reader: FramedRead::new(
                reader,
                EnvelopeCodec::with_max_frame_length(packet, max_frame_length),
            ),
            writer: SharedWriter::new(FramedWrite::new(
                writer,
                EnvelopeCodec::with_max_frame_length(packet, max_frame_length),
            )),
        }
    }

    /// Transport over a single bidirectional stream (socket, duplex pipe).
    pub fn from_stream<S>(stream: S, packet: PacketWidth) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, packet, packet.max_frame_length())
    }

    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    pub fn into_parts(self) -> (FrameReader, SharedWriter) {
        (self.reader, self.writer)
    }
}

/// Inbound traffic as seen by the session.
#[derive(Debug)]
pub enum InboundFrame {
    Envelope(Envelope),
    Malformed(MalformedFrame),
    /// Framing broke or the pipe failed; no further frames follow.
    Failed(io::Error),
}

/// Frames decoded ahead of the session before the reader waits.
pub const INBOUND_BUFFER: usize = 1024;

/// Pump decoded frames into a channel until end of stream.
///
/// The channel is bounded: when it fills, the reader stops pulling from the
/// worker. The session never waits on a transport write while consuming it,
/// so this backpressure cannot close a cycle with the worker.
pub fn spawn_reader(mut reader: FrameReader) -> (mpsc::Receiver<InboundFrame>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    let handle = tokio::spawn(async move {
        while let Some(item) = reader.next().await {
            let frame = match item {
                Ok(Ok(envelope)) => InboundFrame::Envelope(envelope),
                Ok(Err(malformed)) => InboundFrame::Malformed(malformed),
                Err(e) => {
                    let _ = tx.send(InboundFrame::Failed(e)).await;
                    break;
                }
            };
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        tracing::debug!("Transport reader exiting");
    });
    (rx, handle)
}

/// Spawn the worker described by `config` and connect its frame channel.
pub fn launch(config: &BridgeConfig) -> Result<(Transport, Child), SpawnError> {
    let mut command = config.spawner.command(config);
    command.kill_on_drop(true);

    if let Some(dir) = &config.cwd {
        command.current_dir(dir);
    }
    for entry in &config.env {
        match entry {
            EnvOverride::Set { name, value } => {
                command.env(name, value);
            }
            EnvOverride::Unset { name } => {
                command.env_remove(name);
            }
        }
    }

    let max_frame_length = config.effective_max_frame_length();
    tracing::debug!(
        program = ?command.as_std().get_program(),
        use_stdio = config.use_stdio,
        packet = %config.packet,
        "Spawning worker"
    );

    if config.use_stdio {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let transport = Transport::new(stdout, stdin, config.packet, max_frame_length);
        Ok((transport, child))
    } else {
        launch_with_fds(command, config.packet, max_frame_length)
    }
}

#[cfg(unix)]
fn launch_with_fds(
    mut command: Command,
    packet: PacketWidth,
    max_frame_length: usize,
) -> Result<(Transport, Child), SpawnError> {
    use std::os::fd::{AsRawFd, OwnedFd};
    use tokio::net::unix::pipe;

    // Close-on-exec, so concurrently spawned processes never hold our ends.
    let (child_read, host_write) = io::pipe()?;
    let (host_read, child_write) = io::pipe()?;

    let child_read_fd = child_read.as_raw_fd();
    let child_write_fd = child_write.as_raw_fd();
    let host_read_fd = host_read.as_raw_fd();
    let host_write_fd = host_write.as_raw_fd();

    // SAFETY: only async-signal-safe libc calls between fork and exec.
    unsafe {
        command.pre_exec(move || {
            // Lift both child ends clear of 3/4 first so placing one cannot
            // clobber the other.
            let r = libc::fcntl(child_read_fd, libc::F_DUPFD, 10);
            let w = libc::fcntl(child_write_fd, libc::F_DUPFD, 10);
            if r < 0 || w < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::dup2(r, 3) < 0 || libc::dup2(w, 4) < 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in [r, w, child_read_fd, child_write_fd, host_read_fd, host_write_fd] {
                if fd > 4 {
                    libc::close(fd);
                }
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    drop(child_read);
    drop(child_write);

    let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(host_read))?;
    let writer = pipe::Sender::from_owned_fd(OwnedFd::from(host_write))?;
    Ok((
        Transport::new(reader, writer, packet, max_frame_length),
        child,
    ))
}

#[cfg(not(unix))]
fn launch_with_fds(
    _command: Command,
    _packet: PacketWidth,
    _max_frame_length: usize,
) -> Result<(Transport, Child), SpawnError> {
    Err(SpawnError::Other(
        "fd 3/4 transport requires a unix platform; enable use_stdio".to_string(),
    ))
}

/// Writer whose every write fails with `kind`.
#[cfg(test)]
pub(crate) struct RefusingWriter(pub io::ErrorKind);

#[cfg(test)]
impl AsyncWrite for RefusingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::task::Poll::Ready(Err(io::Error::new(self.0, "write refused")))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
