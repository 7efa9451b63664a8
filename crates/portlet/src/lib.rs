//! portlet: bidirectional RPC bridge to a worker subprocess.

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod registry;
pub mod session;

pub use bridge::protocol::{CallResult, Envelope, RemoteError, RequestId};
pub use bridge::transport::{InterpreterSpawner, ProgramSpawner, SpawnError, WorkerSpawner};
pub use config::{BridgeConfig, ConfigError, EnvOverride, PacketWidth};
pub use error::BridgeError;
pub use registry::{CallContext, FunctionRegistry, Handler, InvocationError};
pub use session::Session;
