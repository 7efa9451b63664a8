//! Session configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::transport::{InterpreterSpawner, WorkerSpawner};
use crate::registry::FunctionRegistry;

/// Largest frame accepted by default when the packet width allows it.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Width of the big-endian length prefix in front of every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PacketWidth {
    One,
    Two,
    #[default]
    Four,
}

impl PacketWidth {
    pub fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// Largest payload the prefix can describe.
    pub fn max_frame_length(self) -> usize {
        match self {
            Self::One => u8::MAX as usize,
            Self::Two => u16::MAX as usize,
            Self::Four => u32::MAX as usize,
        }
    }
}

impl TryFrom<u8> for PacketWidth {
    type Error = ConfigError;

    fn try_from(bytes: u8) -> Result<Self, Self::Error> {
        match bytes {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            other => Err(ConfigError::PacketWidth(other)),
        }
    }
}

impl fmt::Display for PacketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// One entry of the worker's environment overrides, applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    Set { name: String, value: String },
    Unset { name: String },
}

impl EnvOverride {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn unset(name: impl Into<String>) -> Self {
        Self::Unset { name: name.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported packet width {0}: expected 1, 2 or 4")]
    PacketWidth(u8),
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub struct BridgeConfig {
    /// Frames over the worker's stdin/stdout when true, fds 3/4 otherwise.
    pub use_stdio: bool,
    pub packet: PacketWidth,
    pub interpreter: PathBuf,
    /// Module the interpreter runs (`-m`) to host the worker side.
    pub runtime_module: String,
    /// Prepended to the worker's module search path.
    pub module_search_path: Vec<PathBuf>,
    pub env: Vec<EnvOverride>,
    pub cwd: Option<PathBuf>,
    /// Deadline for `Session::call`.
    pub call_timeout: Duration,
    pub max_frame_length: usize,
    /// Grace period for in-flight dispatches and worker exit on stop.
    pub shutdown_timeout: Duration,
    /// Host functions the worker may call.
    pub functions: FunctionRegistry,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            use_stdio: true,
            packet: PacketWidth::Four,
            interpreter: PathBuf::from("python"),
            runtime_module: "portlet.worker".to_string(),
            module_search_path: Vec::new(),
            env: Vec::new(),
            cwd: None,
            call_timeout: Duration::from_secs(30),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            shutdown_timeout: Duration::from_secs(5),
            functions: FunctionRegistry::new(),
            spawner: Arc::new(InterpreterSpawner),
        }
    }

    /// Build from `PORTLET_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(interpreter) = lookup("PORTLET_INTERPRETER") {
            config.interpreter = PathBuf::from(interpreter);
        }

        if let Some(value) = lookup("PORTLET_PACKET") {
            let bytes = value
                .trim()
                .parse::<u8>()
                .map_err(|e| ConfigError::InvalidValue {
                    var: "PORTLET_PACKET",
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
            config.packet = PacketWidth::try_from(bytes)?;
        }

        if let Some(value) = lookup("PORTLET_USE_STDIO") {
            config.use_stdio = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "PORTLET_USE_STDIO",
                        value,
                        reason: "expected true or false".to_string(),
                    });
                }
            };
        }

        if let Some(value) = lookup("PORTLET_PYTHONPATH") {
            config.module_search_path = std::env::split_paths(&value).collect();
        }

        if let Some(value) = lookup("PORTLET_CALL_TIMEOUT_MS") {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue {
                    var: "PORTLET_CALL_TIMEOUT_MS",
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
            if millis == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "PORTLET_CALL_TIMEOUT_MS",
                    value,
                    reason: "must be positive".to_string(),
                });
            }
            config.call_timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_stdio(mut self, use_stdio: bool) -> Self {
        self.use_stdio = use_stdio;
        self
    }

    pub fn with_packet(mut self, packet: PacketWidth) -> Self {
        self.packet = packet;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_runtime_module(mut self, module: impl Into<String>) -> Self {
        self.runtime_module = module.into();
        self
    }

    pub fn with_module_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_search_path.push(path.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvOverride::set(name, value));
        self
    }

    pub fn without_env(mut self, name: impl Into<String>) -> Self {
        self.env.push(EnvOverride::unset(name));
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Max frame length after clamping to what the packet width can express.
    pub fn effective_max_frame_length(&self) -> usize {
        self.max_frame_length.min(self.packet.max_frame_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn packet_width_accepts_supported_sizes() {
        assert_eq!(PacketWidth::try_from(1).unwrap(), PacketWidth::One);
        assert_eq!(PacketWidth::try_from(2).unwrap(), PacketWidth::Two);
        assert_eq!(PacketWidth::try_from(4).unwrap(), PacketWidth::Four);
    }

    #[test]
    fn packet_width_rejects_other_sizes() {
        for bytes in [0, 3, 8] {
            assert!(matches!(
                PacketWidth::try_from(bytes),
                Err(ConfigError::PacketWidth(b)) if b == bytes
            ));
        }
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::new();
        assert!(config.use_stdio);
        assert_eq!(config.packet, PacketWidth::Four);
        assert_eq!(config.interpreter, PathBuf::from("python"));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert!(config.functions.is_empty());
    }

    #[test]
    fn max_frame_length_clamped_to_packet_width() {
        let config = BridgeConfig::new().with_packet(PacketWidth::One);
        assert_eq!(config.effective_max_frame_length(), 255);

        let config = BridgeConfig::new().with_max_frame_length(1024);
        assert_eq!(config.effective_max_frame_length(), 1024);
    }

    #[test]
    fn env_overrides_keep_order() {
        let config = BridgeConfig::new()
            .with_env("A", "1")
            .without_env("B")
            .with_env("A", "2");
        assert_eq!(
            config.env,
            vec![
                EnvOverride::set("A", "1"),
                EnvOverride::unset("B"),
                EnvOverride::set("A", "2"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn from_lookup_reads_all_variables() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("PORTLET_INTERPRETER", "/usr/bin/python3"),
            ("PORTLET_PACKET", "2"),
            ("PORTLET_USE_STDIO", "false"),
            ("PORTLET_PYTHONPATH", "/opt/a:/opt/b"),
            ("PORTLET_CALL_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.interpreter, PathBuf::from("/usr/bin/python3"));
        assert_eq!(config.packet, PacketWidth::Two);
        assert!(!config.use_stdio);
        assert_eq!(
            config.module_search_path,
            vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
        assert_eq!(config.call_timeout, Duration::from_millis(250));
    }

    #[test]
    fn from_lookup_without_variables_uses_defaults() {
        let config = BridgeConfig::from_lookup(|_| None).unwrap();
        assert!(config.use_stdio);
        assert_eq!(config.packet, PacketWidth::Four);
    }

    #[test]
    fn from_lookup_rejects_bad_packet() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("PORTLET_PACKET", "3")]))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::PacketWidth(3)));

        let err = BridgeConfig::from_lookup(lookup_from(&[("PORTLET_PACKET", "four")]))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "PORTLET_PACKET", .. }
        ));
    }

    #[test]
    fn from_lookup_rejects_zero_timeout() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("PORTLET_CALL_TIMEOUT_MS", "0")]))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "PORTLET_CALL_TIMEOUT_MS", .. }
        ));
    }

    #[test]
    fn from_lookup_rejects_bad_stdio_flag() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("PORTLET_USE_STDIO", "maybe")]))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "PORTLET_USE_STDIO", .. }
        ));
    }
}
