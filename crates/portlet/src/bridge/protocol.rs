//! Wire protocol types for host-worker communication.
//!
//! Every frame carries one [`Envelope`]. Three tags exist on the wire:
//! - **`S`**: synchronous call, answered by exactly one `R`
//! - **`A`**: asynchronous notify, never answered
//! - **`R`**: response to a prior `S`, correlated by id
//!
//! Both sides speak the same envelope set, so a call may originate on either end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Identifier correlating a call with its response.
///
/// Allocated per session starting at zero; wraps at `u64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const ZERO: Self = Self(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The identifier after this one, wrapping at the representable range.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message exchanged over the framed transport, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Envelope {
    #[serde(rename = "S")]
    Call {
        id: RequestId,
        module: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    #[serde(rename = "A")]
    Notify {
        module: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    #[serde(rename = "R")]
    Response { id: RequestId, result: CallResult },
}

impl Envelope {
    /// Wire tag of this envelope.
    pub fn tag(&self) -> char {
        match self {
            Self::Call { .. } => 'S',
            Self::Notify { .. } => 'A',
            Self::Response { .. } => 'R',
        }
    }
}

/// Terminal outcome of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallResult {
    Success { value: Value },
    Failure(RemoteError),
}

impl CallResult {
    pub fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(
        category: impl Into<String>,
        reason: impl Into<String>,
        trace: Vec<String>,
    ) -> Self {
        Self::Failure(RemoteError {
            category: category.into(),
            reason: reason.into(),
            trace,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure(error) => Err(error),
        }
    }
}

impl From<Result<Value, RemoteError>> for CallResult {
    fn from(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Self::Success { value },
            Err(error) => Self::Failure(error),
        }
    }
}

/// Structured failure raised by the invoked function on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{category}: {reason}")]
pub struct RemoteError {
    /// Error class, e.g. `ValueError` or `undefined_function`.
    pub category: String,
    pub reason: String,
    /// Stack description, innermost frame last.
    #[serde(default)]
    pub trace: Vec<String>,
}

impl RemoteError {
    pub fn new(category: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            reason: reason.into(),
            trace: Vec::new(),
        }
    }
}

/// Check a call target before anything is written to the transport.
///
/// Modules are dotted identifiers (`os.path`), functions plain identifiers.
pub fn validate_target(module: &str, function: &str) -> Result<(), BridgeError> {
    if module.is_empty() || !module.split('.').all(is_identifier) {
        return Err(BridgeError::Protocol(format!(
            "invalid module name {module:?}"
        )));
    }
    if !is_identifier(function) {
        return Err(BridgeError::Protocol(format!(
            "invalid function name {function:?}"
        )));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}
