//! Error taxonomy for the bridge runtime
//!
//! Usage errors never reach the foreign runtime. Foreign exceptions and host
//! errors coming back through foreign code surface at the first call boundary
//! after they occur. Ledger consistency errors are reported, never raised.

use crate::foreign::{JType, MemberKind, RawRef};
use crate::handle::IdentityKey;
use crate::object::ForeignObject;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Foreign(#[from] ForeignException),

    #[error("host error returned through the foreign runtime: {0}")]
    HostRoundTrip(HostError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("an error occurred while creating the foreign VM (status {status}): {reason}")]
    Launch { status: i32, reason: String },
}

impl BridgeError {
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// The foreign exception carried by this error, if any
    pub fn foreign(&self) -> Option<&ForeignException> {
        match self {
            Self::Foreign(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_foreign(self) -> Option<ForeignException> {
        match self {
            Self::Foreign(e) => Some(e),
            _ => None,
        }
    }

    /// The host error carried back through the foreign runtime, if any
    pub fn host_error(&self) -> Option<&HostError> {
        match self {
            Self::HostRoundTrip(e) => Some(e),
            _ => None,
        }
    }
}

/// Bridge used outside its preconditions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("initVM() must be called first")]
    VmNotStarted,

    #[error("attachCurrentThread() must be called first")]
    ThreadNotAttached,

    #[error("class cache for {class} belongs to another bridge instance")]
    ForeignCacheMismatch { class: String },

    #[error("invalid foreign reference {handle}")]
    InvalidReference { handle: RawRef },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("VM is already running, options are ineffective")]
    OptionsIneffective,

    #[error("too many options (> {limit})")]
    TooManyOptions { limit: usize },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Call rejected before dispatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("{method}: expected {expected} arguments, got {got}")]
    ArgCountMismatch {
        method: String,
        expected: usize,
        got: usize,
    },

    #[error("{method}: argument {index} should be {expected}, got {got}")]
    ArgTypeMismatch {
        method: String,
        index: usize,
        expected: JType,
        got: JType,
    },

    #[error("{method}: target does not match a {expected:?} method")]
    TargetMismatch { method: String, expected: MemberKind },

    #[error("malformed method signature {signature:?}")]
    BadSignature { signature: String },

    #[error("class {class} not found")]
    UnknownClass { class: String },

    #[error("cannot create a foreign string: {reason}")]
    InvalidString { reason: &'static str },

    #[error("no method {name}{signature} on {class}")]
    UnknownMethod {
        class: String,
        name: String,
        signature: String,
    },
}

/// Throwable raised by the foreign runtime
///
/// Holds a counted global reference to the throwable so it can be inspected
/// after the pending exception has been cleared. The reference is absent
/// only when the foreign runtime refused to pin the throwable.
pub struct ForeignException {
    throwable: Option<ForeignObject>,
    class_name: Option<String>,
    message: Option<String>,
}

impl ForeignException {
    pub(crate) fn new(
        throwable: Option<ForeignObject>,
        class_name: Option<String>,
        message: Option<String>,
    ) -> Self {
        Self {
            throwable,
            class_name,
            message,
        }
    }

    /// Live reference to the throwable
    pub fn throwable(&self) -> Option<&ForeignObject> {
        self.throwable.as_ref()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Keep the throwable beyond the error itself
    pub fn into_throwable(self) -> Option<ForeignObject> {
        self.throwable
    }
}

impl fmt::Debug for ForeignException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignException")
            .field("throwable", &self.throwable.as_ref().map(ForeignObject::raw))
            .field("class_name", &self.class_name)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for ForeignException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self.class_name.as_deref().unwrap_or("<unknown throwable>");
        match &self.message {
            Some(message) => write!(f, "{}: {}", class, message),
            None => f.write_str(class),
        }
    }
}

impl std::error::Error for ForeignException {}

/// Error raised by host code
///
/// Cloning shares the underlying error; `same_as` tells whether two values
/// are the same original error, which is what a round trip through foreign
/// code must preserve.
#[derive(Clone)]
pub struct HostError {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
    name: String,
    traceback: Option<String>,
}

impl HostError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let name = short_type_name(std::any::type_name::<E>()).to_string();
        Self {
            inner: Arc::new(error),
            name,
            traceback: None,
        }
    }

    /// Override the host-side error name (e.g. the exception class name)
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> String {
        self.inner.to_string()
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    /// Whether both values carry the very same original error
    pub fn same_as(&self, other: &HostError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    pub fn info(&self) -> HostErrorInfo {
        HostErrorInfo {
            name: self.name.clone(),
            message: self.message(),
            traceback: self.traceback.clone(),
        }
    }
}

impl fmt::Debug for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostError")
            .field("name", &self.name)
            .field("message", &self.inner.to_string())
            .finish()
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.inner)
    }
}

/// Bridge failures inside host callbacks travel back as host errors. An
/// error that already is a host round trip keeps its identity.
impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::HostRoundTrip(host) => host,
            other => HostError::new(other).with_name("BridgeError"),
        }
    }
}

/// What foreign code may learn about a host error in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostErrorInfo {
    pub name: String,
    pub message: String,
    pub traceback: Option<String>,
}

/// Release of a counted handle the ledger has no entry for
///
/// Means a caller paired acquire and release incorrectly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deleting non-existent ref: {handle} (key {key})")]
pub struct LedgerConsistencyError {
    pub key: IdentityKey,
    pub handle: RawRef,
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_host_error_identity() {
        let a = HostError::new(io::Error::new(io::ErrorKind::Other, "boom"));
        let b = a.clone();
        let c = HostError::new(io::Error::new(io::ErrorKind::Other, "boom"));

        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(a.name(), "Error");
        assert_eq!(a.message(), "boom");
        assert!(a.downcast_ref::<io::Error>().is_some());
    }

    #[test]
    fn test_host_error_info() {
        let err = HostError::new(io::Error::new(io::ErrorKind::Other, "bad input"))
            .with_name("ValueError")
            .with_traceback("Traceback (most recent call last): ...");

        let info = err.info();
        assert_eq!(info.name, "ValueError");
        assert_eq!(info.message, "bad input");
        assert!(info.traceback.is_some());
        assert_eq!(err.to_string(), "ValueError: bad input");
    }

    #[test]
    fn test_usage_messages() {
        assert_eq!(UsageError::VmNotStarted.to_string(), "initVM() must be called first");
        assert_eq!(
            UsageError::ThreadNotAttached.to_string(),
            "attachCurrentThread() must be called first"
        );
        let err: BridgeError = UsageError::ThreadNotAttached.into();
        assert!(err.is_usage());
    }

    #[test]
    fn test_round_trip_keeps_identity() {
        let original = HostError::new(io::Error::new(io::ErrorKind::Other, "boom"));
        let through: HostError = BridgeError::HostRoundTrip(original.clone()).into();
        assert!(through.same_as(&original));

        let wrapped: HostError = BridgeError::from(UsageError::VmNotStarted).into();
        assert_eq!(wrapped.name(), "BridgeError");
        assert_eq!(wrapped.message(), "initVM() must be called first");
    }
}
