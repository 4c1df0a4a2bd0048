use std::time::Duration;

use solver_bridge_core::ShapeError;

/// Failure while turning an engine module into a callable handle.
///
/// Cloneable so one outcome can be handed to every caller waiting on the
/// same in-flight load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The module could not be retrieved.
    #[error("engine module fetch failed: {0}")]
    Fetch(String),
    /// The module server answered with a non-success status.
    #[error("engine module fetch failed with HTTP {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },
    /// The runtime rejected the module.
    #[error("engine instantiation failed: {0}")]
    Instantiate(String),
    /// No runtime is registered under the configured name.
    #[error("engine runtime `{0}` is not available")]
    RuntimeUnavailable(String),
    /// The engine did not become ready within the readiness ceiling.
    #[error("engine did not become ready within {0:?}")]
    Timeout(Duration),
    /// The engine signalled readiness without publishing its call surface.
    #[error("engine signalled readiness but published no call surface")]
    SurfaceMissing,
    /// The load was cancelled by the caller.
    #[error("engine load aborted")]
    Aborted,
}

impl LoadError {
    /// Whether this error is a caller-initiated abort rather than a fault.
    pub fn is_abort(&self) -> bool {
        matches!(self, LoadError::Aborted)
    }
}

/// The engine reported a failure for a specific call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    /// Engine-provided description.
    pub message: String,
}

impl OperationError {
    /// Build an error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure on the worker path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// Background threads cannot be used here.
    #[error("engine worker is not supported on this platform")]
    Unsupported,
    /// The worker thread could not be started.
    #[error("failed to spawn engine worker: {0}")]
    Spawn(String),
    /// The transport closed while requests were outstanding.
    #[error("engine worker disconnected")]
    Disconnected,
    /// The channel was terminated while the request was outstanding.
    #[error("engine worker was terminated")]
    Terminated,
    /// A worker round trip exceeded the configured call timeout.
    #[error("engine worker call timed out after {0:?}")]
    Timeout(Duration),
    /// A frame could not be encoded or decoded.
    #[error("malformed worker message: {0}")]
    Protocol(String),
    /// The worker answered with a structured error response.
    #[error("engine worker error: {0}")]
    Remote(String),
}

/// Error surfaced to callers of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The engine could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// The worker path failed and no fallback was possible.
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// The engine rejected the call.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// Board arrays had the wrong shape.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
