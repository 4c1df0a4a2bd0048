//! Boundary to the opaque engine: the runtime that instantiates a module,
//! the instance it produces, and the call surface the instance publishes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::sync::watch;

use solver_bridge_core::{BoardState, MoveResult, SolveResult, ValidationResult};

use crate::error::{LoadError, OperationError};
use crate::fetch::ModuleBody;

/// The engine's call surface.
///
/// One value is owned by one execution context and is never handed across
/// the worker boundary; only call results cross it.
pub trait Engine: Send + Sync {
    /// Engine version string.
    fn version(&self) -> Result<String, OperationError>;
    /// Next logical deduction, if any.
    fn find_next_move(&self, board: &BoardState) -> Result<MoveResult, OperationError>;
    /// Solve the board completely.
    fn solve_all(&self, board: &BoardState) -> Result<SolveResult, OperationError>;
    /// Check the board for rule violations.
    fn validate_board(&self, board: &BoardState) -> Result<ValidationResult, OperationError>;
    /// Release engine-side resources. Called once on unload.
    fn shutdown(&self) -> Result<(), OperationError> {
        Ok(())
    }
}

/// A freshly instantiated module.
pub trait EngineInstance: Send + Sync {
    /// Start the module's own runtime.
    fn start(&self) -> Result<(), LoadError> {
        Ok(())
    }

    /// The published call surface, once available.
    fn surface(&self) -> Option<Arc<dyn Engine>>;

    /// Readiness event, for instances that announce readiness rather than
    /// (or in addition to) being polled.
    fn ready_signal(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// Constructs engine instances from module bytes.
#[async_trait]
pub trait EngineRuntime: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Instantiate from a complete buffer.
    fn instantiate(&self, module: Bytes) -> Result<Box<dyn EngineInstance>, LoadError>;

    /// Whether [`EngineRuntime::instantiate_streaming`] compiles while the
    /// module is still arriving.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Instantiate from a chunk stream. The default buffers first.
    async fn instantiate_streaming(
        &self,
        chunks: BoxStream<'static, Result<Bytes, LoadError>>,
    ) -> Result<Box<dyn EngineInstance>, LoadError> {
        let module = ModuleBody::Streaming(chunks).into_bytes().await?;
        self.instantiate(module)
    }

    /// Drop any bootstrap state the runtime installed for the last instance.
    fn release(&self) {}

    /// Ask the runtime to reclaim memory, if it can.
    fn collect_garbage(&self) {}
}

/// Named runtimes the loader bootstraps from.
#[derive(Default)]
pub struct RuntimeRegistry {
    runtimes: RwLock<HashMap<String, Arc<dyn EngineRuntime>>>,
}

impl RuntimeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in runtimes installed.
    pub fn with_builtin() -> Result<Self, LoadError> {
        let registry = Self::new();
        registry.register(Arc::new(crate::wasm::WasmtimeRuntime::new()?));
        Ok(registry)
    }

    /// Install `runtime` under its own name, replacing any previous entry.
    pub fn register(&self, runtime: Arc<dyn EngineRuntime>) {
        self.runtimes
            .write()
            .insert(runtime.name().to_string(), runtime);
    }

    /// Remove a runtime, returning it if present.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn EngineRuntime>> {
        self.runtimes.write().remove(name)
    }

    /// Look up a runtime by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn EngineRuntime>> {
        self.runtimes.read().get(name).cloned()
    }
}
