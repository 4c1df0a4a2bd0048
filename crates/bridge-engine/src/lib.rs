#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Engine execution bridge: loads an opaque solver module once per
//! execution context and serves its calls from a background worker thread,
//! falling back to the caller's thread when the worker path fails.

pub mod api;

mod calls;
mod coordinator;
mod error;
mod fallback;
mod fetch;
mod loader;
mod readiness;
mod runtime;
mod wasm;
mod worker;

#[cfg(test)]
mod testing;

pub use api::{
    BridgeConfig, BridgeStatus, ExecutionMode, open_bridge, open_bridge_with_runtimes,
};
pub use calls::{EngineCall, FindNextMove, GetVersion, SolveAll, ValidateBoard};
pub use coordinator::ExecutionCoordinator;
pub use error::{BridgeError, BridgeResult, LoadError, OperationError, WorkerError};
pub use fetch::{
    FileModuleFetcher, HttpModuleFetcher, ModuleBody, ModuleFetcher, ModuleSource, fetcher_for,
};
pub use loader::{EngineHandle, EngineLoader, LoadState};
pub use readiness::ReadinessPolicy;
pub use runtime::{Engine, EngineInstance, EngineRuntime, RuntimeRegistry};
pub use wasm::{WASMTIME_RUNTIME, WasmtimeRuntime};
pub use worker::{WorkerChannel, WorkerConfig};
