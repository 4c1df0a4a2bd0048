//! Public configuration and diagnostics types.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::ExecutionCoordinator;
use crate::error::LoadError;
use crate::fetch::{ModuleSource, fetcher_for};
use crate::loader::{EngineLoader, LoadState};
use crate::readiness::ReadinessPolicy;
use crate::runtime::RuntimeRegistry;
use crate::wasm::WASMTIME_RUNTIME;
use crate::worker::{WorkerChannel, WorkerConfig};

/// Which context serves engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// The background worker thread.
    Worker,
    /// The caller's own thread.
    MainThread,
}

/// Configuration for a bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Where the engine module is fetched from.
    pub module: ModuleSource,

    /// Registry name of the runtime that instantiates the module.
    pub runtime: String,

    /// Serve calls from the worker thread when possible.
    pub prefer_worker: bool,

    /// Bounds on waiting for a freshly loaded engine.
    pub readiness: ReadinessPolicy,

    /// HTTP timeout for module downloads.
    pub fetch_timeout: Duration,

    /// Upper bound on one worker round trip.
    ///
    /// Off by default: once an engine is ready its calls are not timed.
    /// When set, an expired worker call is retried on the main thread,
    /// which itself is never timed.
    pub call_timeout: Option<Duration>,
}

impl BridgeConfig {
    /// Default module download timeout.
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default runtime name.
    pub const DEFAULT_RUNTIME: &'static str = WASMTIME_RUNTIME;

    /// Config with defaults for everything but the module location.
    pub fn new(module: ModuleSource) -> Self {
        Self {
            module,
            runtime: Self::DEFAULT_RUNTIME.to_string(),
            prefer_worker: true,
            readiness: ReadinessPolicy::default(),
            fetch_timeout: Self::DEFAULT_FETCH_TIMEOUT,
            call_timeout: None,
        }
    }
}

/// Snapshot of the bridge, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeStatus {
    /// Path that serves (or would serve) the next call.
    pub mode: ExecutionMode,
    /// Whether the worker has a loaded engine.
    pub worker_ready: bool,
    /// State of the main-thread engine.
    pub main_load_state: LoadState,
}

/// Build a bridge with the built-in runtimes.
pub fn open_bridge(config: &BridgeConfig) -> Result<ExecutionCoordinator, LoadError> {
    open_bridge_with_runtimes(config, Arc::new(RuntimeRegistry::with_builtin()?))
}

/// Build a bridge whose two contexts bootstrap from `runtimes`.
///
/// Each context gets its own fetcher and loads its own engine.
pub fn open_bridge_with_runtimes(
    config: &BridgeConfig,
    runtimes: Arc<RuntimeRegistry>,
) -> Result<ExecutionCoordinator, LoadError> {
    let worker = WorkerChannel::new(WorkerConfig {
        fetcher: fetcher_for(&config.module, config.fetch_timeout)?,
        runtimes: runtimes.clone(),
        runtime: config.runtime.clone(),
        readiness: config.readiness,
        call_timeout: config.call_timeout,
    });
    let main = EngineLoader::new(
        "main",
        fetcher_for(&config.module, config.fetch_timeout)?,
        runtimes,
        config.runtime.clone(),
        config.readiness,
    );
    Ok(ExecutionCoordinator::new(worker, main, config.prefer_worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FAKE_VERSION, FakeRuntime, Readiness, registry_with};

    #[test]
    fn defaults() {
        let config = BridgeConfig::new("solver.wasm".parse().unwrap());
        assert_eq!(config.runtime, "wasmtime");
        assert!(config.prefer_worker);
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.readiness.timeout, Duration::from_secs(5));
    }

    #[test]
    fn status_serializes_with_kebab_mode() {
        let status = BridgeStatus {
            mode: ExecutionMode::MainThread,
            worker_ready: false,
            main_load_state: LoadState::Ready,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["mode"], "main-thread");
        assert_eq!(value["main_load_state"], "ready");
    }

    #[tokio::test]
    async fn bridge_from_config_loads_module_file_in_both_contexts() {
        let path = std::env::temp_dir().join(format!("solver-bridge-api-{}.bin", std::process::id()));
        std::fs::write(&path, b"fake-module").unwrap();

        let mut config = BridgeConfig::new(ModuleSource::Path(path.clone()));
        config.runtime = "fake".to_string();
        let runtime = FakeRuntime::new(Readiness::Immediate);
        let bridge = open_bridge_with_runtimes(&config, registry_with(runtime.clone())).unwrap();

        assert_eq!(bridge.get_version().await.unwrap().version, FAKE_VERSION);
        assert!(bridge.is_using_worker_mode());
        bridge.set_mode(false);
        assert_eq!(bridge.get_version().await.unwrap().version, FAKE_VERSION);
        assert_eq!(runtime.instantiations.load(std::sync::atomic::Ordering::SeqCst), 2);

        bridge.cleanup();
        std::fs::remove_file(&path).unwrap();
    }
}
