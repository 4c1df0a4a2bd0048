//! Per-context engine lifecycle: fetch, instantiate, start, wait for the
//! call surface, and tear down again.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::fetch::{ModuleBody, ModuleFetcher};
use crate::readiness::{ReadinessPolicy, WaitError, wait_for};
use crate::runtime::{Engine, EngineInstance, EngineRuntime, RuntimeRegistry};

/// Coarse loader state, for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// Nothing loaded.
    Unloaded,
    /// A load is in flight.
    Loading,
    /// The engine is callable.
    Ready,
    /// The last load failed; see [`EngineLoader::error`].
    Failed,
}

/// A ready engine.
///
/// Cloning shares the same instance; the instance stays alive as long as
/// any clone does.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn Engine>,
    // Keeps the module instance (and its memory) alive alongside the surface.
    _instance: Arc<dyn EngineInstance>,
    runtime: Arc<dyn EngineRuntime>,
}

impl EngineHandle {
    /// The call surface.
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Whether two handles refer to the same loaded instance.
    pub fn same_instance(&self, other: &EngineHandle) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("runtime", &self.runtime.name())
            .finish_non_exhaustive()
    }
}

type SharedLoad = Shared<BoxFuture<'static, Result<EngineHandle, LoadError>>>;

enum Phase {
    Unloaded,
    Loading {
        load: SharedLoad,
        cancel: CancellationToken,
    },
    Ready(EngineHandle),
    Failed,
}

struct LoaderState {
    phase: Phase,
    // Bumped whenever a load starts or is discarded, so a load that
    // finishes after `abort`/`unload` cannot overwrite newer state.
    generation: u64,
    error: Option<LoadError>,
}

struct LoaderInner {
    context: &'static str,
    runtime: String,
    readiness: ReadinessPolicy,
    fetcher: Arc<dyn ModuleFetcher>,
    runtimes: Arc<RuntimeRegistry>,
    state: Mutex<LoaderState>,
}

/// Owns at most one engine instance for one execution context.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EngineLoader {
    inner: Arc<LoaderInner>,
}

impl EngineLoader {
    /// Loader for `context` (used in logs) that bootstraps `runtime` from
    /// `runtimes` and fetches the module through `fetcher`.
    pub fn new(
        context: &'static str,
        fetcher: Arc<dyn ModuleFetcher>,
        runtimes: Arc<RuntimeRegistry>,
        runtime: impl Into<String>,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                context,
                runtime: runtime.into(),
                readiness,
                fetcher,
                runtimes,
                state: Mutex::new(LoaderState {
                    phase: Phase::Unloaded,
                    generation: 0,
                    error: None,
                }),
            }),
        }
    }

    /// Load the engine, or join the load already in flight.
    ///
    /// A ready loader answers from its cache. A failed loader clears its
    /// error and retries.
    pub async fn load(&self) -> Result<EngineHandle, LoadError> {
        let load = {
            let mut state = self.inner.state.lock();
            match &state.phase {
                Phase::Ready(handle) => return Ok(handle.clone()),
                Phase::Loading { load, .. } => load.clone(),
                Phase::Unloaded | Phase::Failed => {
                    state.error = None;
                    state.generation += 1;
                    let cancel = CancellationToken::new();
                    let load = self
                        .clone()
                        .run_load(state.generation, cancel.clone())
                        .boxed()
                        .shared();
                    state.phase = Phase::Loading {
                        load: load.clone(),
                        cancel,
                    };
                    load
                }
            }
        };
        load.await
    }

    /// Cancel an in-flight load. Waiters see [`LoadError::Aborted`]; no
    /// error is recorded.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock();
        if let Phase::Loading { cancel, .. } = &state.phase {
            debug!(context = self.inner.context, "aborting engine load");
            cancel.cancel();
            state.phase = Phase::Unloaded;
            state.generation += 1;
        }
    }

    /// Tear down whatever is loaded and return to `Unloaded`. Never fails.
    pub fn unload(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.error = None;
            std::mem::replace(&mut state.phase, Phase::Unloaded)
        };

        match previous {
            Phase::Loading { cancel, .. } => cancel.cancel(),
            Phase::Ready(handle) => {
                self.shutdown_engine(&handle);
                handle.runtime.release();
                handle.runtime.collect_garbage();
                info!(context = self.inner.context, "engine unloaded");
            }
            Phase::Unloaded | Phase::Failed => {}
        }
    }

    /// Whether the engine is callable.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Ready(_))
    }

    /// Whether the last load failed.
    pub fn has_error(&self) -> bool {
        self.inner.state.lock().error.is_some()
    }

    /// Error from the last failed load.
    pub fn error(&self) -> Option<LoadError> {
        self.inner.state.lock().error.clone()
    }

    /// The cached handle, if ready.
    pub fn handle(&self) -> Option<EngineHandle> {
        match &self.inner.state.lock().phase {
            Phase::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Current coarse state.
    pub fn state(&self) -> LoadState {
        match self.inner.state.lock().phase {
            Phase::Unloaded => LoadState::Unloaded,
            Phase::Loading { .. } => LoadState::Loading,
            Phase::Ready(_) => LoadState::Ready,
            Phase::Failed => LoadState::Failed,
        }
    }

    async fn run_load(
        self,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<EngineHandle, LoadError> {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(LoadError::Aborted),
            res = self.load_sequence(&cancel) => res,
        };
        self.settle(generation, &result);
        result
    }

    async fn load_sequence(&self, cancel: &CancellationToken) -> Result<EngineHandle, LoadError> {
        let context = self.inner.context;
        let body = self.inner.fetcher.fetch().await?;

        let runtime = self
            .inner
            .runtimes
            .resolve(&self.inner.runtime)
            .ok_or_else(|| LoadError::RuntimeUnavailable(self.inner.runtime.clone()))?;

        let instance: Arc<dyn EngineInstance> = match body {
            ModuleBody::Streaming(chunks) if runtime.supports_streaming() => {
                debug!(context, runtime = runtime.name(), "instantiating engine (streaming)");
                runtime.instantiate_streaming(chunks).await?.into()
            }
            body => {
                let module = body.into_bytes().await?;
                debug!(
                    context,
                    runtime = runtime.name(),
                    bytes = module.len(),
                    "instantiating engine"
                );
                runtime.instantiate(module)?.into()
            }
        };

        instance.start()?;

        let policy = self.inner.readiness;
        wait_for(
            || instance.surface().is_some(),
            instance.ready_signal(),
            &policy,
            cancel,
        )
        .await
        .map_err(|err| match err {
            WaitError::TimedOut => LoadError::Timeout(policy.timeout),
            WaitError::Cancelled => LoadError::Aborted,
        })?;

        let engine = instance.surface().ok_or(LoadError::SurfaceMissing)?;
        Ok(EngineHandle {
            engine,
            _instance: instance,
            runtime,
        })
    }

    fn settle(&self, generation: u64, result: &Result<EngineHandle, LoadError>) {
        let context = self.inner.context;
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            debug!(context, "discarding outcome of superseded engine load");
            return;
        }
        match result {
            Ok(handle) => {
                info!(context, "engine ready");
                state.phase = Phase::Ready(handle.clone());
                state.error = None;
            }
            Err(err) if err.is_abort() => {
                state.phase = Phase::Unloaded;
            }
            Err(err) => {
                warn!(context, error = %err, "engine load failed");
                state.phase = Phase::Failed;
                state.error = Some(err.clone());
            }
        }
    }

    fn shutdown_engine(&self, handle: &EngineHandle) {
        let context = self.inner.context;
        match catch_unwind(AssertUnwindSafe(|| handle.engine().shutdown())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(context, error = %err, "engine shutdown hook failed"),
            Err(_) => warn!(context, "engine shutdown hook panicked"),
        }
    }
}

impl fmt::Debug for EngineLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLoader")
            .field("context", &self.inner.context)
            .field("runtime", &self.inner.runtime)
            .field("state", &self.state())
            .finish()
    }
}
