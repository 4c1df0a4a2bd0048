//! Scripted runtime, engine and fetcher shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;

use solver_bridge_core::{BoardState, MoveResult, SolveResult, ValidationResult};

use crate::error::{LoadError, OperationError};
use crate::fetch::{ModuleBody, ModuleFetcher};
use crate::runtime::{Engine, EngineInstance, EngineRuntime, RuntimeRegistry};

pub(crate) const FAKE_VERSION: &str = "fake-1.0";

#[derive(Debug, Clone, Copy)]
pub(crate) enum Readiness {
    Immediate,
    AfterEvent(Duration),
    Never,
    SignalWithoutSurface,
}

#[derive(Default)]
pub(crate) struct EngineFlags {
    pub(crate) fail_operations: AtomicBool,
    pub(crate) panic_operations: AtomicBool,
    pub(crate) panic_on_shutdown: AtomicBool,
    pub(crate) calls: AtomicUsize,
    pub(crate) shutdowns: AtomicUsize,
}

pub(crate) struct FakeRuntime {
    name: String,
    readiness: Readiness,
    streaming: bool,
    flags: Arc<EngineFlags>,
    pub(crate) instantiations: AtomicUsize,
    pub(crate) streamed: AtomicUsize,
    pub(crate) releases: AtomicUsize,
}

impl FakeRuntime {
    pub(crate) fn new(readiness: Readiness) -> Arc<Self> {
        Self::build("fake", readiness, false)
    }

    pub(crate) fn streaming(readiness: Readiness) -> Arc<Self> {
        Self::build("fake", readiness, true)
    }

    fn build(name: &str, readiness: Readiness, streaming: bool) -> Arc<Self> {
        let flags = Arc::new(EngineFlags::default());
        Arc::new(Self {
            name: name.to_string(),
            readiness,
            streaming,
            flags,
            instantiations: AtomicUsize::new(0),
            streamed: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub(crate) fn flags(&self) -> &EngineFlags {
        &self.flags
    }
}

#[async_trait]
impl EngineRuntime for FakeRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self, module: Bytes) -> Result<Box<dyn EngineInstance>, LoadError> {
        if module.is_empty() {
            return Err(LoadError::Instantiate("empty module".to_string()));
        }
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInstance::new(self.readiness, self.flags.clone())))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn instantiate_streaming(
        &self,
        chunks: BoxStream<'static, Result<Bytes, LoadError>>,
    ) -> Result<Box<dyn EngineInstance>, LoadError> {
        self.streamed.fetch_add(1, Ordering::SeqCst);
        let module = ModuleBody::Streaming(chunks).into_bytes().await?;
        self.instantiate(module)
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeInstance {
    readiness: Readiness,
    surface: Arc<Mutex<Option<Arc<dyn Engine>>>>,
    engine: Arc<dyn Engine>,
    ready_tx: Arc<watch::Sender<bool>>,
}

impl FakeInstance {
    fn new(readiness: Readiness, flags: Arc<EngineFlags>) -> Self {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine { flags });
        let surface = match readiness {
            Readiness::Immediate => Some(engine.clone()),
            _ => None,
        };
        let (ready_tx, _) = watch::channel(matches!(readiness, Readiness::SignalWithoutSurface));
        Self {
            readiness,
            surface: Arc::new(Mutex::new(surface)),
            engine,
            ready_tx: Arc::new(ready_tx),
        }
    }
}

impl EngineInstance for FakeInstance {
    fn start(&self) -> Result<(), LoadError> {
        if let Readiness::AfterEvent(delay) = self.readiness {
            let surface = self.surface.clone();
            let engine = self.engine.clone();
            let ready_tx = self.ready_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                *surface.lock() = Some(engine);
                ready_tx.send_replace(true);
            });
        }
        Ok(())
    }

    fn surface(&self) -> Option<Arc<dyn Engine>> {
        self.surface.lock().clone()
    }

    fn ready_signal(&self) -> Option<watch::Receiver<bool>> {
        match self.readiness {
            Readiness::AfterEvent(_) | Readiness::SignalWithoutSurface => {
                Some(self.ready_tx.subscribe())
            }
            Readiness::Immediate | Readiness::Never => None,
        }
    }
}

struct FakeEngine {
    flags: Arc<EngineFlags>,
}

impl FakeEngine {
    fn enter(&self) -> Result<(), OperationError> {
        self.flags.calls.fetch_add(1, Ordering::SeqCst);
        if self.flags.panic_operations.load(Ordering::SeqCst) {
            panic!("scripted engine panic");
        }
        if self.flags.fail_operations.load(Ordering::SeqCst) {
            return Err(OperationError::new("scripted engine failure"));
        }
        Ok(())
    }
}

impl Engine for FakeEngine {
    fn version(&self) -> Result<String, OperationError> {
        self.enter()?;
        Ok(FAKE_VERSION.to_string())
    }

    fn find_next_move(&self, board: &BoardState) -> Result<MoveResult, OperationError> {
        self.enter()?;
        let deduction = board
            .cells()
            .iter()
            .position(|v| *v == 0)
            .map(|cell| json!({ "cell": cell, "value": 1 }));
        Ok(MoveResult { deduction })
    }

    fn solve_all(&self, board: &BoardState) -> Result<SolveResult, OperationError> {
        self.enter()?;
        let cells = board.cells().iter().map(|v| if *v == 0 { 1 } else { *v }).collect();
        Ok(SolveResult {
            solved: true,
            cells,
            steps: Vec::new(),
        })
    }

    fn validate_board(&self, _board: &BoardState) -> Result<ValidationResult, OperationError> {
        self.enter()?;
        Ok(ValidationResult {
            valid: true,
            conflicts: Vec::new(),
        })
    }

    fn shutdown(&self) -> Result<(), OperationError> {
        self.flags.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.flags.panic_on_shutdown.load(Ordering::SeqCst) {
            panic!("scripted shutdown panic");
        }
        Ok(())
    }
}

struct FetcherState {
    fetches: AtomicUsize,
    delay: Duration,
    streaming: bool,
    fail_next: Mutex<Option<LoadError>>,
    fail_always: Mutex<Option<LoadError>>,
}

#[derive(Clone)]
pub(crate) struct CountingFetcher {
    state: Arc<FetcherState>,
}

impl CountingFetcher {
    fn build(delay: Duration, streaming: bool) -> Self {
        Self {
            state: Arc::new(FetcherState {
                fetches: AtomicUsize::new(0),
                delay,
                streaming,
                fail_next: Mutex::new(None),
                fail_always: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn new() -> Self {
        Self::build(Duration::ZERO, false)
    }

    pub(crate) fn delayed(delay: Duration) -> Self {
        Self::build(delay, false)
    }

    pub(crate) fn streaming() -> Self {
        Self::build(Duration::ZERO, true)
    }

    pub(crate) fn failing(err: LoadError) -> Self {
        let fetcher = Self::new();
        *fetcher.state.fail_always.lock() = Some(err);
        fetcher
    }

    pub(crate) fn fail_next_with(&self, err: LoadError) {
        *self.state.fail_next.lock() = Some(err);
    }

    pub(crate) fn fetches(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleFetcher for CountingFetcher {
    async fn fetch(&self) -> Result<ModuleBody, LoadError> {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }
        if let Some(err) = self.state.fail_always.lock().clone() {
            return Err(err);
        }
        if let Some(err) = self.state.fail_next.lock().take() {
            return Err(err);
        }
        if self.state.streaming {
            let chunks = vec![
                Ok(Bytes::from_static(b"fake-")),
                Ok(Bytes::from_static(b"module")),
            ];
            return Ok(ModuleBody::Streaming(stream::iter(chunks).boxed()));
        }
        Ok(ModuleBody::Buffered(Bytes::from_static(b"fake-module")))
    }
}

pub(crate) fn registry_with(runtime: Arc<FakeRuntime>) -> Arc<RuntimeRegistry> {
    let registry = RuntimeRegistry::new();
    registry.register(runtime);
    Arc::new(registry)
}

pub(crate) fn empty_board() -> BoardState {
    BoardState::new(
        vec![0; solver_bridge_core::BOARD_CELLS],
        vec![0; solver_bridge_core::BOARD_CELLS],
        vec![0; solver_bridge_core::BOARD_CELLS],
    )
    .expect("board shape")
}

pub(crate) fn full_board() -> BoardState {
    BoardState::new(
        vec![5; solver_bridge_core::BOARD_CELLS],
        vec![0; solver_bridge_core::BOARD_CELLS],
        vec![1; solver_bridge_core::BOARD_CELLS],
    )
    .expect("board shape")
}
