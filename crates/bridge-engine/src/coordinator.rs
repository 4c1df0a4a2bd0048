//! The public facade: picks the execution path per call and absorbs
//! worker failures by retrying on the main thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use solver_bridge_core::{BoardState, MoveResult, SolveResult, ValidationResult, VersionInfo};

use crate::api::{BridgeStatus, ExecutionMode};
use crate::calls::{EngineCall, FindNextMove, GetVersion, SolveAll, ValidateBoard};
use crate::error::{BridgeResult, OperationError};
use crate::fallback::with_fallback;
use crate::loader::EngineLoader;
use crate::worker::WorkerChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Idle,
    Worker,
    MainThread,
}

/// Single entry point for engine calls.
///
/// Calls go through the worker when it is preferred and available; a
/// failed worker call is retried once on the main-thread engine before
/// anything is reported. Callers cannot tell which path served them.
pub struct ExecutionCoordinator {
    worker: WorkerChannel,
    main: EngineLoader,
    prefer_worker: AtomicBool,
    active: Mutex<Active>,
    init_lock: tokio::sync::Mutex<()>,
}

impl ExecutionCoordinator {
    /// Coordinator over an unstarted worker channel and a main-thread loader.
    pub fn new(worker: WorkerChannel, main: EngineLoader, prefer_worker: bool) -> Self {
        Self {
            worker,
            main,
            prefer_worker: AtomicBool::new(prefer_worker),
            active: Mutex::new(Active::Idle),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn worker_enabled(&self) -> bool {
        self.prefer_worker.load(Ordering::SeqCst) && WorkerChannel::is_supported()
    }

    fn active(&self) -> Active {
        *self.active.lock()
    }

    /// Bring up the preferred path. Memoized until [`Self::cleanup`] or a
    /// mode change.
    ///
    /// A worker that fails to start is logged and replaced by the
    /// main-thread engine; only a main-thread failure is returned.
    pub async fn initialize(&self) -> BridgeResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.active() != Active::Idle {
            return Ok(());
        }

        if self.worker_enabled() {
            match self.worker.initialize().await {
                Ok(()) => {
                    *self.active.lock() = Active::Worker;
                    info!(mode = "worker", "engine bridge initialized");
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "engine worker unavailable, using main thread");
                }
            }
        }

        *self.active.lock() = Active::MainThread;
        self.main.load().await?;
        info!(mode = "main-thread", "engine bridge initialized");
        Ok(())
    }

    /// Engine version.
    pub async fn get_version(&self) -> BridgeResult<VersionInfo> {
        self.run(GetVersion).await
    }

    /// Next logical deduction for `board`. A board with nothing left to
    /// deduce yields a result whose `deduction` is `None`.
    pub async fn find_next_move(&self, board: &BoardState) -> BridgeResult<MoveResult> {
        self.run(FindNextMove(board.clone())).await
    }

    /// Solve `board` completely.
    pub async fn solve_all(&self, board: &BoardState) -> BridgeResult<SolveResult> {
        self.run(SolveAll(board.clone())).await
    }

    /// Check `board` for rule violations.
    pub async fn validate_board(&self, board: &BoardState) -> BridgeResult<ValidationResult> {
        self.run(ValidateBoard(board.clone())).await
    }

    async fn run<C: EngineCall>(&self, call: C) -> BridgeResult<C::Output> {
        self.initialize().await?;
        match self.active() {
            Active::Worker => {
                with_fallback(C::NAME, self.worker.call(call.clone()), || self.run_on_main(call))
                    .await
            }
            Active::MainThread | Active::Idle => self.run_on_main(call).await,
        }
    }

    async fn run_on_main<C: EngineCall>(&self, call: C) -> BridgeResult<C::Output> {
        let handle = self.main.load().await?;
        match catch_unwind(AssertUnwindSafe(|| call.invoke(handle.engine()))) {
            Ok(res) => Ok(res?),
            Err(_) => Err(OperationError::new(format!("engine panicked during {}", C::NAME)).into()),
        }
    }

    /// Prefer the worker (`true`) or the main thread (`false`).
    ///
    /// Takes effect on the next call. Engines already loaded on either
    /// path stay loaded.
    pub fn set_mode(&self, worker: bool) {
        self.prefer_worker.store(worker, Ordering::SeqCst);
        let effective = self.worker_enabled();
        let mut active = self.active.lock();
        let stale = match *active {
            Active::Worker => !effective,
            Active::MainThread => effective,
            Active::Idle => false,
        };
        if stale {
            debug!(worker, "execution mode changed, re-selecting path on next call");
            *active = Active::Idle;
        }
    }

    /// Whether calls are (or, before initialization, would be) served by
    /// the worker.
    pub fn is_using_worker_mode(&self) -> bool {
        match self.active() {
            Active::Worker => true,
            Active::MainThread => false,
            Active::Idle => self.worker_enabled(),
        }
    }

    /// Stop the worker and unload the main-thread engine. Safe to repeat.
    pub fn cleanup(&self) {
        self.worker.terminate();
        self.main.unload();
        *self.active.lock() = Active::Idle;
        debug!("engine bridge cleaned up");
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            mode: if self.is_using_worker_mode() {
                ExecutionMode::Worker
            } else {
                ExecutionMode::MainThread
            },
            worker_ready: self.worker.is_ready(),
            main_load_state: self.main.state(),
        }
    }
}
