//! `wasmtime`-backed runtime for core WebAssembly solver modules.
//!
//! Modules exchange JSON through their linear memory. Required exports:
//! `memory`, `solver_alloc(len) -> ptr` and `solver_call(op, ptr, len) -> i64`,
//! where the result packs `ptr << 32 | len` of a reply shaped
//! `{"ok": bool, "data": ..., "error": "..."}`. Optional exports:
//! `solver_start()`, `solver_ready() -> i32` and `solver_shutdown()`.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use wasmtime::{Instance, Linker, Memory, Module, Store, TypedFunc};

use solver_bridge_core::{BoardState, MoveResult, SolveResult, ValidationResult};

use crate::error::{LoadError, OperationError};
use crate::runtime::{Engine, EngineInstance, EngineRuntime};

const OP_VERSION: i32 = 0;
const OP_FIND_NEXT_MOVE: i32 = 1;
const OP_SOLVE_ALL: i32 = 2;
const OP_VALIDATE_BOARD: i32 = 3;

/// Runtime name in the registry.
pub const WASMTIME_RUNTIME: &str = "wasmtime";

/// Compiles and instantiates solver modules with `wasmtime`.
pub struct WasmtimeRuntime {
    engine: wasmtime::Engine,
}

impl WasmtimeRuntime {
    /// Runtime with a default `wasmtime` configuration.
    pub fn new() -> Result<Self, LoadError> {
        let engine = wasmtime::Engine::new(&wasmtime::Config::new())
            .map_err(|err| LoadError::RuntimeUnavailable(format!("{WASMTIME_RUNTIME} ({err:#})")))?;
        Ok(Self { engine })
    }
}

impl EngineRuntime for WasmtimeRuntime {
    fn name(&self) -> &str {
        WASMTIME_RUNTIME
    }

    fn instantiate(&self, module: Bytes) -> Result<Box<dyn EngineInstance>, LoadError> {
        let module = Module::new(&self.engine, &module)
            .map_err(|err| LoadError::Instantiate(format!("{err:#}")))?;
        let mut store = Store::new(&self.engine, ());
        let instance = Linker::new(&self.engine)
            .instantiate(&mut store, &module)
            .map_err(|err| LoadError::Instantiate(format!("{err:#}")))?;
        let exports = Exports::resolve(&instance, &mut store)?;
        debug!(runtime = WASMTIME_RUNTIME, "module instantiated");
        Ok(Box::new(WasmInstance {
            engine: Arc::new(WasmEngine {
                state: Mutex::new(WasmState { store, exports }),
            }),
        }))
    }
}

struct Exports {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    call: TypedFunc<(i32, i32, i32), i64>,
    start: Option<TypedFunc<(), ()>>,
    ready: Option<TypedFunc<(), i32>>,
    shutdown: Option<TypedFunc<(), ()>>,
}

impl Exports {
    fn resolve(instance: &Instance, store: &mut Store<()>) -> Result<Self, LoadError> {
        let missing = |name: &str| LoadError::Instantiate(format!("module does not export `{name}`"));
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| missing("memory"))?;
        let alloc = instance
            .get_typed_func(&mut *store, "solver_alloc")
            .map_err(|_| missing("solver_alloc"))?;
        let call = instance
            .get_typed_func(&mut *store, "solver_call")
            .map_err(|_| missing("solver_call"))?;
        Ok(Self {
            memory,
            alloc,
            call,
            start: instance.get_typed_func(&mut *store, "solver_start").ok(),
            ready: instance.get_typed_func(&mut *store, "solver_ready").ok(),
            shutdown: instance.get_typed_func(&mut *store, "solver_shutdown").ok(),
        })
    }
}

struct WasmState {
    store: Store<()>,
    exports: Exports,
}

#[derive(Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

struct WasmEngine {
    state: Mutex<WasmState>,
}

fn trap(err: wasmtime::Error) -> OperationError {
    OperationError::new(format!("engine trapped: {err:#}"))
}

impl WasmEngine {
    fn call_raw(&self, op: i32, input: &Value) -> Result<Value, OperationError> {
        let input = serde_json::to_vec(input)
            .map_err(|err| OperationError::new(format!("encode engine input: {err}")))?;
        let len = i32::try_from(input.len())
            .map_err(|_| OperationError::new("engine input too large"))?;

        let mut guard = self.state.lock();
        let WasmState { store, exports } = &mut *guard;

        let ptr = exports.alloc.call(&mut *store, len).map_err(trap)?;
        let offset = usize::try_from(ptr)
            .map_err(|_| OperationError::new(format!("engine allocated invalid pointer {ptr}")))?;
        exports
            .memory
            .write(&mut *store, offset, &input)
            .map_err(|err| OperationError::new(format!("write engine input: {err}")))?;

        let packed = exports.call.call(&mut *store, (op, ptr, len)).map_err(trap)? as u64;
        let out_ptr = (packed >> 32) as usize;
        let out_len = (packed & 0xffff_ffff) as usize;
        // Bounds come from the module; check them against memory before reading.
        let out = out_ptr
            .checked_add(out_len)
            .and_then(|end| exports.memory.data(&*store).get(out_ptr..end))
            .ok_or_else(|| {
                OperationError::new(format!(
                    "engine reply {out_ptr}+{out_len} is out of bounds"
                ))
            })?;

        let reply: Reply = serde_json::from_slice(out)
            .map_err(|err| OperationError::new(format!("malformed engine reply: {err}")))?;
        if reply.ok {
            Ok(reply.data)
        } else {
            Err(OperationError::new(
                reply.error.unwrap_or_else(|| "engine reported failure".to_string()),
            ))
        }
    }

    fn call<T: DeserializeOwned>(&self, op: i32, input: &Value) -> Result<T, OperationError> {
        let data = self.call_raw(op, input)?;
        serde_json::from_value(data)
            .map_err(|err| OperationError::new(format!("unexpected engine output: {err}")))
    }

    fn call_board<T: DeserializeOwned>(&self, op: i32, board: &BoardState) -> Result<T, OperationError> {
        let input = serde_json::to_value(board)
            .map_err(|err| OperationError::new(format!("encode board: {err}")))?;
        self.call(op, &input)
    }

    fn is_ready(&self) -> bool {
        let mut guard = self.state.lock();
        let WasmState { store, exports } = &mut *guard;
        match &exports.ready {
            Some(ready) => ready.call(&mut *store, ()).map(|v| v != 0).unwrap_or(false),
            None => true,
        }
    }
}

impl Engine for WasmEngine {
    fn version(&self) -> Result<String, OperationError> {
        self.call(OP_VERSION, &Value::Null)
    }

    fn find_next_move(&self, board: &BoardState) -> Result<MoveResult, OperationError> {
        self.call_board(OP_FIND_NEXT_MOVE, board)
    }

    fn solve_all(&self, board: &BoardState) -> Result<SolveResult, OperationError> {
        self.call_board(OP_SOLVE_ALL, board)
    }

    fn validate_board(&self, board: &BoardState) -> Result<ValidationResult, OperationError> {
        self.call_board(OP_VALIDATE_BOARD, board)
    }

    fn shutdown(&self) -> Result<(), OperationError> {
        let mut guard = self.state.lock();
        let WasmState { store, exports } = &mut *guard;
        if let Some(shutdown) = &exports.shutdown {
            shutdown.call(&mut *store, ()).map_err(trap)?;
        }
        Ok(())
    }
}

struct WasmInstance {
    engine: Arc<WasmEngine>,
}

impl EngineInstance for WasmInstance {
    fn start(&self) -> Result<(), LoadError> {
        let mut guard = self.engine.state.lock();
        let WasmState { store, exports } = &mut *guard;
        if let Some(start) = &exports.start {
            start
                .call(&mut *store, ())
                .map_err(|err| LoadError::Instantiate(format!("solver_start trapped: {err:#}")))?;
        }
        Ok(())
    }

    fn surface(&self) -> Option<Arc<dyn Engine>> {
        if self.engine.is_ready() {
            Some(self.engine.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fetch::FileModuleFetcher;
    use crate::loader::EngineLoader;
    use crate::readiness::ReadinessPolicy;
    use crate::runtime::RuntimeRegistry;
    use crate::testing::empty_board;

    // Version reply at 1024 (29 bytes), failure reply at 1100 (32 bytes).
    const SOLVER_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (data (i32.const 1024) "{\"ok\":true,\"data\":\"wasm-1.0\"}")
          (data (i32.const 1100) "{\"ok\":false,\"error\":\"bad board\"}")
          (global $started (mut i32) (i32.const 0))
          (func (export "solver_alloc") (param i32) (result i32) (i32.const 2048))
          (func (export "solver_start") (global.set $started (i32.const 1)))
          (func (export "solver_ready") (result i32) (global.get $started))
          (func (export "solver_call") (param $op i32) (param $ptr i32) (param $len i32) (result i64)
            (if (result i64) (i32.eq (local.get $op) (i32.const 3))
              (then (i64.const 4724464025632))
              (else (i64.const 4398046511133)))))
    "#;

    const NO_CALL_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "solver_alloc") (param i32) (result i32) (i32.const 0)))
    "#;

    const BAD_REPLY_WAT: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "solver_alloc") (param i32) (result i32) (i32.const 0))
          (func (export "solver_call") (param i32 i32 i32) (result i64) (i64.const -1)))
    "#;

    fn instantiate(wat: &str) -> Result<Box<dyn EngineInstance>, LoadError> {
        WasmtimeRuntime::new()
            .unwrap()
            .instantiate(Bytes::copy_from_slice(wat.as_bytes()))
    }

    #[test]
    fn surface_appears_after_start() {
        let instance = instantiate(SOLVER_WAT).unwrap();
        assert!(instance.surface().is_none());
        instance.start().unwrap();
        let engine = instance.surface().unwrap();
        assert_eq!(engine.version().unwrap(), "wasm-1.0");
    }

    #[test]
    fn engine_failure_reply_becomes_operation_error() {
        let instance = instantiate(SOLVER_WAT).unwrap();
        instance.start().unwrap();
        let engine = instance.surface().unwrap();
        let err = engine.validate_board(&empty_board()).unwrap_err();
        assert_eq!(err.message, "bad board");
    }

    #[test]
    fn reply_outside_memory_is_rejected() {
        let instance = instantiate(BAD_REPLY_WAT).unwrap();
        let engine = instance.surface().unwrap();
        let err = engine.version().unwrap_err();
        assert!(err.message.contains("out of bounds"), "{}", err.message);
    }

    #[test]
    fn missing_required_export_is_rejected() {
        let err = instantiate(NO_CALL_WAT).err().unwrap();
        assert!(matches!(&err, LoadError::Instantiate(msg) if msg.contains("solver_call")));
        assert!(matches!(instantiate("not wasm"), Err(LoadError::Instantiate(_))));
    }

    #[tokio::test]
    async fn loads_from_disk_through_loader() {
        let path = std::env::temp_dir().join(format!("solver-bridge-wasm-{}.wat", std::process::id()));
        std::fs::write(&path, SOLVER_WAT).unwrap();

        let loader = EngineLoader::new(
            "main",
            Arc::new(FileModuleFetcher::new(path.clone())),
            Arc::new(RuntimeRegistry::with_builtin().unwrap()),
            WASMTIME_RUNTIME,
            ReadinessPolicy {
                timeout: Duration::from_secs(2),
                ..ReadinessPolicy::default()
            },
        );
        let handle = loader.load().await.unwrap();
        assert_eq!(handle.engine().version().unwrap(), "wasm-1.0");
        loader.unload();
        assert!(!loader.is_ready());

        std::fs::remove_file(&path).unwrap();
    }
}
