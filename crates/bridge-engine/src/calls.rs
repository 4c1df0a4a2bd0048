//! Typed engine operations.
//!
//! Each operation pairs a [`Request`] variant with the shape of its output,
//! so the worker host and the channel decode the same type for the same
//! request name.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use solver_bridge_core::{
    BoardState, MoveResult, Request, SolveResult, ValidationResult, VersionInfo,
};

use crate::error::OperationError;
use crate::runtime::Engine;

/// An engine operation that can be served in either execution context.
pub trait EngineCall: Clone + Send + Sync + 'static {
    /// What the engine returns.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Wire name, as in [`Request::name`].
    const NAME: &'static str;

    /// The request sent across the worker boundary.
    fn into_request(self) -> Request;

    /// Run the operation against a local engine.
    fn invoke(&self, engine: &dyn Engine) -> Result<Self::Output, OperationError>;
}

/// `getVersion`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetVersion;

impl EngineCall for GetVersion {
    type Output = VersionInfo;
    const NAME: &'static str = "getVersion";

    fn into_request(self) -> Request {
        Request::GetVersion
    }

    fn invoke(&self, engine: &dyn Engine) -> Result<VersionInfo, OperationError> {
        Ok(VersionInfo {
            version: engine.version()?,
        })
    }
}

/// `findNextMove`.
#[derive(Debug, Clone)]
pub struct FindNextMove(pub BoardState);

impl EngineCall for FindNextMove {
    type Output = MoveResult;
    const NAME: &'static str = "findNextMove";

    fn into_request(self) -> Request {
        Request::FindNextMove { payload: self.0 }
    }

    fn invoke(&self, engine: &dyn Engine) -> Result<MoveResult, OperationError> {
        engine.find_next_move(&self.0)
    }
}

/// `solveAll`.
#[derive(Debug, Clone)]
pub struct SolveAll(pub BoardState);

impl EngineCall for SolveAll {
    type Output = SolveResult;
    const NAME: &'static str = "solveAll";

    fn into_request(self) -> Request {
        Request::SolveAll { payload: self.0 }
    }

    fn invoke(&self, engine: &dyn Engine) -> Result<SolveResult, OperationError> {
        engine.solve_all(&self.0)
    }
}

/// `validateBoard`.
#[derive(Debug, Clone)]
pub struct ValidateBoard(pub BoardState);

impl EngineCall for ValidateBoard {
    type Output = ValidationResult;
    const NAME: &'static str = "validateBoard";

    fn into_request(self) -> Request {
        Request::ValidateBoard { payload: self.0 }
    }

    fn invoke(&self, engine: &dyn Engine) -> Result<ValidationResult, OperationError> {
        engine.validate_board(&self.0)
    }
}

fn encode<C: EngineCall>(call: C, engine: &dyn Engine) -> Result<Value, OperationError> {
    let output = call.invoke(engine)?;
    serde_json::to_value(output)
        .map_err(|err| OperationError::new(format!("{} result not serializable: {err}", C::NAME)))
}

// `init` and `terminate` are handled by the host, not here.
pub(crate) fn dispatch(engine: &dyn Engine, request: Request) -> Result<Value, OperationError> {
    match request {
        Request::GetVersion => encode(GetVersion, engine),
        Request::FindNextMove { payload } => encode(FindNextMove(payload), engine),
        Request::SolveAll { payload } => encode(SolveAll(payload), engine),
        Request::ValidateBoard { payload } => encode(ValidateBoard(payload), engine),
        other => Err(OperationError::new(format!(
            "`{}` is not an engine operation",
            other.name()
        ))),
    }
}
