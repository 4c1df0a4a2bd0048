//! Messages exchanged across the worker boundary.
//!
//! Requests and responses are closed tagged unions. On the wire they are
//! JSON objects keyed by `type`, e.g.
//! `{"id":"7","type":"findNextMove","payload":{...}}` and
//! `{"type":"result","id":"7","success":true,"data":{"move":null}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::board::BoardState;

/// A request understood by the worker host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Load the engine inside the worker.
    Init,
    /// Report the engine version.
    GetVersion,
    /// Find the next logical deduction for a board.
    FindNextMove {
        /// Board to inspect.
        payload: BoardState,
    },
    /// Solve a board completely.
    SolveAll {
        /// Board to solve.
        payload: BoardState,
    },
    /// Check a board for rule violations.
    ValidateBoard {
        /// Board to validate.
        payload: BoardState,
    },
    /// Drop the engine and end the worker.
    Terminate,
}

impl Request {
    /// Every wire name the worker host understands, in variant order.
    pub const NAMES: [&'static str; 6] = [
        "init",
        "getVersion",
        "findNextMove",
        "solveAll",
        "validateBoard",
        "terminate",
    ];

    /// Wire name of the request type.
    pub fn name(&self) -> &'static str {
        let index = match self {
            Request::Init => 0,
            Request::GetVersion => 1,
            Request::FindNextMove { .. } => 2,
            Request::SolveAll { .. } => 3,
            Request::ValidateBoard { .. } => 4,
            Request::Terminate => 5,
        };
        Self::NAMES[index]
    }
}

/// A request plus its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Sender-generated id, unique for the lifetime of the channel.
    pub id: String,
    /// The request itself.
    #[serde(flatten)]
    pub request: Request,
}

/// Lenient view of an incoming frame, used to recover the id of a request
/// that failed to decode.
#[derive(Debug, Deserialize)]
pub struct EnvelopeProbe {
    /// Correlation id, when present.
    #[serde(default)]
    pub id: Option<String>,
    /// Raw `type` tag, when present.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// A message from the worker host back to the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponseEnvelope {
    /// The worker finished loading its own engine. Not tied to a request.
    Ready,
    /// A request completed.
    Result {
        /// Id of the request being answered.
        id: String,
        /// Whether the request succeeded.
        success: bool,
        /// Operation output, `null` for control requests.
        #[serde(default)]
        data: Value,
    },
    /// A request (or an undecodable frame) failed.
    Error {
        /// Id of the failed request, if it could be determined.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Human-readable message.
        error: String,
    },
}

impl ResponseEnvelope {
    /// Successful reply carrying `data`.
    pub fn result(id: impl Into<String>, data: Value) -> Self {
        ResponseEnvelope::Result {
            id: id.into(),
            success: true,
            data,
        }
    }

    /// Failed reply carrying `message`.
    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        ResponseEnvelope::Error {
            id,
            error: message.into(),
        }
    }
}

/// Output of `getVersion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Engine version string.
    pub version: String,
}

/// Output of `findNextMove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveResult {
    /// The engine's deduction, or `None` when nothing can be deduced.
    #[serde(rename = "move")]
    pub deduction: Option<Value>,
}

/// Output of `solveAll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    /// Whether the engine reached a complete solution.
    pub solved: bool,
    /// Final cell values.
    pub cells: Vec<u8>,
    /// Engine-defined step records, in application order.
    #[serde(default)]
    pub steps: Vec<Value>,
}

/// Output of `validateBoard`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the board is free of conflicts.
    pub valid: bool,
    /// Indices of conflicting cells.
    #[serde(default)]
    pub conflicts: Vec<usize>,
}
