#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Types shared by both sides of the solver bridge: opaque board state,
//! the worker wire protocol, and persisted settings.

/// Shape-checked puzzle state.
pub mod board;
/// Request/response unions and their envelopes.
pub mod protocol;
/// Persisted user settings.
pub mod settings;

pub use board::{BOARD_CELLS, BoardState, ParseBoardError, ShapeError};
pub use protocol::{
    EnvelopeProbe, MoveResult, Request, RequestEnvelope, ResponseEnvelope, SolveResult,
    ValidationResult, VersionInfo,
};
pub use settings::{BridgeSettings, load_settings, save_settings, settings_path};
