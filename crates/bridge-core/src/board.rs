use serde::{Deserialize, Serialize};

/// Number of cells on a board.
pub const BOARD_CELLS: usize = 81;

/// A board array had the wrong length.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} must have {expected} entries (got {actual})")]
pub struct ShapeError {
    /// Name of the offending array.
    pub field: &'static str,
    /// Required length.
    pub expected: usize,
    /// Observed length.
    pub actual: usize,
}

#[derive(Deserialize)]
struct RawBoard {
    cells: Vec<u8>,
    candidates: Vec<u16>,
    givens: Vec<u8>,
}

/// Opaque puzzle state handed to the engine.
///
/// Only the shape is checked here. What a cell value, candidate mask or
/// given marker means is up to the engine, and every array is passed
/// through unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBoard")]
pub struct BoardState {
    cells: Vec<u8>,
    candidates: Vec<u16>,
    givens: Vec<u8>,
}

impl BoardState {
    /// Build a board from its three arrays, rejecting any that are not
    /// [`BOARD_CELLS`] long.
    pub fn new(cells: Vec<u8>, candidates: Vec<u16>, givens: Vec<u8>) -> Result<Self, ShapeError> {
        check_len("cells", cells.len())?;
        check_len("candidates", candidates.len())?;
        check_len("givens", givens.len())?;
        Ok(Self {
            cells,
            candidates,
            givens,
        })
    }

    /// Parse an 81-character puzzle line (`1`-`9`, `0` or `.` for empty).
    ///
    /// Non-empty cells are marked as givens; candidate masks start at zero.
    pub fn parse(line: &str) -> Result<Self, ParseBoardError> {
        let line = line.trim();
        let mut cells = Vec::with_capacity(BOARD_CELLS);
        for (idx, ch) in line.chars().enumerate() {
            let value = match ch {
                '.' | '0' => 0,
                '1'..='9' => ch as u8 - b'0',
                other => return Err(ParseBoardError::InvalidChar { idx, ch: other }),
            };
            cells.push(value);
        }
        let givens = cells.iter().map(|v| u8::from(*v != 0)).collect();
        Ok(Self::new(cells, vec![0; BOARD_CELLS], givens)?)
    }

    /// Cell values.
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    /// Per-cell candidate bitmasks.
    pub fn candidates(&self) -> &[u16] {
        &self.candidates
    }

    /// Given-cell markers.
    pub fn givens(&self) -> &[u8] {
        &self.givens
    }
}

impl TryFrom<RawBoard> for BoardState {
    type Error = ShapeError;

    fn try_from(raw: RawBoard) -> Result<Self, Self::Error> {
        Self::new(raw.cells, raw.candidates, raw.givens)
    }
}

/// Error parsing a textual puzzle line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseBoardError {
    /// A character outside `0-9` and `.`.
    #[error("invalid character {ch:?} at position {idx}")]
    InvalidChar {
        /// Zero-based position in the line.
        idx: usize,
        /// Offending character.
        ch: char,
    },
    /// The line did not contain exactly 81 cells.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

fn check_len(field: &'static str, actual: usize) -> Result<(), ShapeError> {
    if actual != BOARD_CELLS {
        return Err(ShapeError {
            field,
            expected: BOARD_CELLS,
            actual,
        });
    }
    Ok(())
}
