//! Rules Engine Adapter
//!
//! The session engine never decides move legality itself. It hands
//! `(position, move text)` to a [`RulesEngine`] and reacts to the result.
//! [`ChessRules`] is the production adapter, backed by the `chess` crate.

use std::fmt;
use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, File, Piece, Rank, Square};
use thiserror::Error;

use crate::game::state::{Color, EndReason, Outcome};

/// FEN of the standard starting position.
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Rules engine rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    /// Move text could not be matched to a legal move.
    #[error("{0}")]
    IllegalMove(String),
    /// Stored position could not be parsed.
    #[error("invalid FEN: {0}")]
    InvalidPosition(String),
}

// =============================================================================
// POSITION
// =============================================================================

/// Halfmove clock value at which the 75-move rule ends the game.
const SEVENTY_FIVE_MOVE_PLIES: u32 = 150;

/// Authoritative board position, in the adapter's representation.
///
/// `chess::Board` keeps neither move counters nor history, so both are
/// carried here. Repetition history only spans plies since the last capture
/// or pawn move; a position loaded from FEN starts a fresh history.
#[derive(Clone, PartialEq, Eq)]
pub struct Position {
    board: Board,
    halfmove: u32,
    fullmove: u32,
    history: Vec<u64>,
}

impl Position {
    fn new(board: Board, halfmove: u32, fullmove: u32) -> Self {
        Self {
            history: vec![board.get_hash()],
            board,
            halfmove,
            fullmove,
        }
    }

    /// FEN serialization (persisted and broadcast), with move counters.
    pub fn fen(&self) -> String {
        let placement = self.board.to_string();
        let fields: Vec<&str> = placement.split_whitespace().take(4).collect();
        format!("{} {} {}", fields.join(" "), self.halfmove, self.fullmove)
    }

    /// Side to move.
    pub fn turn(&self) -> Color {
        from_chess_color(self.board.side_to_move())
    }

    /// Whether the side to move is in check.
    pub fn in_check(&self) -> bool {
        self.board.checkers().popcnt() > 0
    }

    /// Terminal condition of the position itself, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.board.status() {
            BoardStatus::Checkmate => {
                return Some(Outcome {
                    winner: Some(self.turn().opposite()),
                    reason: EndReason::Checkmate,
                })
            }
            BoardStatus::Stalemate => return Some(Outcome::draw(EndReason::Stalemate)),
            BoardStatus::Ongoing => {}
        }

        if self.insufficient_material() {
            Some(Outcome::draw(EndReason::InsufficientMaterial))
        } else if self.repetitions() >= 5 {
            Some(Outcome::draw(EndReason::FivefoldRepetition))
        } else if self.halfmove >= SEVENTY_FIVE_MOVE_PLIES {
            Some(Outcome::draw(EndReason::SeventyFiveMoveRule))
        } else {
            None
        }
    }

    /// Bare kings, a single minor piece, or bishops all on one square color.
    fn insufficient_material(&self) -> bool {
        let board = &self.board;
        let heavy = *board.pieces(Piece::Pawn) | *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);
        if heavy.popcnt() > 0 {
            return false;
        }

        let knights = *board.pieces(Piece::Knight);
        let bishops = *board.pieces(Piece::Bishop);
        if knights.popcnt() + bishops.popcnt() <= 1 {
            return true;
        }
        if knights.popcnt() > 0 {
            return false;
        }

        let mut shades = bishops.map(|sq| (sq.get_rank().to_index() + sq.get_file().to_index()) % 2);
        let first = shades.next();
        shades.all(|shade| Some(shade) == first)
    }

    /// Times the current position has occurred since the last irreversible move.
    fn repetitions(&self) -> usize {
        let current = self.board.get_hash();
        self.history.iter().filter(|&&hash| hash == current).count()
    }

    /// Position after `mv`, which must be legal here.
    fn after(&self, mv: ChessMove) -> Self {
        let irreversible = self.board.piece_on(mv.get_source()) == Some(Piece::Pawn)
            || self.board.piece_on(mv.get_dest()).is_some();
        let board = self.board.make_move_new(mv);
        let fullmove = match self.board.side_to_move() {
            chess::Color::Black => self.fullmove + 1,
            chess::Color::White => self.fullmove,
        };

        if irreversible {
            return Self::new(board, 0, fullmove);
        }
        let mut history = self.history.clone();
        history.push(board.get_hash());
        Self {
            board,
            halfmove: self.halfmove + 1,
            fullmove,
            history,
        }
    }

    /// 8x8 grid, rank 8 first, FEN piece letters, `""` for empty squares.
    pub fn board(&self) -> Vec<Vec<String>> {
        (0..8)
            .rev()
            .map(|rank| {
                (0..8)
                    .map(|file| {
                        let square = Square::make_square(Rank::from_index(rank), File::from_index(file));
                        match (self.board.piece_on(square), self.board.color_on(square)) {
                            (Some(piece), Some(color)) => piece.to_string(color),
                            _ => String::new(),
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(Board::default(), 0, 1)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Position").field(&self.fen()).finish()
    }
}

fn from_chess_color(color: chess::Color) -> Color {
    match color {
        chess::Color::White => Color::White,
        chess::Color::Black => Color::Black,
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Result of an accepted move.
#[derive(Debug, Clone)]
pub struct AppliedMove {
    /// Position after the move.
    pub position: Position,
    /// Move in coordinate form (`e2e4`, `e7e8q`), as recorded in the move log.
    pub notation: String,
    /// Set when the move ended the game.
    pub outcome: Option<Outcome>,
}

/// External rules collaborator: a pure function of (position, move).
pub trait RulesEngine: Send + Sync {
    /// Initial position of a new session.
    fn start_position(&self) -> Position;

    /// Rebuild a position from its persisted FEN.
    fn load_position(&self, fen: &str) -> Result<Position, RulesError>;

    /// Validate and apply `move_text` to `position`.
    fn apply_move(&self, position: &Position, move_text: &str) -> Result<AppliedMove, RulesError>;
}

/// Standard chess rules via the `chess` crate.
///
/// Accepts standard algebraic notation (`e4`, `Nf3`, `exd5`, `O-O`, `e8=Q`,
/// optionally suffixed with `+`/`#`) and coordinate notation (`e2e4`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChessRules;

impl ChessRules {
    /// Create the adapter.
    pub fn new() -> Self {
        ChessRules
    }

    fn parse_move(board: &Board, move_text: &str) -> Option<ChessMove> {
        let text = move_text.trim().trim_end_matches(['+', '#', '!', '?']);
        if text.is_empty() {
            return None;
        }

        if let Ok(mv) = ChessMove::from_san(board, text) {
            return Some(mv);
        }

        Self::parse_coordinate(text)
    }

    fn parse_coordinate(text: &str) -> Option<ChessMove> {
        if !text.is_ascii() || !(text.len() == 4 || text.len() == 5) {
            return None;
        }
        let from = Square::from_str(&text[0..2]).ok()?;
        let to = Square::from_str(&text[2..4]).ok()?;
        let promotion = match text.get(4..5) {
            None => None,
            Some("q") => Some(Piece::Queen),
            Some("r") => Some(Piece::Rook),
            Some("b") => Some(Piece::Bishop),
            Some("n") => Some(Piece::Knight),
            Some(_) => return None,
        };
        Some(ChessMove::new(from, to, promotion))
    }
}

impl RulesEngine for ChessRules {
    fn start_position(&self) -> Position {
        Position::default()
    }

    fn load_position(&self, fen: &str) -> Result<Position, RulesError> {
        let board = Board::from_str(fen).map_err(|_| RulesError::InvalidPosition(fen.to_string()))?;
        let mut counters = fen.split_whitespace().skip(4).map(str::parse::<u32>);
        let halfmove = counters.next().and_then(Result::ok).unwrap_or(0);
        let fullmove = counters.next().and_then(Result::ok).unwrap_or(1).max(1);
        Ok(Position::new(board, halfmove, fullmove))
    }

    fn apply_move(&self, position: &Position, move_text: &str) -> Result<AppliedMove, RulesError> {
        if position.outcome().is_some() {
            return Err(RulesError::IllegalMove("game is already decided".to_string()));
        }

        let mv = Self::parse_move(&position.board, move_text)
            .filter(|mv| position.board.legal(*mv))
            .ok_or_else(|| RulesError::IllegalMove(format!("{} is not legal in this position", move_text.trim())))?;

        let next = position.after(mv);
        let outcome = next.outcome();

        Ok(AppliedMove {
            position: next,
            notation: mv.to_string(),
            outcome,
        })
    }
}
