//! Session State Definitions
//!
//! Identity, side, status and result types shared by the session engine,
//! the wire protocol and the persistence layer.

use std::fmt;
use serde::{Serialize, Deserialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Durable player identifier, as issued by the identity provider (`sub` claim).
///
/// Implements Ord for BTreeMap indexing.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create from the provider's subject string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque, globally unique session identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an identifier received from a client or the store.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// SIDES
// =============================================================================

/// Side a player is seated on. White is the first color and moves first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// First color (session owner / head of the matchmaking queue).
    White,
    /// Second color.
    Black,
}

impl Color {
    /// Both sides, in seat order.
    pub const ALL: [Color; 2] = [Color::White, Color::Black];

    /// The other side.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Seat index (0 = white, 1 = black).
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Black => "black",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// STATUS & RESULT
// =============================================================================

/// Session lifecycle. No transition leaves `Completed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// One seat filled, waiting for an opponent.
    Waiting,
    /// Both seats filled, moves accepted.
    Active,
    /// Terminal.
    Completed,
}

/// Why a game ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The side to move is mated.
    Checkmate,
    /// The side to move has no legal move and is not in check.
    Stalemate,
    /// A player resigned.
    Resignation,
    /// A player's clock ran out.
    TimeUp,
    /// Neither side can possibly mate.
    InsufficientMaterial,
    /// The same position occurred five times.
    FivefoldRepetition,
    /// 75 moves by each side without a capture or pawn move.
    SeventyFiveMoveRule,
}

impl EndReason {
    /// Human-readable reason sent to clients.
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Checkmate => "Checkmate",
            EndReason::Stalemate => "Stalemate",
            EndReason::Resignation => "Resignation",
            EndReason::TimeUp => "Time up",
            EndReason::InsufficientMaterial => "Insufficient material",
            EndReason::FivefoldRepetition => "Fivefold repetition",
            EndReason::SeventyFiveMoveRule => "75-move rule",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a game.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Winning side, `None` for a draw.
    pub winner: Option<Color>,
    /// How the game ended.
    pub reason: EndReason,
}

impl Outcome {
    /// `loser` resigned.
    pub fn resignation(loser: Color) -> Self {
        Self { winner: Some(loser.opposite()), reason: EndReason::Resignation }
    }

    /// `loser` ran out of time. Scored exactly like a resignation.
    pub fn time_up(loser: Color) -> Self {
        Self { winner: Some(loser.opposite()), reason: EndReason::TimeUp }
    }

    /// Drawn game.
    pub fn draw(reason: EndReason) -> Self {
        Self { winner: None, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_opposite_and_index() {
        assert_eq!(Color::White.opposite(), Color::Black);
        assert_eq!(Color::Black.opposite(), Color::White);
        assert_eq!(Color::White.index(), 0);
        assert_eq!(Color::Black.index(), 1);
    }

    #[test]
    fn test_color_wire_names() {
        assert_eq!(serde_json::to_string(&Color::White).unwrap(), "\"white\"");
        assert_eq!(serde_json::from_str::<Color>("\"black\"").unwrap(), Color::Black);
        assert!(serde_json::from_str::<Color>("\"red\"").is_err());
    }

    #[test]
    fn test_time_up_scored_as_resignation() {
        let timeout = Outcome::time_up(Color::White);
        let resign = Outcome::resignation(Color::White);
        assert_eq!(timeout.winner, resign.winner);
        assert_eq!(timeout.winner, Some(Color::Black));
        assert_eq!(timeout.reason.as_str(), "Time up");
    }

    #[test]
    fn test_draw_reasons_have_no_winner() {
        let draw = Outcome::draw(EndReason::InsufficientMaterial);
        assert_eq!(draw.winner, None);
        assert_eq!(draw.reason.to_string(), "Insufficient material");
        assert_eq!(EndReason::SeventyFiveMoveRule.as_str(), "75-move rule");
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
