//! Game Module
//!
//! Everything a session needs that is not networking.
//!
//! ## Module Structure
//!
//! - `state`: identifiers, sides, status and results
//! - `rules`: rules engine adapter (move legality, game end detection)
//! - `clock`: per-session countdown and its ticker task

pub mod state;
pub mod rules;
pub mod clock;

// Re-export key types
pub use state::{PlayerId, SessionId, Color, SessionStatus, Outcome, EndReason};
pub use rules::{RulesEngine, ChessRules, Position, AppliedMove, RulesError};
pub use clock::{Clock, ClockConfig, ClockTick};
