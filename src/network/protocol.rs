//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text envelope `{ "type": ..., "data": ... }`.

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::game::state::{Color, PlayerId, SessionId};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Enter the matchmaking queue.
    Join,
    /// Leave the matchmaking queue.
    Leave,
    /// Create a fresh session; the caller takes the first color.
    CreateGame,
    /// Join a waiting session as the second color.
    JoinInvite {
        /// Session to join.
        game_id: SessionId,
    },
    /// Play a move.
    Move {
        /// Target session.
        game_id: SessionId,
        /// Move text, standard algebraic notation.
        mv: String,
    },
    /// Resign the game.
    Resign {
        /// Target session.
        game_id: SessionId,
    },
}

/// Raw inbound envelope; `data` is decoded once the type is known.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameRef {
    game_id: SessionId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovePayload {
    game_id: SessionId,
    #[serde(rename = "move")]
    mv: String,
}

/// Inbound decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    /// Envelope type is not recognised.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// Payload does not match the message type.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Message type.
        kind: String,
        /// Decoding error.
        #[source]
        source: serde_json::Error,
    },
}

fn decode_payload<T: DeserializeOwned>(kind: &str, data: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

impl ClientMessage {
    /// Deserialize from a JSON text frame.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let Envelope { kind, data } = serde_json::from_str(s).map_err(ProtocolError::Malformed)?;

        match kind.as_str() {
            "join" => Ok(ClientMessage::Join),
            "leave" => Ok(ClientMessage::Leave),
            "createGame" => Ok(ClientMessage::CreateGame),
            "joinInvite" => {
                let GameRef { game_id } = decode_payload(&kind, data)?;
                Ok(ClientMessage::JoinInvite { game_id })
            }
            "move" => {
                let MovePayload { game_id, mv } = decode_payload(&kind, data)?;
                Ok(ClientMessage::Move { game_id, mv })
            }
            "resign" => {
                let GameRef { game_id } = decode_payload(&kind, data)?;
                Ok(ClientMessage::Resign { game_id })
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// Envelope type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::CreateGame => "createGame",
            ClientMessage::JoinInvite { .. } => "joinInvite",
            ClientMessage::Move { .. } => "move",
            ClientMessage::Resign { .. } => "resign",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full session snapshot.
    State(GameStateData),
    /// Rejected action.
    Error(ErrorData),
    /// Seat assignment.
    PlayerInfo(PlayerInfoData),
    /// A new session was created for the caller.
    GameCreated(GameCreatedData),
    /// Periodic clock reading.
    TimerUpdate(TimerData),
    /// A clock expired; terminal.
    TimeUp(TimeUpData),
}

/// Session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateData {
    /// Session identifier.
    pub game_id: SessionId,
    /// Position as FEN.
    pub fen: String,
    /// 8x8 grid, rank 8 first.
    pub board: Vec<Vec<String>>,
    /// Side to move.
    pub turn: Color,
    /// Accepted moves so far.
    pub moves: Vec<String>,
    /// Side to move is in check.
    pub in_check: bool,
    /// Session is completed.
    pub game_over: bool,
    /// Winning side, if decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Color>,
    /// End reason, if completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// White's remaining time (ms), if clocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub white_time: Option<i64>,
    /// Black's remaining time (ms), if clocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub black_time: Option<i64>,
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Human-readable reason.
    pub message: String,
}

/// Seat assignment payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfoData {
    /// The recipient's identity.
    pub player_id: PlayerId,
    /// The recipient's side.
    pub color: Color,
    /// Session identifier.
    pub game_id: SessionId,
}

/// Session created payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCreatedData {
    /// New session identifier.
    pub game_id: SessionId,
}

/// Clock reading payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerData {
    /// Session identifier.
    pub game_id: SessionId,
    /// White's remaining time (ms).
    pub white_time: i64,
    /// Black's remaining time (ms).
    pub black_time: i64,
    /// Side whose clock is running.
    pub current_turn: Color,
}

/// Clock expiry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeUpData {
    /// Session identifier.
    pub game_id: SessionId,
    /// Side that ran out of time.
    pub loser: Color,
    /// The other side.
    pub winner: Color,
    /// Always "Time up".
    pub reason: String,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ServerMessage {
    /// Build an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorData { message: message.into() })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
