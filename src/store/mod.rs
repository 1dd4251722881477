//! Session Persistence
//!
//! Best-effort mirror of session metadata for history and for rebuilding a
//! session after a process restart. The in-memory session is always the source
//! of truth: writes are queued on a [`PersistenceSink`] and applied in order by
//! a background task, failures are logged and dropped.

pub mod memory;
pub mod file;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::game::state::{Color, EndReason, PlayerId, SessionId, SessionStatus};

pub use file::FileGameStore;
pub use memory::MemoryGameStore;

/// Persisted view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    /// Session identifier.
    pub game_id: SessionId,
    /// First-color participant.
    pub white_id: Option<PlayerId>,
    /// Second-color participant.
    pub black_id: Option<PlayerId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Position as FEN.
    pub fen: String,
    /// Accepted moves, in order.
    pub moves: Vec<String>,
    /// Side to move.
    pub current_turn: Color,
    /// Winning side, if decided.
    pub winner: Option<Color>,
    /// Why the game ended.
    pub end_reason: Option<EndReason>,
    /// White's remaining clock time (ms), if clocked.
    pub white_time_ms: Option<i64>,
    /// Black's remaining clock time (ms), if clocked.
    pub black_time_ms: Option<i64>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When both seats were filled.
    pub started_at: Option<DateTime<Utc>>,
    /// When the session completed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Time of this write.
    pub updated_at: DateTime<Utc>,
}

impl GameRecord {
    /// Side `player` was recorded on, if any.
    pub fn participant_color(&self, player: &PlayerId) -> Option<Color> {
        if self.white_id.as_ref() == Some(player) {
            Some(Color::White)
        } else if self.black_id.as_ref() == Some(player) {
            Some(Color::Black)
        } else {
            None
        }
    }
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Identifier is not usable as a storage key.
    #[error("invalid game id: {0}")]
    InvalidId(String),
    /// Backend unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable session metadata store.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Insert or replace the record for `record.game_id`.
    async fn upsert(&self, record: &GameRecord) -> Result<(), StoreError>;

    /// Fetch a record by id.
    async fn load(&self, game_id: &SessionId) -> Result<Option<GameRecord>, StoreError>;
}

enum WriteOp {
    Upsert(GameRecord),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking, ordered write queue in front of a [`GameStore`].
#[derive(Clone)]
pub struct PersistenceSink {
    tx: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl PersistenceSink {
    /// Start the background writer for `store`. Must be called inside a runtime.
    pub fn spawn(store: Arc<dyn GameStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Upsert(record) => {
                        if let Err(e) = store.upsert(&record).await {
                            warn!("Failed to persist game {}: {}", record.game_id, e);
                        } else {
                            debug!("Persisted game {} ({} moves)", record.game_id, record.moves.len());
                        }
                    }
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx: Some(tx) }
    }

    /// Sink that discards every write.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a write. Never blocks.
    pub fn submit(&self, record: GameRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(WriteOp::Upsert(record)).is_err() {
                warn!("Persistence writer stopped; dropping write");
            }
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WriteOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }
}
