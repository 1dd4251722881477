//! Matchmaking Queue
//!
//! FIFO list of players waiting for a random opponent. The head of the queue
//! is paired with the next distinct player to join; the head gets white.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::game::state::PlayerId;
use crate::network::connection::{ConnectionId, PlayerConnection};

/// A player waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    /// Waiting player.
    pub player_id: PlayerId,
    /// Connection that asked to be queued.
    pub connection: PlayerConnection,
    /// When the player was queued.
    pub queued_at: Instant,
}

impl QueuedPlayer {
    /// Entry for `player_id` on `connection`, queued now.
    pub fn new(player_id: PlayerId, connection: PlayerConnection) -> Self {
        Self {
            player_id,
            connection,
            queued_at: Instant::now(),
        }
    }

    /// Time spent in the queue so far.
    pub fn waited(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// Two players taken off the queue together.
#[derive(Debug, Clone)]
pub struct Pairing {
    /// Former head of the queue.
    pub white: QueuedPlayer,
    /// The player whose request completed the pair.
    pub black: QueuedPlayer,
}

/// FIFO matchmaking queue. One lock guards the whole list.
#[derive(Debug, Default)]
pub struct MatchmakingQueue {
    waiting: Mutex<VecDeque<QueuedPlayer>>,
}

impl MatchmakingQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry` unless the player is already queued.
    ///
    /// Returns whether the entry was added.
    pub async fn enqueue(&self, entry: QueuedPlayer) -> bool {
        let mut waiting = self.waiting.lock().await;
        if waiting.iter().any(|e| e.player_id == entry.player_id) {
            return false;
        }
        waiting.push_back(entry);
        true
    }

    /// Pair `entry` with the head of the queue, or queue it if nobody is waiting.
    ///
    /// Heads whose connection has already closed are discarded. A player who
    /// is already queued stays where they are (their connection handle is
    /// refreshed) and is never paired with themselves.
    pub async fn dequeue_opponent_or_enqueue(&self, entry: QueuedPlayer) -> Option<Pairing> {
        let mut waiting = self.waiting.lock().await;

        if let Some(existing) = waiting.iter_mut().find(|e| e.player_id == entry.player_id) {
            existing.connection = entry.connection;
            return None;
        }

        while let Some(head) = waiting.pop_front() {
            if head.connection.is_closed() {
                debug!("Dropping stale queue entry for {}", head.player_id);
                continue;
            }
            debug!(
                "Pairing {} with {} after {}ms in queue",
                head.player_id,
                entry.player_id,
                head.waited().as_millis()
            );
            return Some(Pairing { white: head, black: entry });
        }

        waiting.push_back(entry);
        None
    }

    /// Remove `player_id` from the queue. No-op if absent.
    pub async fn remove(&self, player_id: &PlayerId) -> bool {
        let mut waiting = self.waiting.lock().await;
        let before = waiting.len();
        waiting.retain(|e| &e.player_id != player_id);
        waiting.len() != before
    }

    /// Remove `player_id` only if it was queued from `conn_id`.
    pub async fn remove_connection(&self, player_id: &PlayerId, conn_id: ConnectionId) -> bool {
        let mut waiting = self.waiting.lock().await;
        let before = waiting.len();
        waiting.retain(|e| !(&e.player_id == player_id && e.connection.id() == conn_id));
        waiting.len() != before
    }

    /// Whether `player_id` is waiting.
    pub async fn contains(&self, player_id: &PlayerId) -> bool {
        self.waiting.lock().await.iter().any(|e| &e.player_id == player_id)
    }

    /// Number of waiting players.
    pub async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }

    /// Whether nobody is waiting.
    pub async fn is_empty(&self) -> bool {
        self.waiting.lock().await.is_empty()
    }
}
