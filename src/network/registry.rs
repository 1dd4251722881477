//! Session Registry
//!
//! Process-wide index of live sessions and the only place sessions are created
//! or looked up. The registry locks guard the maps only and are never held
//! while a session's own lock is taken.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::game::state::{PlayerId, SessionId};
use crate::network::connection::PlayerConnection;
use crate::network::matchmaking::Pairing;
use crate::network::session::{Session, SessionContext, SessionError};
use crate::store::GameStore;

/// Registry of all sessions known to this process.
pub struct SessionRegistry {
    /// Active sessions by id.
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    /// Player to the sessions they are seated in.
    player_sessions: RwLock<BTreeMap<PlayerId, BTreeSet<SessionId>>>,
    /// Durable store, consulted when a session id is not in memory.
    store: Arc<dyn GameStore>,
    /// Collaborators handed to every session.
    ctx: SessionContext,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(store: Arc<dyn GameStore>, ctx: SessionContext) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            player_sessions: RwLock::new(BTreeMap::new()),
            store,
            ctx,
        }
    }

    async fn insert(&self, session: Arc<Session>, players: &[&PlayerId]) -> Arc<Session> {
        let id = session.id().clone();
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.entry(id.clone()).or_insert(session).clone()
        };
        self.index_players(&id, players).await;
        session
    }

    async fn index_players(&self, id: &SessionId, players: &[&PlayerId]) {
        let mut index = self.player_sessions.write().await;
        for player in players {
            index.entry((*player).clone()).or_default().insert(id.clone());
        }
    }

    /// New Waiting session owned by `owner`. Returns its id.
    pub async fn create(&self, owner: &PlayerId, connection: PlayerConnection) -> SessionId {
        let id = SessionId::generate();
        let session = Session::create(id.clone(), owner.clone(), Some(connection), self.ctx.clone());
        self.insert(session, &[owner]).await;
        info!("Created game {} for {}", id, owner);
        id
    }

    /// Session for two players taken off the matchmaking queue.
    ///
    /// The pair's first player is seated white, the second joins as black;
    /// both receive `playerInfo` and the opening `state`.
    pub async fn create_paired(&self, pairing: Pairing) -> Result<Arc<Session>, SessionError> {
        let Pairing { white, black } = pairing;
        let id = SessionId::generate();
        let session = Session::create(
            id.clone(),
            white.player_id.clone(),
            Some(white.connection),
            self.ctx.clone(),
        );
        let session = self.insert(session, &[&white.player_id]).await;

        session.join(black.player_id.clone(), black.connection).await?;
        self.index_players(&id, &[&black.player_id]).await;

        info!("Paired {} and {} in game {}", white.player_id, black.player_id, id);
        Ok(session)
    }

    /// Look up an in-memory session.
    pub async fn get(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(SessionError::SessionNotFound)
    }

    /// Seat `player` as the second participant of `id`.
    pub async fn join_by_session_id(
        &self,
        id: &SessionId,
        player: &PlayerId,
        connection: PlayerConnection,
    ) -> Result<Arc<Session>, SessionError> {
        let session = self.get(id).await?;
        session.join(player.clone(), connection).await?;
        self.index_players(id, &[player]).await;
        Ok(session)
    }

    /// In-memory session, or one rebuilt from the store for a recorded
    /// participant.
    pub async fn get_or_restore(&self, id: &SessionId, player: &PlayerId) -> Result<Arc<Session>, SessionError> {
        if let Ok(session) = self.get(id).await {
            return Ok(session);
        }

        let record = match self.store.load(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(SessionError::SessionNotFound),
            Err(e) => {
                warn!("Failed to load game {} from store: {}", id, e);
                return Err(SessionError::SessionNotFound);
            }
        };

        if record.participant_color(player).is_none() {
            return Err(SessionError::NotParticipant);
        }

        let players: Vec<PlayerId> = [&record.white_id, &record.black_id]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        let restored = Session::from_record(&record, self.ctx.clone())?;
        let refs: Vec<&PlayerId> = players.iter().collect();

        // A concurrent restore of the same id may have won; use whichever landed.
        let session = self.insert(restored, &refs).await;
        session.resume().await;

        info!("Restored game {} from store ({} moves)", id, record.moves.len());
        Ok(session)
    }

    /// Attach `connection` for `player` to session `id`, restoring it if
    /// needed. A player who takes an empty seat is indexed like any other
    /// participant.
    pub async fn reconnect(
        &self,
        id: &SessionId,
        player: &PlayerId,
        connection: PlayerConnection,
    ) -> Result<Arc<Session>, SessionError> {
        let session = self.get_or_restore(id, player).await?;
        session.reconnect(player, connection).await?;
        self.index_players(id, &[player]).await;
        Ok(session)
    }

    /// Sessions `player` is seated in.
    pub async fn sessions_for(&self, player: &PlayerId) -> Vec<Arc<Session>> {
        let ids: Vec<SessionId> = self
            .player_sessions
            .read()
            .await
            .get(player)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let sessions = self.sessions.read().await;
        ids.iter().filter_map(|id| sessions.get(id).cloned()).collect()
    }

    /// Drop sessions that have been Completed for longer than `ttl`.
    ///
    /// Returns the number evicted.
    pub async fn evict_completed(&self, ttl: Duration) -> usize {
        let candidates: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for session in candidates {
            if session.completed_for().await.is_some_and(|age| age >= ttl) {
                expired.push((session.id().clone(), session.players().await));
            }
        }
        if expired.is_empty() {
            return 0;
        }

        {
            let mut sessions = self.sessions.write().await;
            for (id, _) in &expired {
                sessions.remove(id);
            }
        }
        {
            let mut index = self.player_sessions.write().await;
            for (id, players) in &expired {
                for player in players.iter().flatten() {
                    if let Some(ids) = index.get_mut(player) {
                        ids.remove(id);
                        if ids.is_empty() {
                            index.remove(player);
                        }
                    }
                }
            }
        }

        info!("Evicted {} completed games", expired.len());
        expired.len()
    }

    /// Number of sessions in memory.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
