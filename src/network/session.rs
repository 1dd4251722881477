//! Game Session
//!
//! One game's authoritative state: the two seats, the position, the move log,
//! the lifecycle status and the optional clock. All of it sits behind a single
//! lock and is only reachable through the operations below, each of which
//! mutates, persists and broadcasts while holding that lock. Concurrent moves,
//! reconnects and clock expiry for one session are therefore fully serialized,
//! while different sessions never contend.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::game::clock::{spawn_ticker, Clock, ClockConfig, ClockTick};
use crate::game::rules::{Position, RulesEngine};
use crate::game::state::{Color, EndReason, Outcome, PlayerId, SessionId, SessionStatus};
use crate::network::connection::{ConnectionId, PlayerConnection};
use crate::network::protocol::{
    GameStateData, PlayerInfoData, ServerMessage, TimeUpData, TimerData,
};
use crate::store::{GameRecord, PersistenceSink};

// =============================================================================
// ERRORS
// =============================================================================

/// Rejections reported to the originating connection as an `error` message.
///
/// The display text is the user-visible message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Inbound payload could not be decoded.
    #[error("Invalid message format")]
    InvalidMessage,
    /// Caller is not the side to move.
    #[error("It's not your turn")]
    NotYourTurn,
    /// Rules engine rejected the move.
    #[error("Invalid move: {0}")]
    InvalidMove(String),
    /// Session is completed.
    #[error("Game is already over")]
    GameOver,
    /// No session with that id.
    #[error("Game not found")]
    SessionNotFound,
    /// Both seats are taken by other players.
    #[error("Game is full")]
    SessionFull,
    /// Owner tried to join their own session.
    #[error("Cannot join your own game")]
    SelfJoin,
    /// Second seat is still empty.
    #[error("Waiting for an opponent")]
    WaitingForOpponent,
    /// Caller never played in the persisted session.
    #[error("You are not a player in this game")]
    NotParticipant,
    /// No credential was presented.
    #[error("Missing authentication")]
    AuthRequired,
    /// Credential failed validation.
    #[error("Invalid authentication")]
    AuthInvalid,
    /// Mover's clock has run out.
    #[error("Time up")]
    TimeExpired,
    /// Persisted session could not be rebuilt.
    #[error("Could not restore game: {0}")]
    RestoreFailed(String),
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Default)]
struct Slot {
    player: Option<PlayerId>,
    connection: Option<PlayerConnection>,
}

#[derive(Debug)]
struct SessionState {
    slots: [Slot; 2],
    position: Position,
    moves: Vec<String>,
    status: SessionStatus,
    outcome: Option<Outcome>,
    clock: Option<Clock>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    completed_at: Option<Instant>,
}

impl SessionState {
    fn new(position: Position) -> Self {
        Self {
            slots: Default::default(),
            position,
            moves: Vec::new(),
            status: SessionStatus::Waiting,
            outcome: None,
            clock: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            completed_at: None,
        }
    }

    fn color_of(&self, player: &PlayerId) -> Option<Color> {
        Color::ALL
            .into_iter()
            .find(|c| self.slots[c.index()].player.as_ref() == Some(player))
    }

    fn seated(&self) -> bool {
        self.slots.iter().all(|s| s.player.is_some())
    }

    fn activate(&mut self) {
        self.status = SessionStatus::Active;
        self.started_at.get_or_insert_with(Utc::now);
    }

    fn complete(&mut self, outcome: Outcome) {
        self.status = SessionStatus::Completed;
        self.outcome = Some(outcome);
        self.ended_at = Some(Utc::now());
        self.completed_at = Some(Instant::now());
        if let Some(clock) = self.clock.as_mut() {
            clock.stop();
        }
    }

    fn clock_ms(&self, side: Color) -> Option<i64> {
        self.clock.as_ref().map(|c| c.remaining_ms(side))
    }

    fn send_to(&self, color: Color, msg: ServerMessage) {
        if let Some(conn) = &self.slots[color.index()].connection {
            conn.send(msg);
        }
    }

    fn send_all(&self, msg: &ServerMessage) {
        for slot in &self.slots {
            if let Some(conn) = &slot.connection {
                conn.send(msg.clone());
            }
        }
    }

    fn snapshot(&self, id: &SessionId) -> GameStateData {
        GameStateData {
            game_id: id.clone(),
            fen: self.position.fen(),
            board: self.position.board(),
            turn: self.position.turn(),
            moves: self.moves.clone(),
            in_check: self.position.in_check(),
            game_over: self.status == SessionStatus::Completed,
            winner: self.outcome.and_then(|o| o.winner),
            reason: self.outcome.map(|o| o.reason.as_str().to_string()),
            white_time: self.clock_ms(Color::White),
            black_time: self.clock_ms(Color::Black),
        }
    }

    fn player_info(&self, id: &SessionId, color: Color) -> Option<ServerMessage> {
        self.slots[color.index()].player.as_ref().map(|player| {
            ServerMessage::PlayerInfo(PlayerInfoData {
                player_id: player.clone(),
                color,
                game_id: id.clone(),
            })
        })
    }

    fn record(&self, id: &SessionId) -> GameRecord {
        GameRecord {
            game_id: id.clone(),
            white_id: self.slots[Color::White.index()].player.clone(),
            black_id: self.slots[Color::Black.index()].player.clone(),
            status: self.status,
            fen: self.position.fen(),
            moves: self.moves.clone(),
            current_turn: self.position.turn(),
            winner: self.outcome.and_then(|o| o.winner),
            end_reason: self.outcome.map(|o| o.reason),
            white_time_ms: self.clock_ms(Color::White),
            black_time_ms: self.clock_ms(Color::Black),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Collaborators every session is built with.
#[derive(Clone)]
pub struct SessionContext {
    /// Move legality and game-end detection.
    pub rules: Arc<dyn RulesEngine>,
    /// Best-effort persistence.
    pub sink: PersistenceSink,
    /// Clock settings; `None` disables clocks.
    pub clock: Option<ClockConfig>,
}

/// A single game.
pub struct Session {
    id: SessionId,
    ctx: SessionContext,
    state: Mutex<SessionState>,
}

impl Session {
    /// New Waiting session with `owner` seated as white.
    pub fn create(
        id: SessionId,
        owner: PlayerId,
        connection: Option<PlayerConnection>,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let mut state = SessionState::new(ctx.rules.start_position());
        state.slots[Color::White.index()] = Slot { player: Some(owner), connection };
        ctx.sink.submit(state.record(&id));

        Arc::new(Self {
            id,
            ctx,
            state: Mutex::new(state),
        })
    }

    /// Rebuild a session from its persisted record.
    ///
    /// Connections are not restored; players re-attach through
    /// [`Session::reconnect`]. Call [`Session::resume`] once the session is
    /// reachable to restart its clock.
    pub fn from_record(record: &GameRecord, ctx: SessionContext) -> Result<Arc<Self>, SessionError> {
        let position = ctx
            .rules
            .load_position(&record.fen)
            .map_err(|e| SessionError::RestoreFailed(e.to_string()))?;

        let mut state = SessionState::new(position);
        state.slots[Color::White.index()].player = record.white_id.clone();
        state.slots[Color::Black.index()].player = record.black_id.clone();
        state.moves = record.moves.clone();
        state.status = record.status;
        state.created_at = record.created_at;
        state.started_at = record.started_at;
        state.ended_at = record.ended_at;

        if record.status == SessionStatus::Completed {
            let reason = record.end_reason.unwrap_or(EndReason::Resignation);
            state.outcome = Some(Outcome { winner: record.winner, reason });
            state.completed_at = Some(Instant::now());
        }

        if let Some(config) = &ctx.clock {
            let restore = |ms: Option<i64>| {
                ms.map(|ms| Duration::from_millis(ms.max(0) as u64))
                    .unwrap_or(config.initial)
            };
            state.clock = Some(Clock::with_remaining(
                config,
                restore(record.white_time_ms),
                restore(record.black_time_ms),
            ));
        }

        Ok(Arc::new(Self {
            id: record.game_id.clone(),
            ctx,
            state: Mutex::new(state),
        }))
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Seat `player` as black and start the game.
    ///
    /// Both players receive `playerInfo`, then a `state` snapshot.
    pub async fn join(self: &Arc<Self>, player: PlayerId, connection: PlayerConnection) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        if state.seated() {
            return Err(SessionError::SessionFull);
        }
        if state.color_of(&player).is_some() {
            return Err(SessionError::SelfJoin);
        }
        if state.status == SessionStatus::Completed {
            return Err(SessionError::GameOver);
        }

        let color = if state.slots[Color::White.index()].player.is_none() {
            Color::White
        } else {
            Color::Black
        };
        state.slots[color.index()] = Slot {
            player: Some(player.clone()),
            connection: Some(connection),
        };
        state.activate();
        self.start_clock(&mut state);
        self.ctx.sink.submit(state.record(&self.id));

        info!("Game {} started: {} joined as {}", self.id, player, color);

        for side in Color::ALL {
            if let Some(info) = state.player_info(&self.id, side) {
                state.send_to(side, info);
            }
        }
        state.send_all(&ServerMessage::State(state.snapshot(&self.id)));
        Ok(())
    }

    /// Validate and apply a move by `player`.
    ///
    /// On success every connected participant receives exactly one `state`.
    /// Rejections change nothing and broadcast nothing.
    pub async fn apply_move(&self, player: &PlayerId, move_text: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        match state.status {
            SessionStatus::Completed => return Err(SessionError::GameOver),
            SessionStatus::Waiting => return Err(SessionError::WaitingForOpponent),
            SessionStatus::Active => {}
        }

        let mover = state.position.turn();
        if state.color_of(player) != Some(mover) {
            return Err(SessionError::NotYourTurn);
        }
        if let Some(clock) = &state.clock {
            if clock.remaining(mover).is_zero() {
                return Err(SessionError::TimeExpired);
            }
        }

        let applied = self
            .ctx
            .rules
            .apply_move(&state.position, move_text)
            .map_err(|e| SessionError::InvalidMove(e.to_string()))?;

        debug!("Game {}: {} played {}", self.id, mover, applied.notation);

        state.position = applied.position;
        state.moves.push(applied.notation);
        if let Some(clock) = state.clock.as_mut() {
            clock.add_increment(mover);
        }
        if let Some(outcome) = applied.outcome {
            info!("Game {} over: {}", self.id, outcome.reason);
            state.complete(outcome);
        }

        self.ctx.sink.submit(state.record(&self.id));
        state.send_all(&ServerMessage::State(state.snapshot(&self.id)));
        Ok(())
    }

    /// `player` resigns; the other side wins.
    pub async fn resign(&self, player: &PlayerId) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        if state.status == SessionStatus::Completed {
            return Err(SessionError::GameOver);
        }
        let color = state.color_of(player).ok_or(SessionError::NotParticipant)?;
        if state.status == SessionStatus::Waiting {
            return Err(SessionError::WaitingForOpponent);
        }

        info!("Game {}: {} resigned", self.id, color);
        state.complete(Outcome::resignation(color));

        self.ctx.sink.submit(state.record(&self.id));
        state.send_all(&ServerMessage::State(state.snapshot(&self.id)));
        Ok(())
    }

    /// Attach `connection` for `player`.
    ///
    /// A seated player keeps their color; any older connection in the seat is
    /// closed. A newcomer takes an empty seat if there is one, which starts a
    /// Waiting game. The caller alone receives `playerInfo` then `state`.
    pub async fn reconnect(self: &Arc<Self>, player: &PlayerId, connection: PlayerConnection) -> Result<Color, SessionError> {
        let mut state = self.state.lock().await;

        let color = match state.color_of(player) {
            Some(color) => color,
            None => {
                let empty = Color::ALL
                    .into_iter()
                    .find(|c| state.slots[c.index()].player.is_none())
                    .ok_or(SessionError::SessionFull)?;
                state.slots[empty.index()].player = Some(player.clone());
                empty
            }
        };

        let new_id = connection.id();
        if let Some(old) = state.slots[color.index()].connection.replace(connection) {
            if old.id() != new_id {
                old.close();
            }
        }

        if state.status == SessionStatus::Waiting && state.seated() {
            info!("Game {} started on reconnect of {}", self.id, player);
            state.activate();
            self.start_clock(&mut state);
            self.ctx.sink.submit(state.record(&self.id));
        }

        info!("{} reconnected to game {} as {}", player, self.id, color);

        if let Some(info) = state.player_info(&self.id, color) {
            state.send_to(color, info);
        }
        state.send_to(color, ServerMessage::State(state.snapshot(&self.id)));
        Ok(color)
    }

    /// Clear `player`'s seat connection if it is still `conn_id`.
    ///
    /// The seat stays reserved for the player. Returns whether anything was
    /// cleared, so a second call (or a call from a superseded connection) is a
    /// no-op.
    pub async fn handle_disconnect(&self, player: &PlayerId, conn_id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(color) = state.color_of(player) else {
            return false;
        };

        let slot = &mut state.slots[color.index()];
        if !slot.connection.as_ref().is_some_and(|c| c.id() == conn_id) {
            return false;
        }
        if let Some(conn) = slot.connection.take() {
            conn.close();
        }
        debug!("{} disconnected from game {}", player, self.id);
        true
    }

    /// Close every connection `player` holds in this session other than `keep`.
    pub async fn supersede(&self, player: &PlayerId, keep: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(color) = state.color_of(player) else {
            return false;
        };

        let slot = &mut state.slots[color.index()];
        if !slot.connection.as_ref().is_some_and(|c| c.id() != keep) {
            return false;
        }
        if let Some(old) = slot.connection.take() {
            debug!("Superseding {} for {} in game {}", old.id(), player, self.id);
            old.close();
        }
        true
    }

    /// Send the current snapshot to every connected participant.
    pub async fn broadcast_state(&self) {
        let state = self.state.lock().await;
        state.send_all(&ServerMessage::State(state.snapshot(&self.id)));
    }

    /// Restart the clock of a restored Active session.
    pub async fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let idle = state.clock.as_ref().is_some_and(|c| !c.is_active());
        if state.status == SessionStatus::Active && idle {
            self.start_clock(&mut state);
        }
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    fn start_clock(self: &Arc<Self>, state: &mut SessionState) {
        let Some(config) = &self.ctx.clock else {
            return;
        };
        let clock = state.clock.get_or_insert_with(|| Clock::new(config));
        let (epoch, stop_rx) = clock.arm();
        let period = clock.period();

        let weak: Weak<Session> = Arc::downgrade(self);
        spawn_ticker(period, stop_rx, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(session) => session.on_clock_tick(epoch).await,
                    None => false,
                }
            }
        });
    }

    /// Apply one tick from the ticker armed at `epoch`. Returns whether the
    /// ticker should keep running.
    async fn on_clock_tick(&self, epoch: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.status != SessionStatus::Active {
            return false;
        }

        let side = state.position.turn();
        let tick = match state.clock.as_mut() {
            Some(clock) if clock.accepts_tick(epoch) => clock.tick(side),
            _ => return false,
        };

        match tick {
            ClockTick::Running => {
                let update = ServerMessage::TimerUpdate(TimerData {
                    game_id: self.id.clone(),
                    white_time: state.clock_ms(Color::White).unwrap_or_default(),
                    black_time: state.clock_ms(Color::Black).unwrap_or_default(),
                    current_turn: side,
                });
                state.send_all(&update);
                true
            }
            ClockTick::Expired(loser) => {
                let outcome = Outcome::time_up(loser);
                info!("Game {}: {} ran out of time", self.id, loser);
                state.complete(outcome);

                state.send_all(&ServerMessage::TimeUp(TimeUpData {
                    game_id: self.id.clone(),
                    loser,
                    winner: loser.opposite(),
                    reason: outcome.reason.as_str().to_string(),
                }));
                state.send_all(&ServerMessage::State(state.snapshot(&self.id)));
                self.ctx.sink.submit(state.record(&self.id));
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current lifecycle status.
    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    /// Seated players, white first.
    pub async fn players(&self) -> [Option<PlayerId>; 2] {
        let state = self.state.lock().await;
        [
            state.slots[0].player.clone(),
            state.slots[1].player.clone(),
        ]
    }

    /// Current snapshot, as broadcast.
    pub async fn snapshot(&self) -> GameStateData {
        self.state.lock().await.snapshot(&self.id)
    }

    /// Persisted view of the current state.
    pub async fn record(&self) -> GameRecord {
        self.state.lock().await.record(&self.id)
    }

    /// How long the session has been Completed, if it is.
    pub async fn completed_for(&self) -> Option<Duration> {
        self.state.lock().await.completed_at.map(|t| t.elapsed())
    }

    /// Whether `player` currently has a live connection in a seat.
    pub async fn is_connected(&self, player: &PlayerId) -> bool {
        let state = self.state.lock().await;
        state
            .color_of(player)
            .and_then(|c| state.slots[c.index()].connection.as_ref())
            .is_some_and(|conn| !conn.is_closed())
    }
}

// =============================================================================
// TESTS
// =============================================================================
