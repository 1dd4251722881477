//! Connection Dispatcher
//!
//! Routes each decoded inbound message to the matchmaking queue or the
//! addressed session, and runs the connect and disconnect bookkeeping for a
//! connection. Every per-message failure is reported back to the caller as an
//! `error` message; nothing here ever ends a connection because of a bad
//! request.

use std::sync::Arc;

use tracing::{debug, info};

use crate::game::state::{PlayerId, SessionId};
use crate::network::connection::PlayerConnection;
use crate::network::matchmaking::{MatchmakingQueue, QueuedPlayer};
use crate::network::protocol::{ClientMessage, GameCreatedData, ServerMessage};
use crate::network::registry::SessionRegistry;
use crate::network::session::SessionError;

/// One authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Authenticated player.
    pub player_id: PlayerId,
    /// Their live connection.
    pub connection: PlayerConnection,
}

impl ConnectionContext {
    /// Report `err` to this connection.
    pub fn reject(&self, err: &SessionError) {
        self.connection.send(ServerMessage::error(err.to_string()));
    }
}

/// Shared routing state, injected into every connection task.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    queue: Arc<MatchmakingQueue>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry` and `queue`.
    pub fn new(registry: Arc<SessionRegistry>, queue: Arc<MatchmakingQueue>) -> Self {
        Self { registry, queue }
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The matchmaking queue.
    pub fn queue(&self) -> &Arc<MatchmakingQueue> {
        &self.queue
    }

    /// Register a freshly authenticated connection.
    ///
    /// Older connections for the same player are closed and dropped from the
    /// queue. When `game_id` is given the connection is re-attached to that
    /// session (restoring it from the store if needed).
    pub async fn on_connect(&self, ctx: &ConnectionContext, game_id: Option<&SessionId>) -> Result<(), SessionError> {
        let player = &ctx.player_id;
        let conn_id = ctx.connection.id();

        for session in self.registry.sessions_for(player).await {
            session.supersede(player, conn_id).await;
        }
        if self.queue.remove(player).await {
            debug!("Dropped queued entry of superseded connection for {}", player);
        }

        if let Some(game_id) = game_id {
            self.registry.reconnect(game_id, player, ctx.connection.clone()).await?;
        }

        info!("{} connected on {}", player, conn_id);
        Ok(())
    }

    /// Handle one inbound message. Failures are sent to the caller.
    pub async fn dispatch(&self, ctx: &ConnectionContext, msg: ClientMessage) {
        let kind = msg.kind();
        if let Err(err) = self.route(ctx, msg).await {
            debug!("{} from {} rejected: {}", kind, ctx.player_id, err);
            ctx.reject(&err);
        }
    }

    async fn route(&self, ctx: &ConnectionContext, msg: ClientMessage) -> Result<(), SessionError> {
        let player = &ctx.player_id;

        match msg {
            ClientMessage::Join => {
                let entry = QueuedPlayer::new(player.clone(), ctx.connection.clone());
                match self.queue.dequeue_opponent_or_enqueue(entry).await {
                    Some(pairing) => {
                        self.registry.create_paired(pairing).await?;
                    }
                    None => debug!("{} waiting for an opponent", player),
                }
            }
            ClientMessage::Leave => {
                self.queue.remove(player).await;
            }
            ClientMessage::CreateGame => {
                let game_id = self.registry.create(player, ctx.connection.clone()).await;
                ctx.connection.send(ServerMessage::GameCreated(GameCreatedData { game_id }));
            }
            ClientMessage::JoinInvite { game_id } => {
                self.registry
                    .join_by_session_id(&game_id, player, ctx.connection.clone())
                    .await?;
            }
            ClientMessage::Move { game_id, mv } => {
                let session = self.registry.get(&game_id).await?;
                session.apply_move(player, &mv).await?;
            }
            ClientMessage::Resign { game_id } => {
                let session = self.registry.get(&game_id).await?;
                session.resign(player).await?;
            }
        }
        Ok(())
    }

    /// Clean up after a connection's read loop ends.
    ///
    /// Only state still bound to this exact connection is touched, so calling
    /// this again, or from a connection that was already superseded, is a
    /// no-op.
    pub async fn on_disconnect(&self, ctx: &ConnectionContext) {
        let player = &ctx.player_id;
        let conn_id = ctx.connection.id();

        self.queue.remove_connection(player, conn_id).await;
        for session in self.registry.sessions_for(player).await {
            session.handle_disconnect(player, conn_id).await;
        }
        ctx.connection.close();

        info!("{} disconnected ({})", player, conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::clock::ClockConfig;
    use crate::game::state::{Color, SessionStatus};
    use crate::network::connection::ConnectionReceiver;
    use crate::network::session::tests::{connection, context, drain, fast_clock};
    use crate::store::MemoryGameStore;
    use std::time::Duration;

    fn dispatcher(clock: Option<ClockConfig>) -> Dispatcher {
        let registry = SessionRegistry::new(Arc::new(MemoryGameStore::new()), context(clock));
        Dispatcher::new(Arc::new(registry), Arc::new(MatchmakingQueue::new()))
    }

    async fn connect(d: &Dispatcher, id: &str) -> (ConnectionContext, ConnectionReceiver) {
        let (conn, rx) = connection();
        let ctx = ConnectionContext { player_id: PlayerId::new(id), connection: conn };
        d.on_connect(&ctx, None).await.unwrap();
        (ctx, rx)
    }

    fn created_id(msgs: &[ServerMessage]) -> SessionId {
        msgs.iter()
            .find_map(|m| match m {
                ServerMessage::GameCreated(c) => Some(c.game_id.clone()),
                _ => None,
            })
            .expect("gameCreated")
    }

    fn assigned_color(msg: &ServerMessage) -> Option<Color> {
        match msg {
            ServerMessage::PlayerInfo(info) => Some(info.color),
            _ => None,
        }
    }

    fn errors(msgs: &[ServerMessage]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| match m {
                ServerMessage::Error(e) => Some(e.message.clone()),
                _ => None,
            })
            .collect()
    }

    /// A creates, B joins by invite. Returns the session id.
    async fn invite_game(
        d: &Dispatcher,
    ) -> (SessionId, (ConnectionContext, ConnectionReceiver), (ConnectionContext, ConnectionReceiver)) {
        let (a, mut rx_a) = connect(d, "alice").await;
        let (b, rx_b) = connect(d, "bob").await;

        d.dispatch(&a, ClientMessage::CreateGame).await;
        let game_id = created_id(&drain(&mut rx_a));
        d.dispatch(&b, ClientMessage::JoinInvite { game_id: game_id.clone() }).await;
        (game_id, (a, rx_a), (b, rx_b))
    }

    #[tokio::test]
    async fn test_create_and_join_invite() {
        let d = dispatcher(None);
        let (game_id, (_a, mut rx_a), (_b, mut rx_b)) = invite_game(&d).await;

        let to_a = drain(&mut rx_a);
        let to_b = drain(&mut rx_b);
        assert_eq!(assigned_color(&to_a[0]), Some(Color::White));
        assert_eq!(assigned_color(&to_b[0]), Some(Color::Black));

        for msgs in [&to_a, &to_b] {
            match &msgs[1] {
                ServerMessage::State(s) => {
                    assert_eq!(s.game_id, game_id);
                    assert_eq!(s.turn, Color::White);
                    assert!(s.moves.is_empty());
                    assert!(!s.game_over);
                }
                other => panic!("expected state, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_join_own_game_rejected() {
        let d = dispatcher(None);
        let (a, mut rx_a) = connect(&d, "alice").await;
        d.dispatch(&a, ClientMessage::CreateGame).await;
        let game_id = created_id(&drain(&mut rx_a));

        d.dispatch(&a, ClientMessage::JoinInvite { game_id }).await;
        assert_eq!(errors(&drain(&mut rx_a)), vec!["Cannot join your own game".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_game() {
        let d = dispatcher(None);
        let (a, mut rx_a) = connect(&d, "alice").await;
        d.dispatch(&a, ClientMessage::Move { game_id: SessionId::new("nope"), mv: "e4".into() }).await;
        assert_eq!(errors(&drain(&mut rx_a)), vec!["Game not found".to_string()]);
    }

    #[tokio::test]
    async fn test_illegal_move_only_errors_mover() {
        let d = dispatcher(None);
        let (game_id, (a, mut rx_a), (_b, mut rx_b)) = invite_game(&d).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        d.dispatch(&a, ClientMessage::Move { game_id: game_id.clone(), mv: "illegal-move".into() }).await;

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1);
        assert!(errors(&to_a)[0].starts_with("Invalid move: "));
        assert!(drain(&mut rx_b).is_empty());

        let session = d.registry().get(&game_id).await.unwrap();
        assert_eq!(session.snapshot().await.turn, Color::White);
    }

    #[tokio::test]
    async fn test_matchmaking_pairs_in_order() {
        let d = dispatcher(None);
        let mut players = Vec::new();
        for name in ["p1", "p2", "p3", "p4"] {
            players.push(connect(&d, name).await);
        }
        for (ctx, _) in &players {
            d.dispatch(ctx, ClientMessage::Join).await;
        }

        let mut seats = Vec::new();
        for (ctx, rx) in players.iter_mut() {
            let msgs = drain(rx);
            let info = msgs
                .iter()
                .find_map(|m| match m {
                    ServerMessage::PlayerInfo(i) => Some(i.clone()),
                    _ => None,
                })
                .unwrap();
            assert_eq!(info.player_id, ctx.player_id);
            seats.push((info.game_id, info.color));
        }

        assert_eq!(seats[0].0, seats[1].0);
        assert_eq!(seats[2].0, seats[3].0);
        assert_ne!(seats[0].0, seats[2].0);
        assert_eq!(seats[0].1, Color::White);
        assert_eq!(seats[1].1, Color::Black);
        assert_eq!(seats[2].1, Color::White);
        assert!(d.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_leave_queue() {
        let d = dispatcher(None);
        let (a, _rx_a) = connect(&d, "alice").await;
        d.dispatch(&a, ClientMessage::Join).await;
        assert_eq!(d.queue().len().await, 1);
        d.dispatch(&a, ClientMessage::Leave).await;
        assert!(d.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_disconnect_removes_queue_entry_once() {
        let d = dispatcher(None);
        let (a, _rx_a) = connect(&d, "alice").await;
        d.dispatch(&a, ClientMessage::Join).await;

        d.on_disconnect(&a).await;
        d.on_disconnect(&a).await;
        assert!(d.queue().is_empty().await);
        assert!(a.connection.is_closed());
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_old() {
        let d = dispatcher(None);
        let (game_id, (a, _rx_a), (_b, _rx_b)) = invite_game(&d).await;

        let (fresh, mut rx_fresh) = connection();
        let a2 = ConnectionContext { player_id: a.player_id.clone(), connection: fresh };
        d.on_connect(&a2, Some(&game_id)).await.unwrap();
        assert!(a.connection.is_closed());

        let msgs = drain(&mut rx_fresh);
        assert_eq!(assigned_color(&msgs[0]), Some(Color::White));

        // The old read loop exits afterwards; the new seat must survive.
        d.on_disconnect(&a).await;
        let session = d.registry().get(&game_id).await.unwrap();
        assert!(session.is_connected(&a2.player_id).await);

        d.dispatch(&a2, ClientMessage::Move { game_id, mv: "e4".into() }).await;
        assert!(matches!(drain(&mut rx_fresh).last(), Some(ServerMessage::State(s)) if s.moves.len() == 1));
    }

    #[tokio::test]
    async fn test_reconnect_to_full_game_by_stranger() {
        let d = dispatcher(None);
        let (game_id, _a, _b) = invite_game(&d).await;

        let (conn, _rx) = connection();
        let carol = ConnectionContext { player_id: PlayerId::new("carol"), connection: conn };
        let result = d.on_connect(&carol, Some(&game_id)).await;
        assert_eq!(result, Err(SessionError::SessionFull));
    }

    #[tokio::test]
    async fn test_seat_taken_on_connect_is_superseded() {
        let d = dispatcher(None);
        let (a, mut rx_a) = connect(&d, "alice").await;
        d.dispatch(&a, ClientMessage::CreateGame).await;
        let game_id = created_id(&drain(&mut rx_a));

        let (conn, _rx) = connection();
        let carol1 = ConnectionContext { player_id: PlayerId::new("carol"), connection: conn };
        d.on_connect(&carol1, Some(&game_id)).await.unwrap();

        let session = d.registry().get(&game_id).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Active);
        assert_eq!(d.registry().sessions_for(&carol1.player_id).await.len(), 1);

        let (conn, _rx2) = connection();
        let carol2 = ConnectionContext { player_id: PlayerId::new("carol"), connection: conn };
        d.on_connect(&carol2, None).await.unwrap();
        assert!(carol1.connection.is_closed());
        assert!(!session.is_connected(&carol2.player_id).await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_seat_taken_on_connect() {
        let d = dispatcher(None);
        let (a, mut rx_a) = connect(&d, "alice").await;
        d.dispatch(&a, ClientMessage::CreateGame).await;
        let game_id = created_id(&drain(&mut rx_a));

        let (conn, _rx) = connection();
        let carol = ConnectionContext { player_id: PlayerId::new("carol"), connection: conn };
        d.on_connect(&carol, Some(&game_id)).await.unwrap();

        let session = d.registry().get(&game_id).await.unwrap();
        assert!(session.is_connected(&carol.player_id).await);
        d.on_disconnect(&carol).await;
        assert!(!session.is_connected(&carol.player_id).await);
        // Seat already cleared by the disconnect.
        assert!(!session.handle_disconnect(&carol.player_id, carol.connection.id()).await);
    }

    #[tokio::test]
    async fn test_time_up_then_game_over() {
        let d = dispatcher(Some(fast_clock(10)));
        let (game_id, (a, mut rx_a), (_b, mut rx_b)) = invite_game(&d).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        tokio::time::sleep(Duration::from_millis(80)).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = drain(rx);
            let time_ups: Vec<_> = msgs
                .iter()
                .filter_map(|m| match m {
                    ServerMessage::TimeUp(t) => Some(t),
                    _ => None,
                })
                .collect();
            assert_eq!(time_ups.len(), 1);
            assert_eq!(time_ups[0].loser, Color::White);
            assert_eq!(time_ups[0].winner, Color::Black);
            assert_eq!(time_ups[0].reason, "Time up");
        }

        d.dispatch(&a, ClientMessage::Move { game_id: game_id.clone(), mv: "e4".into() }).await;
        assert_eq!(errors(&drain(&mut rx_a)), vec!["Game is already over".to_string()]);

        let session = d.registry().get(&game_id).await.unwrap();
        assert_eq!(session.status().await, SessionStatus::Completed);
    }
}
