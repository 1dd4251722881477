//! WebSocket Game Server
//!
//! Async WebSocket server for chess sessions.
//! Authenticates each connection at the handshake, then runs one reader task
//! and one writer task per connection and hands decoded messages to the
//! [`Dispatcher`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};
use url::form_urlencoded;

use crate::game::clock::ClockConfig;
use crate::game::rules::ChessRules;
use crate::game::state::SessionId;
use crate::network::auth::{authenticate, AuthConfig, AuthError};
use crate::network::connection::{ConnectionReceiver, PlayerConnection};
use crate::network::dispatcher::{ConnectionContext, Dispatcher};
use crate::network::matchmaking::MatchmakingQueue;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::registry::SessionRegistry;
use crate::network::session::{SessionContext, SessionError};
use crate::store::{GameStore, PersistenceSink};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Undelivered messages a connection may buffer before it is closed.
    pub outbound_buffer: usize,
    /// Clock for new sessions; `None` plays untimed.
    pub clock: Option<ClockConfig>,
    /// Evict completed sessions after this long. `None` keeps them forever.
    pub completed_session_ttl: Option<Duration>,
    /// How often the eviction sweep runs.
    pub cleanup_interval: Duration,
    /// Directory for the file store; `None` keeps records in memory.
    pub store_dir: Option<PathBuf>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_buffer: 256,
            clock: Some(ClockConfig::default()),
            completed_session_ttl: None,
            cleanup_interval: Duration::from_secs(60),
            store_dir: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());

        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: parsed("MAX_CONNECTIONS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_connections),
            outbound_buffer: parsed("OUTBOUND_BUFFER")
                .map(|n| n as usize)
                .unwrap_or(defaults.outbound_buffer),
            clock: ClockConfig::from_env(),
            completed_session_ttl: parsed("COMPLETED_SESSION_TTL_SECS").map(Duration::from_secs),
            cleanup_interval: defaults.cleanup_interval,
            store_dir: std::env::var("STORE_DIR").ok().map(PathBuf::from),
            version: defaults.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Parameters captured from the WebSocket upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// Session to re-attach to (`gameId` query parameter).
    pub game_id: Option<SessionId>,
    /// Bearer credential: `accessToken` cookie, `token` query parameter or
    /// `Authorization: Bearer` header, in that order.
    pub token: Option<String>,
}

impl ConnectParams {
    /// Extract parameters from an upgrade request.
    pub fn from_request(req: &Request) -> Self {
        let query: Vec<(String, String)> =
            form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                .into_owned()
                .collect();
        let query_param = |name: &str| {
            query
                .iter()
                .find(|(k, v)| k == name && !v.is_empty())
                .map(|(_, v)| v.clone())
        };

        let cookie = req
            .headers()
            .get_all("cookie")
            .iter()
            .filter_map(|h| h.to_str().ok())
            .flat_map(|h| h.split(';'))
            .filter_map(|c| c.trim().split_once('='))
            .find(|(k, v)| *k == "accessToken" && !v.is_empty())
            .map(|(_, v)| v.to_string());

        let bearer = req
            .headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            game_id: query_param("gameId").map(SessionId::new),
            token: cookie.or_else(|| query_param("token")).or(bearer),
        }
    }
}

/// Decrements the live connection count when a connection task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Credential validation.
    auth: AuthConfig,
    /// Routing state shared by all connections.
    dispatcher: Arc<Dispatcher>,
    /// Live connection count.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server persisting to `store`.
    ///
    /// Must be called inside a Tokio runtime (the persistence writer is
    /// spawned here).
    pub fn new(config: ServerConfig, auth: AuthConfig, store: Arc<dyn GameStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let ctx = SessionContext {
            rules: Arc::new(ChessRules::new()),
            sink: PersistenceSink::spawn(store.clone()),
            clock: config.clock.clone(),
        };
        let registry = Arc::new(SessionRegistry::new(store, ctx));
        let dispatcher = Arc::new(Dispatcher::new(registry, Arc::new(MatchmakingQueue::new())));

        Self {
            config,
            auth,
            dispatcher,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server v{} listening on {}", self.config.version, listener.local_addr()?);

        let cleanup_handle = self.config.completed_session_ttl.map(|ttl| {
            let registry = self.dispatcher.registry().clone();
            let period = self.config.cleanup_interval;
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(Self::run_cleanup_loop(registry, ttl, period, shutdown_rx))
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = self.try_reserve_slot() {
                                warn!("{}, rejecting {}", e, addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some(handle) = cleanup_handle {
            handle.abort();
        }

        Ok(())
    }

    fn try_reserve_slot(&self) -> Result<(), GameServerError> {
        let max = self.config.max_connections;
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| GameServerError::ConnectionLimitReached)
    }

    /// Handle a new WebSocket connection. A slot must already be reserved.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let dispatcher = self.dispatcher.clone();
        let auth = self.auth.clone();
        let buffer = self.config.outbound_buffer;
        let slot = ConnectionSlot(self.connections.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _slot = slot;

            let mut params = ConnectParams::default();
            let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                params = ConnectParams::from_request(req);
                Ok(resp)
            };
            let ws_stream = match accept_hdr_async(stream, capture).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (connection, receiver) = PlayerConnection::new(buffer);
            let mut closed = connection.closed_signal();

            // Writer: drains outbound messages, then sends a close frame once
            // the connection is closed.
            let writer = tokio::spawn(async move {
                let ConnectionReceiver { mut outbound, mut closed } = receiver;
                let mut closing = false;
                loop {
                    let msg = if closing {
                        outbound.try_recv().ok()
                    } else {
                        tokio::select! {
                            biased;
                            msg = outbound.recv() => msg,
                            _ = closed.changed() => {
                                closing = true;
                                continue;
                            }
                        }
                    };
                    let Some(msg) = msg else { break };
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
                let _ = ws_sender.close().await;
            });

            let player_id = match authenticate(params.token.as_deref(), &auth) {
                Ok(player_id) => player_id,
                Err(e) => {
                    let reason = match e {
                        AuthError::Missing => SessionError::AuthRequired,
                        _ => SessionError::AuthInvalid,
                    };
                    warn!("Rejecting {}: {}", addr, e);
                    connection.send(ServerMessage::error(reason.to_string()));
                    connection.close();
                    let _ = writer.await;
                    return;
                }
            };

            let ctx = ConnectionContext {
                player_id,
                connection: connection.clone(),
            };

            if let Err(e) = dispatcher.on_connect(&ctx, params.game_id.as_ref()).await {
                warn!("Reconnect of {} failed: {}", ctx.player_id, e);
                connection.send(ServerMessage::error(format!("Failed to reconnect to game: {e}")));
                dispatcher.on_disconnect(&ctx).await;
                let _ = writer.await;
                return;
            }

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => dispatcher.dispatch(&ctx, client_msg).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", ctx.player_id, e);
                                        ctx.reject(&SessionError::InvalidMessage);
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                ctx.reject(&SessionError::InvalidMessage);
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} closed the connection", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = closed.changed() => {
                        debug!("Connection {} closed by server", ctx.connection.id());
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            dispatcher.on_disconnect(&ctx).await;
            let _ = writer.await;
        });
    }

    /// Run the completed-session eviction loop.
    async fn run_cleanup_loop(
        registry: Arc<SessionRegistry>,
        ttl: Duration,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut interval = interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = registry.evict_completed(ttl).await;
                    if evicted > 0 {
                        debug!("Cleanup evicted {} games", evicted);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Get in-memory session count.
    pub async fn session_count(&self) -> usize {
        self.dispatcher.registry().session_count().await
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.dispatcher.queue().len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::tests::{create_test_token, test_claims, SECRET};
    use crate::store::MemoryGameStore;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::http;

    fn test_server(config: ServerConfig) -> Arc<GameServer> {
        Arc::new(GameServer::new(
            config,
            AuthConfig::with_secret(SECRET),
            Arc::new(MemoryGameStore::new()),
        ))
    }

    async fn start(config: ServerConfig) -> (Arc<GameServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = test_server(config);
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn next_message<S>(ws: &mut S) -> Option<ServerMessage>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await.ok()?? {
                Ok(Message::Text(text)) => return Some(ServerMessage::from_json(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.completed_session_ttl.is_none());
        assert_eq!(config.clock, Some(ClockConfig::default()));
    }

    #[test]
    fn test_connect_params_sources() {
        let req = http::Request::builder()
            .uri("/ws?gameId=g1&token=from-query")
            .header("Cookie", "theme=dark; accessToken=from-cookie")
            .header("Authorization", "Bearer from-header")
            .body(())
            .unwrap();
        let params = ConnectParams::from_request(&req);
        assert_eq!(params.game_id, Some(SessionId::new("g1")));
        assert_eq!(params.token.as_deref(), Some("from-cookie"));

        let req = http::Request::builder()
            .uri("/ws")
            .header("Authorization", "Bearer from-header")
            .body(())
            .unwrap();
        let params = ConnectParams::from_request(&req);
        assert_eq!(params.game_id, None);
        assert_eq!(params.token.as_deref(), Some("from-header"));

        let req = http::Request::builder().uri("/ws?token=").body(()).unwrap();
        assert_eq!(ConnectParams::from_request(&req), ConnectParams::default());
    }

    #[test]
    fn test_connect_params_are_percent_decoded() {
        let req = http::Request::builder()
            .uri("/ws?gameId=game%2D1&token=a%2Eb%2Ec")
            .body(())
            .unwrap();
        let params = ConnectParams::from_request(&req);
        assert_eq!(params.game_id, Some(SessionId::new("game-1")));
        assert_eq!(params.token.as_deref(), Some("a.b.c"));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = test_server(ServerConfig::default());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.queue_size().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_missing_credential_rejected() {
        let (server, addr) = start(ServerConfig { clock: None, ..Default::default() }).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        assert_eq!(next_message(&mut ws).await, Some(ServerMessage::error("Missing authentication")));
        assert_eq!(next_message(&mut ws).await, None);

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token=garbage")).await.unwrap();
        assert_eq!(next_message(&mut ws).await, Some(ServerMessage::error("Invalid authentication")));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_create_and_join_over_websocket() {
        let (server, addr) = start(ServerConfig { clock: None, ..Default::default() }).await;
        let url = |sub: &str| {
            let token = create_test_token(&test_claims(sub), SECRET);
            format!("ws://{addr}/ws?token={token}")
        };

        let (mut alice, _) = connect_async(url("alice")).await.unwrap();
        let (mut bob, _) = connect_async(url("bob")).await.unwrap();

        alice
            .send(Message::Text(r#"{"type":"createGame","data":{}}"#.into()))
            .await
            .unwrap();
        let game_id = match next_message(&mut alice).await {
            Some(ServerMessage::GameCreated(created)) => created.game_id,
            other => panic!("expected gameCreated, got {other:?}"),
        };

        let join = format!(r#"{{"type":"joinInvite","data":{{"gameId":"{game_id}"}}}}"#);
        bob.send(Message::Text(join)).await.unwrap();

        assert!(matches!(next_message(&mut bob).await, Some(ServerMessage::PlayerInfo(_))));
        assert!(matches!(next_message(&mut bob).await, Some(ServerMessage::State(_))));
        assert!(matches!(next_message(&mut alice).await, Some(ServerMessage::PlayerInfo(_))));
        assert!(matches!(next_message(&mut alice).await, Some(ServerMessage::State(_))));

        bob.send(Message::Text("not json".into())).await.unwrap();
        assert_eq!(next_message(&mut bob).await, Some(ServerMessage::error("Invalid message format")));

        let mv = format!(r#"{{"type":"move","data":{{"gameId":"{game_id}","move":"e4"}}}}"#);
        alice.send(Message::Text(mv)).await.unwrap();
        match next_message(&mut bob).await {
            Some(ServerMessage::State(state)) => assert_eq!(state.moves, vec!["e2e4".to_string()]),
            other => panic!("expected state, got {other:?}"),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(ServerConfig {
            max_connections: 1,
            clock: None,
            ..Default::default()
        })
        .await;
        let token = create_test_token(&test_claims("alice"), SECRET);

        let (_first, _) = connect_async(format!("ws://{addr}/ws?token={token}")).await.unwrap();
        let second = connect_async(format!("ws://{addr}/ws?token={token}")).await;
        assert!(second.is_err());

        server.shutdown();
    }
}
