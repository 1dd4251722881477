//! Network Layer
//!
//! WebSocket server, wire protocol and the session engine behind it.
//! Sessions, the registry and the matchmaking queue never touch a socket;
//! they talk to connections through [`connection::PlayerConnection`] handles.

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod matchmaking;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, TokenClaims};
pub use connection::{ConnectionId, PlayerConnection};
pub use dispatcher::{ConnectionContext, Dispatcher};
pub use matchmaking::{MatchmakingQueue, Pairing, QueuedPlayer};
pub use protocol::{ClientMessage, ServerMessage, GameStateData};
pub use registry::SessionRegistry;
pub use session::{Session, SessionContext, SessionError};
pub use server::{ConnectParams, GameServer, GameServerError, ServerConfig};
