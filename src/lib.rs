//! # Chess Arena Server
//!
//! Real-time two-player chess over WebSocket: a matchmaking queue, direct
//! invites, per-session clocks and reconnection, with a best-effort
//! persistence mirror.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CHESS ARENA SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Pure game state                           │
//! │  ├── state.rs    - Ids, colors, status and results           │
//! │  ├── rules.rs    - Rules engine adapter (chess crate)        │
//! │  └── clock.rs    - Per-session countdown and ticker          │
//! │                                                              │
//! │  network/        - Connections and sessions                  │
//! │  ├── server.rs   - WebSocket accept loop, read/write tasks   │
//! │  ├── auth.rs     - JWT validation                            │
//! │  ├── protocol.rs - {type, data} message envelopes            │
//! │  ├── dispatcher.rs - Message routing, connect/disconnect     │
//! │  ├── matchmaking.rs - FIFO pairing queue                     │
//! │  ├── registry.rs - Session index, restore from store         │
//! │  ├── session.rs  - Per-game state machine                    │
//! │  └── connection.rs - Outbound handle per connection          │
//! │                                                              │
//! │  store/          - Persistence (best-effort mirror)          │
//! │  ├── mod.rs      - GameRecord, GameStore, PersistenceSink    │
//! │  ├── memory.rs   - In-memory store                           │
//! │  └── file.rs     - JSON file per game                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Each session serializes its own operations behind one lock; different
//! sessions never contend. The registry and queue locks guard only their
//! indexes and are never held while a session lock is taken.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use game::state::{Color, PlayerId, SessionId, SessionStatus};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
