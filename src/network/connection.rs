//! Player Connection Handle
//!
//! The session engine never touches a socket. Each authenticated connection is
//! represented by a [`PlayerConnection`]: a bounded outbound message channel
//! plus a close signal. The server's writer task owns the other half
//! ([`ConnectionReceiver`]) and turns it into WebSocket frames.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::network::protocol::ServerMessage;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of one live connection.
#[derive(Clone)]
pub struct PlayerConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerMessage>,
    closed: Arc<watch::Sender<bool>>,
}

/// Receiving half, owned by the transport.
pub struct ConnectionReceiver {
    /// Messages to write to the socket, in order.
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Flips to `true` once the connection has been closed by the server.
    pub closed: watch::Receiver<bool>,
}

impl PlayerConnection {
    /// New connection with room for `buffer` undelivered messages.
    pub fn new(buffer: usize) -> (Self, ConnectionReceiver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);

        let conn = Self {
            id: ConnectionId::next(),
            outbound: outbound_tx,
            closed: Arc::new(closed_tx),
        };
        let receiver = ConnectionReceiver {
            outbound: outbound_rx,
            closed: closed_rx,
        };
        (conn, receiver)
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message without waiting.
    ///
    /// A consumer that has fallen `buffer` messages behind is closed rather
    /// than allowed to stall the sender. Messages to a closed connection are
    /// dropped. Returns whether the message was queued.
    pub fn send(&self, msg: ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound buffer full on {}, closing", self.id);
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether [`PlayerConnection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Watch for the connection being closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl fmt::Debug for PlayerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let (a, _ra) = PlayerConnection::new(4);
        let (b, _rb) = PlayerConnection::new(4);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_send_and_receive() {
        let (conn, mut rx) = PlayerConnection::new(4);
        assert!(conn.send(ServerMessage::error("one")));
        assert_eq!(rx.outbound.try_recv().unwrap(), ServerMessage::error("one"));
    }

    #[test]
    fn test_full_buffer_closes() {
        let (conn, rx) = PlayerConnection::new(1);
        assert!(conn.send(ServerMessage::error("one")));
        assert!(!conn.send(ServerMessage::error("two")));
        assert!(conn.is_closed());
        assert!(*rx.closed.borrow());
    }

    #[test]
    fn test_close_is_idempotent_and_shared() {
        let (conn, mut rx) = PlayerConnection::new(4);
        let clone = conn.clone();
        conn.close();
        conn.close();
        assert!(clone.is_closed());
        assert!(!clone.send(ServerMessage::error("late")));
        assert!(rx.outbound.try_recv().is_err());
    }
}
