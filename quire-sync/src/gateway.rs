//! Transport-agnostic boundary between connections and sessions.
//!
//! A transport (the WebSocket server, or a test harness) calls
//! `on_connect` once, `on_message` per inbound event, pulls outbound
//! messages with `Connection::next_outbound`, and calls `on_disconnect`
//! exactly once when the connection ends.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::protocol::SyncMessage;
use crate::registry::SessionRegistry;
use crate::session::{Broadcast, ConnectionId, Session, SessionError};

/// A connection attached to a session.
pub struct Connection {
    id: ConnectionId,
    doc_id: String,
    session: Arc<Session>,
    receiver: broadcast::Receiver<Arc<Broadcast>>,
    snapshot: Option<SyncMessage>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The attach-time snapshot. Yields it once.
    pub fn take_snapshot(&mut self) -> Option<SyncMessage> {
        self.snapshot.take()
    }

    /// Next broadcast this connection must deliver.
    ///
    /// Skips its own changes. Cancel-safe, so it can sit in a `select!`.
    /// Returns `None` once the session's channel is gone.
    pub async fn next_outbound(&mut self) -> Option<SyncMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(broadcast) => {
                    if broadcast.is_for(self.id) {
                        return Some(broadcast.message.clone());
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Connection {} lagged by {n} messages on doc {}", self.id, self.doc_id);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

pub struct Gateway {
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Attach a new connection to the session for `doc_id`.
    pub async fn on_connect(&self, doc_id: &str) -> Result<Connection, SessionError> {
        if doc_id.trim().is_empty() {
            return Err(SessionError::InvalidDocumentId(doc_id.to_string()));
        }

        let id = Uuid::new_v4();
        let attachment = self.registry.attach(doc_id, id).await?;
        log::info!("Connection {id} joined doc {doc_id}");

        Ok(Connection {
            id,
            doc_id: doc_id.to_string(),
            session: attachment.session,
            receiver: attachment.receiver,
            snapshot: Some(attachment.snapshot),
        })
    }

    /// Dispatch one inbound event. Returns a direct reply, if any.
    pub async fn on_message(&self, conn: &Connection, message: SyncMessage) -> Option<SyncMessage> {
        match message {
            SyncMessage::Change(content) => {
                let lines = content.len();
                let receivers = conn.session.apply_change(conn.id, content).await;
                log::debug!(
                    "Change from {} on doc {} ({lines} lines, {receivers} receivers)",
                    conn.id,
                    conn.doc_id
                );
                None
            }
            SyncMessage::Rename(name) => {
                log::debug!("Rename from {} on doc {} to {name:?}", conn.id, conn.doc_id);
                conn.session.apply_rename(conn.id, name).await;
                None
            }
            SyncMessage::Ping => Some(SyncMessage::Pong),
            other => {
                log::debug!(
                    "Ignoring {:?} from connection {}",
                    other.message_type(),
                    conn.id
                );
                None
            }
        }
    }

    /// Detach the connection; may tear the session down.
    pub async fn on_disconnect(&self, conn: Connection) {
        let closed = self.registry.detach(&conn.doc_id, conn.id).await;
        log::info!(
            "Connection {} left doc {}{}",
            conn.id,
            conn.doc_id,
            if closed { " (session closed)" } else { "" }
        );
    }
}
