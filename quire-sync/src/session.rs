//! Live state for one document.
//!
//! A `Session` is the only mutator of a document's name and content while any
//! connection has it open. Every mutation takes the state lock, replaces the
//! value, and publishes the broadcast before releasing the lock, so members
//! observe mutations in exactly the order they were applied.
//!
//! ```text
//! change ──► lock ─► replace content ─► broadcast (N-1) ─► unlock ─► debounce
//! rename ──► lock ─► replace name    ─► broadcast (N)   ─► unlock ─► persist now
//! ```
//!
//! Durable writes go through a per-session write gate and always re-read the
//! current state, so only the newest content ever reaches storage.

use std::cmp::max;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::debounce::Debouncer;
use crate::protocol::{DocumentContent, SyncMessage};
use crate::stats::AtomicSyncStats;
use crate::storage::{DocumentStorage, StoreError, StoredDocument};

/// Identity of one attached transport connection.
pub type ConnectionId = Uuid;

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last change before content is written
    pub quiescence: Duration,
    /// Messages buffered per member before it starts lagging
    pub broadcast_capacity: usize,
    /// Maximum attached connections per document
    pub max_members: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quiescence: Duration::from_secs(2),
            broadcast_capacity: 256,
            max_members: 100,
        }
    }
}

/// Session errors surfaced to the connecting transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Session for {doc_id} is full ({max} members)")]
    SessionFull { doc_id: String, max: usize },
    #[error("Invalid document id: {0:?}")]
    InvalidDocumentId(String),
    #[error("Document {0} has connected members")]
    DocumentInUse(String),
    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SessionError::NotFound(id),
            other => SessionError::Storage(other),
        }
    }
}

/// A message fanned out to the members of a session.
#[derive(Debug)]
pub struct Broadcast {
    pub origin: ConnectionId,
    pub message: SyncMessage,
}

impl Broadcast {
    /// Changes skip their originator; everything else goes to all members.
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        match self.message {
            SyncMessage::Change(_) => self.origin != conn,
            _ => true,
        }
    }
}

/// What a newly attached connection receives.
pub struct Attachment {
    pub session: Arc<Session>,
    pub receiver: broadcast::Receiver<Arc<Broadcast>>,
    /// Authoritative state at attach time
    pub snapshot: SyncMessage,
}

struct DocumentState {
    name: String,
    content: DocumentContent,
    content_revision: u64,
    persisted_content_revision: u64,
    name_revision: u64,
    persisted_name_revision: u64,
}

/// Durable-write side of a session. Shared with timer and rename tasks.
struct Persister {
    doc_id: String,
    state: Arc<Mutex<DocumentState>>,
    storage: Arc<dyn DocumentStorage>,
    write_gate: Arc<Mutex<()>>,
    stats: Arc<AtomicSyncStats>,
}

impl Persister {
    /// Write the current content if it changed since the last successful write.
    async fn persist_content(&self) -> Result<(), StoreError> {
        let gate = self.write_gate.clone().lock_owned().await;

        let (content, revision) = {
            let state = self.state.lock().await;
            if state.content_revision == state.persisted_content_revision {
                return Ok(());
            }
            (state.content.clone(), state.content_revision)
        };

        let storage = self.storage.clone();
        let doc_id = self.doc_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _gate = gate;
            storage.save_content(&doc_id, &content)
        })
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())));

        match result {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.persisted_content_revision = max(state.persisted_content_revision, revision);
                AtomicSyncStats::bump(&self.stats.content_writes);
                log::debug!("Persisted content of doc {} (revision {revision})", self.doc_id);
                Ok(())
            }
            Err(e) => {
                AtomicSyncStats::bump(&self.stats.failed_writes);
                log::warn!("Failed to persist content of doc {}: {e}", self.doc_id);
                Err(e)
            }
        }
    }

    /// Write the current name if it changed since the last successful write.
    async fn persist_name(&self) -> Result<(), StoreError> {
        let gate = self.write_gate.clone().lock_owned().await;

        let (name, revision) = {
            let state = self.state.lock().await;
            if state.name_revision == state.persisted_name_revision {
                return Ok(());
            }
            (state.name.clone(), state.name_revision)
        };

        let storage = self.storage.clone();
        let doc_id = self.doc_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _gate = gate;
            storage.save_name(&doc_id, &name)
        })
        .await
        .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())));

        match result {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.persisted_name_revision = max(state.persisted_name_revision, revision);
                AtomicSyncStats::bump(&self.stats.name_writes);
                log::debug!("Persisted name of doc {}", self.doc_id);
                Ok(())
            }
            Err(e) => {
                AtomicSyncStats::bump(&self.stats.failed_writes);
                log::warn!("Failed to persist name of doc {}: {e}", self.doc_id);
                Err(e)
            }
        }
    }
}

/// Authoritative in-memory copy of one document plus its members.
pub struct Session {
    doc_id: String,
    state: Arc<Mutex<DocumentState>>,
    members: RwLock<HashSet<ConnectionId>>,
    sender: broadcast::Sender<Arc<Broadcast>>,
    persister: Arc<Persister>,
    debouncer: Debouncer,
    max_members: usize,
    stats: Arc<AtomicSyncStats>,
}

impl Session {
    pub(crate) fn new(
        doc_id: impl Into<String>,
        initial: StoredDocument,
        storage: Arc<dyn DocumentStorage>,
        config: &SessionConfig,
        stats: Arc<AtomicSyncStats>,
    ) -> Self {
        let doc_id = doc_id.into();
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let state = Arc::new(Mutex::new(DocumentState {
            name: initial.name,
            content: initial.content,
            content_revision: 0,
            persisted_content_revision: 0,
            name_revision: 0,
            persisted_name_revision: 0,
        }));
        let persister = Arc::new(Persister {
            doc_id: doc_id.clone(),
            state: state.clone(),
            storage,
            write_gate: Arc::new(Mutex::new(())),
            stats: stats.clone(),
        });

        Self {
            doc_id,
            state,
            members: RwLock::new(HashSet::new()),
            sender,
            persister,
            debouncer: Debouncer::new(config.quiescence),
            max_members: config.max_members,
            stats,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Add a member and hand it the current state plus a broadcast receiver.
    ///
    /// The receiver is created under the state lock, so no mutation can fall
    /// between the snapshot and the first broadcast it sees.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        conn: ConnectionId,
    ) -> Result<Attachment, SessionError> {
        {
            let mut members = self.members.write().await;
            if members.len() >= self.max_members && !members.contains(&conn) {
                return Err(SessionError::SessionFull {
                    doc_id: self.doc_id.clone(),
                    max: self.max_members,
                });
            }
            members.insert(conn);
        }

        let state = self.state.lock().await;
        let receiver = self.sender.subscribe();
        let snapshot = SyncMessage::Snapshot {
            name: state.name.clone(),
            content: state.content.clone(),
        };
        drop(state);

        Ok(Attachment {
            session: self.clone(),
            receiver,
            snapshot,
        })
    }

    /// Remove a member. Returns how many remain.
    pub(crate) async fn detach(&self, conn: ConnectionId) -> usize {
        let mut members = self.members.write().await;
        members.remove(&conn);
        members.len()
    }

    /// Replace the content wholesale, fan out to every other member, and
    /// restart the persistence window. Returns the number of receivers.
    pub async fn apply_change(&self, origin: ConnectionId, content: DocumentContent) -> usize {
        let receivers = {
            let mut state = self.state.lock().await;
            state.content = content.clone();
            state.content_revision += 1;
            self.publish(origin, SyncMessage::Change(content))
        };
        AtomicSyncStats::bump(&self.stats.changes_applied);

        let persister = self.persister.clone();
        self.debouncer.schedule(move || async move {
            let _ = persister.persist_content().await;
        });

        receivers
    }

    /// Replace the name, echo it to every member including the sender, and
    /// persist it right away on a background task.
    pub async fn apply_rename(&self, origin: ConnectionId, name: String) -> usize {
        let receivers = {
            let mut state = self.state.lock().await;
            state.name = name.clone();
            state.name_revision += 1;
            self.publish(origin, SyncMessage::Rename(name))
        };
        AtomicSyncStats::bump(&self.stats.renames_applied);

        let persister = self.persister.clone();
        tokio::spawn(async move {
            let _ = persister.persist_name().await;
        });

        receivers
    }

    /// Cancel the pending timer and write any unpersisted state now.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.debouncer.cancel();
        let content = self.persister.persist_content().await;
        let name = self.persister.persist_name().await;
        content.and(name)
    }

    fn publish(&self, origin: ConnectionId, message: SyncMessage) -> usize {
        self.sender
            .send(Arc::new(Broadcast { origin, message }))
            .unwrap_or(0)
    }

    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    pub async fn content(&self) -> DocumentContent {
        self.state.lock().await.content.clone()
    }

    /// Whether state has changed since the last successful write.
    pub async fn is_dirty(&self) -> bool {
        let state = self.state.lock().await;
        state.content_revision != state.persisted_content_revision
            || state.name_revision != state.persisted_name_revision
    }

    pub fn is_persist_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }
}
