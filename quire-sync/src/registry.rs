//! Process-wide map from document id to live session.
//!
//! ```text
//!             slots: RwLock<HashMap<doc_id, Arc<Slot>>>
//!                          │
//!          ┌───────────────┼────────────────┐
//!          ▼               ▼                ▼
//!   Slot (Mutex)     Slot (Mutex)     Slot (Mutex)
//!   Live(Session)    Vacant (loading) Retired (closing)
//! ```
//!
//! The map lock is only held for lookups and inserts. Everything that must
//! be atomic for one document (initial load, attach, check-then-remove,
//! teardown flush) runs under that document's slot lock, so:
//! - concurrent first attaches perform exactly one load,
//! - an attach racing a teardown either joins the live session or waits and
//!   then loads fresh state after the flush has landed,
//! - unrelated documents never wait on each other's storage I/O.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::session::{Attachment, ConnectionId, Session, SessionConfig, SessionError};
use crate::stats::{AtomicSyncStats, SyncStats};
use crate::storage::{DocumentStorage, StoreError};

enum SlotState {
    /// Registered, no session yet
    Vacant,
    Live(Arc<Session>),
    /// Removed from the map; waiters must look the document up again
    Retired,
}

struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Vacant),
        }
    }
}

/// Owns every live session. Inject one per server.
pub struct SessionRegistry {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    storage: Arc<dyn DocumentStorage>,
    config: SessionConfig,
    stats: Arc<AtomicSyncStats>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn DocumentStorage>, config: SessionConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            storage,
            config,
            stats: Arc::new(AtomicSyncStats::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    /// Attach `conn` to the session for `doc_id`, creating it on first use.
    pub async fn attach(
        &self,
        doc_id: &str,
        conn: ConnectionId,
    ) -> Result<Attachment, SessionError> {
        loop {
            let slot = self.slot(doc_id).await;
            let mut state = slot.state.lock().await;

            let session = match self.get_or_create(doc_id, &mut state).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    self.retire(doc_id, &slot, &mut state).await;
                    return Err(e);
                }
            };

            return match session.attach(conn).await {
                Ok(attachment) => {
                    log::debug!("Connection {conn} attached to doc {doc_id}");
                    Ok(attachment)
                }
                Err(e) => {
                    if session.member_count().await == 0 {
                        self.close(doc_id, &slot, &mut state, &session).await;
                    }
                    Err(e)
                }
            };
        }
    }

    /// Detach `conn`; tears the session down if it was the last member.
    /// Returns whether the session was closed.
    pub async fn detach(&self, doc_id: &str, conn: ConnectionId) -> bool {
        let Some(slot) = self.slots.read().await.get(doc_id).cloned() else {
            return false;
        };
        let mut state = slot.state.lock().await;

        let session = match &*state {
            SlotState::Live(session) => session.clone(),
            _ => return false,
        };

        let remaining = session.detach(conn).await;
        log::debug!("Connection {conn} detached from doc {doc_id} ({remaining} remaining)");
        if remaining > 0 {
            return false;
        }

        self.close(doc_id, &slot, &mut state, &session).await;
        true
    }

    /// Remove the session for `doc_id` iff it currently has no members.
    pub async fn remove_if_empty(&self, doc_id: &str) -> bool {
        let Some(slot) = self.slots.read().await.get(doc_id).cloned() else {
            return false;
        };
        let mut state = slot.state.lock().await;

        let session = match &*state {
            SlotState::Live(session) => session.clone(),
            _ => return false,
        };
        if session.member_count().await > 0 {
            return false;
        }

        self.close(doc_id, &slot, &mut state, &session).await;
        true
    }

    /// Live session for `doc_id`, if any. Waits out an in-flight load.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<Session>> {
        let slot = self.slots.read().await.get(doc_id).cloned()?;
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Live(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.slots.read().await.len()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    /// Flush every live session. Sessions stay registered.
    pub async fn flush_all(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut failed = 0;
        for slot in slots {
            let state = slot.state.lock().await;
            if let SlotState::Live(session) = &*state {
                if let Err(e) = session.flush().await {
                    log::error!("Flush failed for doc {}: {e}", session.doc_id());
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Create `doc_id` in storage unless it already exists. Returns whether
    /// it was created; an existing document keeps its name and content.
    pub async fn create_document(&self, doc_id: &str, name: &str) -> Result<bool, SessionError> {
        loop {
            let slot = self.slot(doc_id).await;
            let mut state = slot.state.lock().await;
            match &*state {
                SlotState::Live(_) => return Ok(false),
                SlotState::Retired => continue,
                SlotState::Vacant => {}
            }

            let id = doc_id.to_string();
            let name = name.to_string();
            let created = self
                .blocking(move |storage| match storage.load(&id) {
                    Ok(_) => Ok(false),
                    Err(StoreError::NotFound(_)) => storage.create(&id, &name).map(|()| true),
                    Err(e) => Err(e),
                })
                .await;
            self.retire(doc_id, &slot, &mut state).await;

            if let Ok(true) = created {
                log::info!("Created doc {doc_id}");
            }
            return created.map_err(SessionError::from);
        }
    }

    /// Delete `doc_id` from storage. Refused while a session is live, so
    /// connected members never edit a document that no longer exists.
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool, SessionError> {
        loop {
            let slot = self.slot(doc_id).await;
            let mut state = slot.state.lock().await;
            match &*state {
                SlotState::Live(_) => return Err(SessionError::DocumentInUse(doc_id.to_string())),
                SlotState::Retired => continue,
                SlotState::Vacant => {}
            }

            let id = doc_id.to_string();
            let deleted = self.blocking(move |storage| storage.delete(&id)).await;
            self.retire(doc_id, &slot, &mut state).await;

            if let Ok(true) = deleted {
                log::info!("Deleted doc {doc_id}");
            }
            return deleted.map_err(SessionError::from);
        }
    }

    pub async fn list_documents(&self) -> Result<Vec<String>, SessionError> {
        self.blocking(|storage| storage.list_documents())
            .await
            .map_err(SessionError::from)
    }

    /// Run a storage call off the async runtime.
    async fn blocking<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DocumentStorage) -> Result<T, StoreError> + Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || call(&*storage))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())))
    }

    /// Existing session, or a freshly loaded one. `Ok(None)` means the slot
    /// was retired while we waited and the caller must retry.
    async fn get_or_create(
        &self,
        doc_id: &str,
        state: &mut SlotState,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        match state {
            SlotState::Live(session) => return Ok(Some(session.clone())),
            SlotState::Retired => return Ok(None),
            SlotState::Vacant => {}
        }

        let id = doc_id.to_string();
        let loaded = self.blocking(move |storage| storage.load(&id)).await;
        AtomicSyncStats::bump(&self.stats.loads);

        let initial = loaded.map_err(|e| {
            log::warn!("Initial load failed for doc {doc_id}: {e}");
            SessionError::from(e)
        })?;

        let session = Arc::new(Session::new(
            doc_id,
            initial,
            self.storage.clone(),
            &self.config,
            self.stats.clone(),
        ));
        *state = SlotState::Live(session.clone());
        AtomicSyncStats::bump(&self.stats.sessions_created);
        log::info!("Session opened for doc {doc_id}");
        Ok(Some(session))
    }

    /// Flush, then retire the slot. Caller holds the slot lock.
    async fn close(&self, doc_id: &str, slot: &Arc<Slot>, state: &mut SlotState, session: &Session) {
        if let Err(e) = session.flush().await {
            log::error!("Final flush failed for doc {doc_id}, unsaved edits dropped: {e}");
        }
        self.retire(doc_id, slot, state).await;
        AtomicSyncStats::bump(&self.stats.sessions_closed);
        log::info!("Session closed for doc {doc_id}");
    }

    /// Mark the slot retired and unregister it if it is still the current one.
    async fn retire(&self, doc_id: &str, slot: &Arc<Slot>, state: &mut SlotState) {
        *state = SlotState::Retired;
        let mut slots = self.slots.write().await;
        if slots.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(doc_id);
        }
    }

    /// Registered slot for `doc_id`, inserting a vacant one if needed.
    async fn slot(&self, doc_id: &str) -> Arc<Slot> {
        // Fast path: read lock
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(doc_id) {
                return slot.clone();
            }
        }

        // Slow path: double-check under the write lock
        let mut slots = self.slots.write().await;
        slots
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }
}
