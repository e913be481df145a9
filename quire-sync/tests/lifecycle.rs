//! Session lifecycle and persistence timing, driven through the gateway.
//!
//! Uses a recording storage backend so tests can count loads and writes and
//! inject slow loads or failing writes.

use quire_sync::gateway::Gateway;
use quire_sync::protocol::{content_from_lines, DocumentContent, SyncMessage};
use quire_sync::registry::SessionRegistry;
use quire_sync::session::{SessionConfig, SessionError};
use quire_sync::storage::{
    DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError, StoredDocument,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::Duration;

const QUIET: Duration = Duration::from_millis(150);

#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
    content_writes: Mutex<Vec<(Instant, DocumentContent)>>,
    name_writes: Mutex<Vec<String>>,
    load_delay: Option<Duration>,
    write_delay: Option<Duration>,
    fail_writes: AtomicBool,
}

impl RecordingStore {
    fn with_doc(doc_id: &str) -> Self {
        let store = Self::default();
        store.inner.create(doc_id, "Untitled").unwrap();
        store
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn content_writes(&self) -> Vec<(Instant, DocumentContent)> {
        self.content_writes.lock().unwrap().clone()
    }

    fn name_writes(&self) -> Vec<String> {
        self.name_writes.lock().unwrap().clone()
    }
}

impl DocumentStorage for RecordingStore {
    fn load(&self, doc_id: &str) -> Result<StoredDocument, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        self.inner.load(doc_id)
    }

    fn save_content(&self, doc_id: &str, content: &DocumentContent) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        self.inner.save_content(doc_id, content)?;
        self.content_writes
            .lock()
            .unwrap()
            .push((Instant::now(), content.clone()));
        Ok(())
    }

    fn save_name(&self, doc_id: &str, name: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.inner.save_name(doc_id, name)?;
        self.name_writes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn create(&self, doc_id: &str, name: &str) -> Result<(), StoreError> {
        self.inner.create(doc_id, name)
    }

    fn delete(&self, doc_id: &str) -> Result<bool, StoreError> {
        self.inner.delete(doc_id)
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_documents()
    }
}

fn gateway_over(store: Arc<dyn DocumentStorage>, quiescence: Duration) -> Gateway {
    let config = SessionConfig {
        quiescence,
        ..SessionConfig::default()
    };
    Gateway::new(Arc::new(SessionRegistry::new(store, config)))
}

#[tokio::test]
async fn test_concurrent_first_attach_loads_once() {
    let store = Arc::new(RecordingStore {
        load_delay: Some(Duration::from_millis(100)),
        ..RecordingStore::with_doc("doc")
    });
    let gateway = Arc::new(gateway_over(store.clone(), QUIET));

    let attaches: Vec<_> = (0..8)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.on_connect("doc").await })
        })
        .collect();

    let mut connections = Vec::new();
    for attach in attaches {
        connections.push(attach.await.unwrap().unwrap());
    }

    assert_eq!(store.loads(), 1);
    assert_eq!(gateway.registry().session_count().await, 1);
    let first = connections[0].session().clone();
    assert!(connections.iter().all(|c| Arc::ptr_eq(c.session(), &first)));
    assert_eq!(first.member_count().await, 8);
}

#[tokio::test]
async fn test_rapid_changes_write_once_with_latest_content() {
    let store = Arc::new(RecordingStore::with_doc("doc"));
    let gateway = gateway_over(store.clone(), QUIET);
    let conn = gateway.on_connect("doc").await.unwrap();

    for i in 0..10 {
        let content = content_from_lines([format!("revision {i}")]);
        gateway.on_message(&conn, SyncMessage::Change(content)).await;
        tokio::time::sleep(QUIET / 10).await;
    }
    tokio::time::sleep(QUIET * 3).await;

    let writes = store.content_writes();
    assert_eq!(writes.len(), 1, "burst should collapse into one write");
    assert_eq!(writes[0].1, content_from_lines(["revision 9"]));
}

#[tokio::test]
async fn test_single_change_waits_for_quiescence() {
    let store = Arc::new(RecordingStore::with_doc("doc"));
    let gateway = gateway_over(store.clone(), QUIET);
    let conn = gateway.on_connect("doc").await.unwrap();

    let sent = Instant::now();
    gateway
        .on_message(&conn, SyncMessage::Change(content_from_lines(["once"])))
        .await;

    tokio::time::sleep(QUIET / 2).await;
    assert!(store.content_writes().is_empty(), "write fired inside the window");

    tokio::time::sleep(QUIET * 2).await;
    let writes = store.content_writes();
    assert_eq!(writes.len(), 1);
    let waited = writes[0].0.duration_since(sent);
    assert!(waited >= QUIET);
    assert!(waited <= QUIET + Duration::from_millis(100), "write lagged the window: {waited:?}");
}

#[tokio::test]
async fn test_rename_persists_immediately() {
    let store = Arc::new(RecordingStore::with_doc("doc"));
    let gateway = gateway_over(store.clone(), Duration::from_secs(30));
    let conn = gateway.on_connect("doc").await.unwrap();

    gateway.on_message(&conn, SyncMessage::Rename("Notes".into())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.name_writes(), vec!["Notes".to_string()]);
    assert!(store.content_writes().is_empty());
}

#[tokio::test]
async fn test_failed_write_retried_on_next_change() {
    let store = Arc::new(RecordingStore::with_doc("doc"));
    let gateway = gateway_over(store.clone(), QUIET);
    let conn = gateway.on_connect("doc").await.unwrap();

    store.fail_writes.store(true, Ordering::SeqCst);
    gateway
        .on_message(&conn, SyncMessage::Change(content_from_lines(["lost?"])))
        .await;
    tokio::time::sleep(QUIET * 3).await;
    assert!(store.content_writes().is_empty());
    assert!(conn.session().is_dirty().await);
    assert_eq!(gateway.registry().stats().failed_writes, 1);

    store.fail_writes.store(false, Ordering::SeqCst);
    gateway
        .on_message(&conn, SyncMessage::Change(content_from_lines(["saved"])))
        .await;
    tokio::time::sleep(QUIET * 3).await;

    let writes = store.content_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, content_from_lines(["saved"]));
    assert!(!conn.session().is_dirty().await);
}

#[tokio::test]
async fn test_failed_write_retried_by_teardown() {
    let store = Arc::new(RecordingStore::with_doc("doc"));
    let gateway = gateway_over(store.clone(), QUIET);
    let conn = gateway.on_connect("doc").await.unwrap();

    store.fail_writes.store(true, Ordering::SeqCst);
    gateway
        .on_message(&conn, SyncMessage::Change(content_from_lines(["keep me"])))
        .await;
    tokio::time::sleep(QUIET * 3).await;
    store.fail_writes.store(false, Ordering::SeqCst);

    gateway.on_disconnect(conn).await;
    assert_eq!(
        store.inner.load("doc").unwrap().content,
        content_from_lines(["keep me"])
    );
}

#[tokio::test]
async fn test_reattach_after_teardown_loads_fresh() {
    let store = Arc::new(RecordingStore::with_doc("doc"));
    let gateway = gateway_over(store.clone(), Duration::from_secs(30));

    let conn = gateway.on_connect("doc").await.unwrap();
    gateway
        .on_message(&conn, SyncMessage::Change(content_from_lines(["draft"])))
        .await;
    gateway.on_message(&conn, SyncMessage::Rename("Draft".into())).await;
    gateway.on_disconnect(conn).await;

    assert_eq!(gateway.registry().session_count().await, 0);
    assert_eq!(store.loads(), 1);

    let mut again = gateway.on_connect("doc").await.unwrap();
    assert_eq!(store.loads(), 2);
    assert_eq!(
        again.take_snapshot(),
        Some(SyncMessage::Snapshot {
            name: "Draft".into(),
            content: content_from_lines(["draft"]),
        })
    );
}

#[tokio::test]
async fn test_attach_during_teardown_flush_sees_flushed_state() {
    let store = Arc::new(RecordingStore {
        write_delay: Some(Duration::from_millis(200)),
        ..RecordingStore::with_doc("doc")
    });
    let gateway = Arc::new(gateway_over(store.clone(), Duration::from_secs(30)));

    let a = gateway.on_connect("doc").await.unwrap();
    gateway
        .on_message(&a, SyncMessage::Change(content_from_lines(["from a"])))
        .await;

    let leaving = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.on_disconnect(a).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The slow flush still holds the slot; this attach has to wait it out.
    let mut b = gateway.on_connect("doc").await.unwrap();
    leaving.await.unwrap();

    assert_eq!(
        b.take_snapshot(),
        Some(SyncMessage::Snapshot {
            name: "Untitled".into(),
            content: content_from_lines(["from a"]),
        })
    );
    assert_eq!(store.loads(), 2, "second attach loads the flushed copy");
    assert_eq!(store.content_writes().len(), 1);

    let live = gateway.registry().get("doc").await.unwrap();
    assert!(Arc::ptr_eq(&live, b.session()));
    assert_eq!(live.member_count().await, 1);
    assert_eq!(gateway.registry().session_count().await, 1);
}

#[tokio::test]
async fn test_not_found_leaves_nothing_behind() {
    let store = Arc::new(RecordingStore::default());
    let gateway = gateway_over(store.clone(), QUIET);

    let err = gateway.on_connect("ghost").await.err().unwrap();
    assert_eq!(err, SessionError::NotFound("ghost".into()));
    assert_eq!(gateway.registry().session_count().await, 0);
    assert!(store.inner.is_empty(), "missing documents are never seeded");
}

#[tokio::test]
async fn test_rocks_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.create("doc", "Untitled").unwrap();
        let gateway = gateway_over(Arc::new(store), Duration::from_secs(30));

        let conn = gateway.on_connect("doc").await.unwrap();
        gateway
            .on_message(&conn, SyncMessage::Change(content_from_lines(["line one", "line two"])))
            .await;
        gateway.on_message(&conn, SyncMessage::Rename("Durable".into())).await;
        gateway.on_disconnect(conn).await;
    }
    // Let background persist tasks release their storage handles.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let doc = store.load("doc").unwrap();
    assert_eq!(doc.name, "Durable");
    assert_eq!(doc.content, content_from_lines(["line one", "line two"]));
}
