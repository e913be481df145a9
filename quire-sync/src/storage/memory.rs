//! In-process document store for tests and ephemeral servers.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{DocumentStorage, StoreError, StoredDocument};
use crate::protocol::DocumentContent;

/// HashMap-backed store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, StoredDocument>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a document.
    pub fn insert(
        &self,
        doc_id: impl Into<String>,
        name: impl Into<String>,
        content: DocumentContent,
    ) -> Result<(), StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.insert(
            doc_id.into(),
            StoredDocument {
                name: name.into(),
                content,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStorage for MemoryStore {
    fn load(&self, doc_id: &str) -> Result<StoredDocument, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        docs.get(doc_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))
    }

    fn save_content(&self, doc_id: &str, content: &DocumentContent) -> Result<(), StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        doc.content = content.clone();
        Ok(())
    }

    fn save_name(&self, doc_id: &str, name: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        doc.name = name.to_string();
        Ok(())
    }

    fn create(&self, doc_id: &str, name: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.entry(doc_id.to_string())
            .and_modify(|doc| doc.name = name.to_string())
            .or_insert_with(|| StoredDocument {
                name: name.to_string(),
                content: DocumentContent::new(),
            });
        Ok(())
    }

    fn delete(&self, doc_id: &str) -> Result<bool, StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        Ok(docs.remove(doc_id).is_some())
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut ids: Vec<String> = docs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
