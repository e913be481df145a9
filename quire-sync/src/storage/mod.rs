//! Durable storage for document names and content.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  load (attach)   ┌──────────────────┐
//! │ Session     │ ◄─────────────── │ DocumentStorage  │
//! │ (in-memory) │ ───────────────► │  MemoryStore     │
//! └─────────────┘  save_content    │  RocksStore      │
//!                  save_name       └──────────────────┘
//! ```
//!
//! Implementations are synchronous; sessions call them through
//! `tokio::task::spawn_blocking` so slow disks never stall a broadcast.

pub mod memory;
pub mod rocks;

use crate::protocol::DocumentContent;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// A document as it exists in durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub name: String,
    pub content: DocumentContent,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Load/save interface consumed by sessions.
pub trait DocumentStorage: Send + Sync + 'static {
    /// Load name and content. `StoreError::NotFound` if the document does not exist.
    fn load(&self, doc_id: &str) -> Result<StoredDocument, StoreError>;

    /// Replace the stored content of an existing document.
    fn save_content(&self, doc_id: &str, content: &DocumentContent) -> Result<(), StoreError>;

    /// Replace the stored name of an existing document.
    fn save_name(&self, doc_id: &str, name: &str) -> Result<(), StoreError>;

    /// Create an empty document, or reset the name of an existing one.
    fn create(&self, doc_id: &str, name: &str) -> Result<(), StoreError>;

    /// Delete a document. Returns whether it existed.
    fn delete(&self, doc_id: &str) -> Result<bool, StoreError>;

    fn list_documents(&self) -> Result<Vec<String>, StoreError>;
}
