//! # quire-sync: Real-time document sync for Quire
//!
//! Every connection editing a document shares one in-memory session. A
//! change replaces the whole content (last writer wins) and fans out to the
//! other connections; the durable copy is written once edits go quiet.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │  bincode or JSON    │ (transport) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │   Gateway   │
//!                                     └──────┬──────┘
//!                                            │
//!                                  ┌─────────┴─────────┐
//!                                  │ SessionRegistry   │
//!                                  │ (doc_id → Session)│
//!                                  └─────────┬─────────┘
//!                                            │
//!                        ┌───────────────────┼───────────────────┐
//!                        ▼                   ▼                   ▼
//!                 ┌────────────┐      ┌────────────┐      ┌────────────┐
//!                 │ broadcast  │      │ Debouncer  │      │  Storage   │
//!                 │ (fan-out)  │      │ (2s quiet) │ ───► │ RocksDB/mem│
//!                 └────────────┘      └────────────┘      └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire messages, bincode and JSON encodings
//! - [`storage`]: Storage trait with RocksDB and in-memory backends
//! - [`debounce`]: Cancel-and-reschedule timer
//! - [`session`]: Shared per-document state, fan-out, persistence
//! - [`registry`]: Single session per document, teardown on last leave
//! - [`gateway`]: Transport-agnostic connect/message/disconnect
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with a local mirror

pub mod protocol;
pub mod storage;
pub mod debounce;
pub mod stats;
pub mod session;
pub mod registry;
pub mod gateway;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    content_from_lines, DocumentContent, Line, MessageType, ProtocolError, SyncMessage, WireFormat,
};
pub use storage::{
    DocumentMetadata, DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError,
    StoredDocument,
};
pub use debounce::Debouncer;
pub use stats::SyncStats;
pub use session::{ConnectionId, Session, SessionConfig, SessionError};
pub use registry::SessionRegistry;
pub use gateway::{Connection, Gateway};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
