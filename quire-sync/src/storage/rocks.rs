//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: document content (bincode, LZ4 compressed), keyed by doc id
//! - `metadata`: name, sizes and timestamps (bincode), keyed by doc id
//!
//! A document exists iff its metadata row exists. Content and metadata are
//! always written together in one `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{DocumentStorage, StoreError, StoredDocument};
use crate::protocol::DocumentContent;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-document metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub name: String,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Number of content writes since creation
    pub content_writes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str, name: &str) -> Self {
        let now = now_secs();
        Self {
            doc_id: doc_id.to_string(),
            name: name.to_string(),
            content_size: 0,
            compressed_size: 0,
            content_writes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 compressed
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load a document's metadata row.
    pub fn load_metadata(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.to_string())),
        }
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentStorage for RocksStore {
    fn load(&self, doc_id: &str) -> Result<StoredDocument, StoreError> {
        let meta = self.load_metadata(doc_id)?;
        let cf = self.cf(CF_DOCUMENTS)?;

        // Created but never edited: no content row yet
        let content = match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                let (content, _): (DocumentContent, usize) =
                    bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                content
            }
            None => DocumentContent::new(),
        };

        Ok(StoredDocument {
            name: meta.name,
            content,
        })
    }

    fn save_content(&self, doc_id: &str, content: &DocumentContent) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata(doc_id)?;
        let raw = bincode::serde::encode_to_vec(content, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        meta.content_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.content_writes += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    fn save_name(&self, doc_id: &str, name: &str) -> Result<(), StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self.load_metadata(doc_id)?;
        meta.name = name.to_string();
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    fn create(&self, doc_id: &str, name: &str) -> Result<(), StoreError> {
        let cf_meta = self.cf(CF_METADATA)?;

        let meta = match self.load_metadata(doc_id) {
            Ok(mut existing) => {
                existing.name = name.to_string();
                existing.updated_at = now_secs();
                existing
            }
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc_id, name),
            Err(e) => return Err(e),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    fn delete(&self, doc_id: &str) -> Result<bool, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let existed = self.db.get_cf(&cf_meta, doc_id.as_bytes())?.is_some();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
        self.write(batch)?;

        Ok(existed)
    }

    fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            doc_ids.push(id);
        }

        Ok(doc_ids)
    }
}
