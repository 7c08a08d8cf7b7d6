//! RocksDB-backed document storage.
//!
//! Column families:
//! - `checkpoints` - latest snapshot per document (bincode, LZ4 compressed)
//! - `operations`  - committed operation log, keyed by doc id + revision
//! - `metadata`    - per-document bookkeeping (bincode)
//!
//! Operation keys are `<len:2 BE><doc id bytes><revision:8 BE>` so a
//! document's log is one contiguous, revision-ordered range.
//!
//! Reference: Kleppmann, DDIA Chapter 3 (LSM Trees, SSTables)

use super::{decode_record, encode_record, DocumentStorage, StoreError};
use flowsync_core::{CommittedOperation, Value};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const CF_CHECKPOINTS: &str = "checkpoints";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CHECKPOINTS, CF_OPERATIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: true; a commit is acknowledged to
    /// clients only after it returns)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowsync_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Per-document bookkeeping stored alongside the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Latest committed revision
    pub revision: u64,
    /// Revision of the latest checkpoint
    pub checkpoint_revision: u64,
    /// Operations in the log
    pub operation_count: u64,
    /// Uncompressed checkpoint size in bytes
    pub snapshot_size: u64,
    /// Compressed checkpoint size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.to_string(),
            revision: 0,
            checkpoint_revision: 0,
            operation_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    revision: u64,
    snapshot: Value,
}

/// RocksDB-backed [`DocumentStorage`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CHECKPOINTS => {
                // Already LZ4-compressed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned per document
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load document metadata, if the document exists.
    pub fn load_metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// All document ids in the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Deserialization("Invalid document key".into()))?;
            doc_ids.push(id);
        }
        Ok(doc_ids)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Put the operation, the optional checkpoint and the updated
    /// metadata into one batch.
    fn write_commit(
        &self,
        doc_id: &str,
        op: Option<&CommittedOperation>,
        checkpoint: Option<(u64, &Value)>,
    ) -> Result<(), StoreError> {
        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        let mut batch = WriteBatch::default();

        if let Some(op) = op {
            batch.put_cf(self.cf(CF_OPERATIONS)?, operation_key(doc_id, op.revision), encode_record(op)?);
            meta.revision = meta.revision.max(op.revision);
            meta.operation_count += 1;
        }

        if let Some((revision, snapshot)) = checkpoint {
            let encoded = encode_record(&CheckpointRecord {
                revision,
                snapshot: snapshot.clone(),
            })?;
            let compressed = lz4_flex::compress_prepend_size(&encoded);
            meta.snapshot_size = encoded.len() as u64;
            meta.compressed_size = compressed.len() as u64;
            meta.checkpoint_revision = revision;
            meta.revision = meta.revision.max(revision);
            batch.put_cf(self.cf(CF_CHECKPOINTS)?, doc_id.as_bytes(), compressed);
        }

        meta.updated_at = unix_now();
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), encode_record(&meta)?);

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
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<(Value, u64)>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let Some(compressed) = self.db.get_cf(cf, doc_id.as_bytes())? else {
            return Ok(None);
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let record: CheckpointRecord = decode_record(&encoded)?;
        Ok(Some((record.snapshot, record.revision)))
    }

    fn load_operations(&self, doc_id: &str, since: u64) -> Result<Vec<CommittedOperation>, StoreError> {
        let Some(first) = since.checked_add(1) else {
            return Ok(Vec::new());
        };
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = operation_prefix(doc_id);
        let start = operation_key(doc_id, first);

        let mut operations = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            operations.push(decode_record(&value)?);
        }
        Ok(operations)
    }

    fn append_operation(&self, doc_id: &str, op: &CommittedOperation) -> Result<(), StoreError> {
        self.write_commit(doc_id, Some(op), None)
    }

    fn checkpoint(&self, doc_id: &str, revision: u64, snapshot: &Value) -> Result<(), StoreError> {
        self.write_commit(doc_id, None, Some((revision, snapshot)))
    }

    /// One atomic write batch: a crash never leaves a checkpoint without
    /// the operation that produced it.
    fn commit(&self, doc_id: &str, op: &CommittedOperation, checkpoint: Option<&Value>) -> Result<(), StoreError> {
        self.write_commit(doc_id, Some(op), checkpoint.map(|s| (op.revision, s)))
    }
}

fn operation_prefix(doc_id: &str) -> Vec<u8> {
    let bytes = doc_id.as_bytes();
    let mut prefix = Vec::with_capacity(2 + bytes.len());
    prefix.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    prefix.extend_from_slice(bytes);
    prefix
}

fn operation_key(doc_id: &str, revision: u64) -> Vec<u8> {
    let mut key = operation_prefix(doc_id);
    key.extend_from_slice(&revision.to_be_bytes());
    key
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
