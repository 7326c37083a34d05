//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: latest snapshot payload per room (LZ4 compressed)
//! - `metadata` : per-room bookkeeping (bincode: save count, sizes, timestamps)
//!
//! Keys are the UTF-8 room id. Every save writes both families in one
//! `WriteBatch`, so a metadata record never describes a payload that is not
//! on disk. RocksDB calls are blocking and run on tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use crate::persistence::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("diagram_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            // Snapshots are infrequent and must survive a crash
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room bookkeeping stored next to the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Number of successful saves
    pub version: u64,
    /// Uncompressed payload size in bytes
    pub payload_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = unix_now();
        Self {
            room_id: room_id.to_string(),
            version: 0,
            payload_size: 0,
            compressed_size: 0,
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
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Synchronous RocksDB handle shared by the async store.
struct SnapshotDb {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// Durable [`SnapshotStore`] on RocksDB. Cheap to clone.
#[derive(Clone)]
pub struct RocksSnapshotStore {
    inner: Arc<SnapshotDb>,
}

impl RocksSnapshotStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self { inner: Arc::new(SnapshotDb { db, config }) })
    }

    /// Write a payload and bump its metadata (blocking).
    pub fn put_snapshot(&self, room_id: &str, payload: &str) -> Result<RoomMetadata, StoreError> {
        self.inner.put_snapshot(room_id, payload)
    }

    /// Read a payload back (blocking).
    pub fn get_snapshot(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_snapshot(room_id)
    }

    pub fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        self.inner.load_metadata(room_id)
    }

    /// Every room with a persisted snapshot.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.inner.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            rooms.push(id);
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let cf_snap = self.inner.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.inner.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_snap, room_id.as_bytes());
        batch.delete_cf(cf_meta, room_id.as_bytes());
        self.inner.db.write(batch)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SnapshotDb) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Unavailable(format!("storage task failed: {e}")))?
    }
}

impl SnapshotDb {
    fn put_snapshot(&self, room_id: &str, payload: &str) -> Result<RoomMetadata, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(payload.as_bytes());

        let mut meta = self.load_metadata(room_id)?.unwrap_or_else(|| RoomMetadata::new(room_id));
        meta.version += 1;
        meta.payload_size = payload.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = room_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored snapshot v{} for room {room_id} ({} → {} bytes)",
            meta.version,
            meta.payload_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    fn get_snapshot(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, room_id.as_bytes())? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn load_snapshot(&self, room_id: &str) -> BoxFuture<'static, Result<Option<String>, StoreError>> {
        let store = self.clone();
        let room_id = room_id.to_string();
        Box::pin(async move { store.blocking(move |db| db.get_snapshot(&room_id)).await })
    }

    fn save_snapshot(&self, room_id: &str, payload: String) -> BoxFuture<'static, Result<(), StoreError>> {
        let store = self.clone();
        let room_id = room_id.to_string();
        Box::pin(async move {
            store
                .blocking(move |db| db.put_snapshot(&room_id, &payload).map(|_| ()))
                .await
        })
    }
}

fn cf_options(name: &str, config: &StoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_write_buffer_size(config.write_buffer_size);
    opts.set_max_write_buffer_number(2);

    match name {
        // Values are already LZ4 framed
        CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
        _ => opts.set_compression_type(DBCompressionType::Lz4),
    }
    opts.optimize_for_point_lookup(config.block_cache_size as u64);

    opts
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
