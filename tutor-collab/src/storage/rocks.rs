//! RocksDB-backed room store.
//!
//! Column families:
//! - `snapshots` - full room state as an encoded `Update` (LZ4 compressed)
//! - `updates`   - applied updates since the last snapshot (LZ4 compressed,
//!   keyed by `room_id:seq`)
//! - `metadata`  - per-room bookkeeping (bincode)
//!
//! A room key maps to a 16-byte id via UUIDv5 so keys have a fixed-size
//! prefix for the `updates` prefix extractor.
//!
//! Reference: Kleppmann - DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

use crate::crdt::Update;
use crate::protocol::{decode_update, encode_update, RoomKey};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
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

/// Bookkeeping stored next to each room's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    /// String form of the room key.
    pub room_key: String,
    /// Sequence number the next logged update receives.
    pub next_seq: u64,
    /// Updates currently in the log.
    pub logged_updates: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl RoomMetadata {
    fn new(room: &RoomKey) -> Self {
        let now = now_secs();
        Self {
            room_key: room.to_string(),
            next_seq: 0,
            logged_updates: 0,
            snapshot_size: 0,
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
            .map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Stored bytes could not be decompressed or decoded.
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Stable 16-byte id for a room key.
pub fn room_id(room: &RoomKey) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, room.to_string().as_bytes())
}

/// Durable snapshots and update logs for rooms.
pub struct RoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RoomStore {
    /// Open the store, creating the database and column families if needed.
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

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Persist the full room state and drop the update log it supersedes.
    pub fn save_snapshot(&self, room: &RoomKey, snapshot: &Update) -> Result<RoomMetadata, StoreError> {
        let encoded = encode_update(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.save_raw_snapshot(room, &encoded)
    }

    /// Persist already-encoded snapshot bytes.
    pub fn save_raw_snapshot(&self, room: &RoomKey, encoded: &[u8]) -> Result<RoomMetadata, StoreError> {
        let id = room_id(room);
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_updates = self.cf(CF_UPDATES)?;

        let compressed = lz4_flex::compress_prepend_size(encoded);

        let mut meta = self.load_metadata(room)?.unwrap_or_else(|| RoomMetadata::new(room));
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.logged_updates = 0;
        meta.updated_at = now_secs();

        // snapshot, metadata and log truncation land atomically
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);
        for key in self.update_keys(id)? {
            batch.delete_cf(&cf_updates, &key);
        }
        self.db.write_opt(batch, &self.write_options())?;

        Ok(meta)
    }

    /// Load the last snapshot, `None` if the room was never snapshotted.
    pub fn load_snapshot(&self, room: &RoomKey) -> Result<Option<Update>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(&cf, room_id(room).as_bytes())? else {
            return Ok(None);
        };
        decode_stored(&compressed).map(Some)
    }

    // ─── Update log ───────────────────────────────────────────────────

    /// Append an applied update. Returns its sequence number.
    pub fn append_update(&self, room: &RoomKey, update: &Update) -> Result<u64, StoreError> {
        let id = room_id(room);
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = encode_update(update).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self.load_metadata(room)?.unwrap_or_else(|| RoomMetadata::new(room));
        let seq = meta.next_seq;
        meta.next_seq += 1;
        meta.logged_updates += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, Self::update_key(id, seq), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(seq)
    }

    /// Logged updates in sequence order.
    pub fn load_updates(&self, room: &RoomKey) -> Result<Vec<Update>, StoreError> {
        let id = room_id(room);
        let cf = self.cf(CF_UPDATES)?;
        let start = Self::update_key(id, 0);

        let mut updates = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != id.as_bytes() {
                break;
            }
            updates.push(decode_stored(&value)?);
        }
        Ok(updates)
    }

    /// Delete logged updates with sequence number `<= up_to`.
    pub fn compact_updates(&self, room: &RoomKey, up_to: u64) -> Result<u64, StoreError> {
        let id = room_id(room);
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let end = Self::update_key(id, up_to.saturating_add(1));

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for key in self.update_keys(id)? {
            if up_to < u64::MAX && key.as_slice() >= end.as_slice() {
                break;
            }
            batch.delete_cf(&cf_updates, &key);
            count += 1;
        }

        if count > 0 {
            if let Some(mut meta) = self.load_metadata(room)? {
                meta.logged_updates = meta.logged_updates.saturating_sub(count);
                batch.put_cf(&cf_meta, id.as_bytes(), &meta.encode()?);
            }
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub fn load_metadata(&self, room: &RoomKey) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, room_id(room).as_bytes())?
            .map(|bytes| RoomMetadata::decode(&bytes))
            .transpose()
    }

    pub fn room_exists(&self, room: &RoomKey) -> Result<bool, StoreError> {
        Ok(self.load_metadata(room)?.is_some())
    }

    /// Every room with persisted state.
    pub fn list_rooms(&self) -> Result<Vec<RoomKey>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta = RoomMetadata::decode(&value)?;
            match RoomKey::parse(&meta.room_key) {
                Ok(key) => rooms.push(key),
                Err(e) => log::warn!("Skipping stored room with bad key: {e}"),
            }
        }
        Ok(rooms)
    }

    /// Delete snapshot, log and metadata of a room.
    pub fn discard_room(&self, room: &RoomKey) -> Result<(), StoreError> {
        let id = room_id(room);
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_updates = self.cf(CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, id.as_bytes());
        batch.delete_cf(&cf_meta, id.as_bytes());
        for key in self.update_keys(id)? {
            batch.delete_cf(&cf_updates, &key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// `room_id (16 bytes) + seq (8 bytes big-endian)`.
    fn update_key(id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn update_keys(&self, id: Uuid) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = Self::update_key(id, 0);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != 24 || &key[..16] != id.as_bytes() {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

fn decode_stored(compressed: &[u8]) -> Result<Update, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Corrupt(format!("decompression: {e}")))?;
    decode_update(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
}
