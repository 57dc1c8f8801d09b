//! Chunk storage backends.
//!
//! Provides the [`ChunkStore`] trait and three implementations:
//! - [`MemoryChunkStore`]: in-memory storage using a HashMap
//! - [`FileSystemChunkStore`]: one file per chunk under a fan-out directory tree
//! - [`CachedChunkStore`]: LRU read cache in front of another store
//!
//! Chunks are immutable and addressed by their content, so `put` is idempotent
//! and concurrent writers of the same bytes need no coordination. A missing
//! chunk is `Ok(None)`; only backend faults are errors.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hash::{Chunk, Ref};
use crate::stats::Stats;

/// Content-addressed blob storage.
pub trait ChunkStore: Send + Sync {
    /// Fetch a chunk, `None` if it is not stored.
    fn get(&self, hash: &Ref) -> Result<Option<Chunk>>;

    /// Store a chunk. Storing a chunk that is already present is a no-op.
    fn put_chunk(&self, chunk: &Chunk) -> Result<()>;

    fn has(&self, hash: &Ref) -> Result<bool>;

    /// Remove a chunk. Returns true if it was present.
    ///
    /// Only garbage collection deletes; the data model never does.
    fn delete(&self, hash: &Ref) -> Result<bool>;

    /// All refs currently stored.
    fn list(&self) -> Result<Vec<Ref>>;

    fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Store raw bytes and return their ref.
    fn put(&self, data: &[u8]) -> Result<Ref> {
        let chunk = Chunk::new(data.to_vec());
        self.put_chunk(&chunk)?;
        Ok(chunk.hash())
    }

    fn put_many(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            self.put_chunk(chunk)?;
        }
        Ok(())
    }

    /// Fetch several chunks. Missing refs are absent from the result.
    fn get_many(&self, hashes: &[Ref]) -> Result<HashMap<Ref, Chunk>> {
        let mut found = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(chunk) = self.get(hash)? {
                found.insert(*hash, chunk);
            }
        }
        Ok(found)
    }

    /// Fetch a chunk the caller knows must exist.
    fn get_required(&self, hash: &Ref) -> Result<Chunk> {
        self.get(hash)?.ok_or(Error::NotFound(*hash))
    }
}

impl<S: ChunkStore + ?Sized> ChunkStore for Arc<S> {
    fn get(&self, hash: &Ref) -> Result<Option<Chunk>> {
        (**self).get(hash)
    }

    fn put_chunk(&self, chunk: &Chunk) -> Result<()> {
        (**self).put_chunk(chunk)
    }

    fn has(&self, hash: &Ref) -> Result<bool> {
        (**self).has(hash)
    }

    fn delete(&self, hash: &Ref) -> Result<bool> {
        (**self).delete(hash)
    }

    fn list(&self) -> Result<Vec<Ref>> {
        (**self).list()
    }

    fn count(&self) -> Result<usize> {
        (**self).count()
    }
}

/// In-memory chunk storage using a HashMap.
#[derive(Debug, Clone, Default)]
pub struct MemoryChunkStore {
    chunks: Arc<Mutex<HashMap<Ref, Chunk>>>,
    stats: Arc<Mutex<Stats>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.stats.lock()?.clone())
    }
}

impl ChunkStore for MemoryChunkStore {
    fn get(&self, hash: &Ref) -> Result<Option<Chunk>> {
        let chunks = self.chunks.lock()?;
        Ok(chunks.get(hash).cloned())
    }

    fn put_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut chunks = self.chunks.lock()?;
        if !chunks.contains_key(&chunk.hash()) {
            trace!(hash = %chunk.hash().short(), len = chunk.len(), "put chunk");
            self.stats.lock()?.record_chunk(chunk.data());
            chunks.insert(chunk.hash(), chunk.clone());
        }
        Ok(())
    }

    fn has(&self, hash: &Ref) -> Result<bool> {
        Ok(self.chunks.lock()?.contains_key(hash))
    }

    fn delete(&self, hash: &Ref) -> Result<bool> {
        Ok(self.chunks.lock()?.remove(hash).is_some())
    }

    fn list(&self) -> Result<Vec<Ref>> {
        Ok(self.chunks.lock()?.keys().copied().collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.chunks.lock()?.len())
    }
}

/// File system chunk storage, one file per chunk.
///
/// Chunks live at `<base>/<first two hex chars>/<full hex>`. Writes go through a
/// temporary file in the same directory followed by a rename, so a reader never
/// observes a partially written chunk.
pub struct FileSystemChunkStore {
    base_path: PathBuf,
    stats: Arc<Mutex<Stats>>,
}

impl FileSystemChunkStore {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        Ok(FileSystemChunkStore {
            base_path,
            stats: Arc::new(Mutex::new(Stats::new())),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn chunk_dir(&self, hash: &Ref) -> PathBuf {
        let hash_str = hash.to_hex();
        self.base_path.join(&hash_str[..2])
    }

    fn chunk_path(&self, hash: &Ref) -> PathBuf {
        self.chunk_dir(hash).join(hash.to_hex())
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.stats.lock()?.clone())
    }
}

impl ChunkStore for FileSystemChunkStore {
    fn get(&self, hash: &Ref) -> Result<Option<Chunk>> {
        let path = self.chunk_path(hash);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match Chunk::from_stored(*hash, data) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt chunk on disk");
                Err(err)
            }
        }
    }

    fn put_chunk(&self, chunk: &Chunk) -> Result<()> {
        let path = self.chunk_path(&chunk.hash());
        if path.exists() {
            return Ok(());
        }

        let dir = self.chunk_dir(&chunk.hash());
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(chunk.data())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|err| Error::from(err.error))?;

        trace!(hash = %chunk.hash().short(), len = chunk.len(), "wrote chunk file");
        self.stats.lock()?.record_chunk(chunk.data());
        Ok(())
    }

    fn has(&self, hash: &Ref) -> Result<bool> {
        Ok(self.chunk_path(hash).is_file())
    }

    fn delete(&self, hash: &Ref) -> Result<bool> {
        match fs::remove_file(self.chunk_path(hash)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<Ref>> {
        let mut refs = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let subdir = entry?.path();
            if !subdir.is_dir() {
                continue;
            }
            for subentry in fs::read_dir(&subdir)? {
                let file_path = subentry?.path();
                // Temp files left by an interrupted write do not parse as refs.
                let parsed = file_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.parse::<Ref>().ok());
                if let Some(hash) = parsed {
                    refs.push(hash);
                }
            }
        }
        Ok(refs)
    }
}

/// LRU read cache in front of another chunk store.
pub struct CachedChunkStore<S: ChunkStore> {
    inner: S,
    cache_size: usize,
    cache: Mutex<LruCache>,
}

impl<S: ChunkStore> CachedChunkStore<S> {
    pub fn new(inner: S, cache_size: usize) -> Self {
        CachedChunkStore {
            inner,
            cache_size,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        let cache = self.cache.lock()?;
        let total_requests = cache.hits + cache.misses;
        let hit_rate = if total_requests > 0 {
            (cache.hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        Ok(CacheStats {
            cache_size: cache.items.len(),
            max_cache_size: self.cache_size,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            hit_rate,
        })
    }
}

impl<S: ChunkStore> ChunkStore for CachedChunkStore<S> {
    fn get(&self, hash: &Ref) -> Result<Option<Chunk>> {
        if let Some(chunk) = self.cache.lock()?.get(hash) {
            return Ok(Some(chunk));
        }

        let chunk = self.inner.get(hash)?;
        let mut cache = self.cache.lock()?;
        cache.misses += 1;
        if let Some(chunk) = &chunk {
            cache.put(chunk.clone());
        }
        Ok(chunk)
    }

    fn put_chunk(&self, chunk: &Chunk) -> Result<()> {
        if self.cache.lock()?.contains(&chunk.hash()) {
            return Ok(());
        }
        self.inner.put_chunk(chunk)?;
        self.cache.lock()?.put(chunk.clone());
        Ok(())
    }

    fn has(&self, hash: &Ref) -> Result<bool> {
        if self.cache.lock()?.contains(hash) {
            return Ok(true);
        }
        self.inner.has(hash)
    }

    fn delete(&self, hash: &Ref) -> Result<bool> {
        self.cache.lock()?.remove(hash);
        self.inner.delete(hash)
    }

    fn list(&self) -> Result<Vec<Ref>> {
        self.inner.list()
    }

    fn count(&self) -> Result<usize> {
        self.inner.count()
    }
}

/// Timestamp-ordered LRU; eviction scans for the oldest entry.
struct LruCache {
    items: HashMap<Ref, (Chunk, u64)>,
    next_timestamp: u64,
    max_size: usize,
    hits: usize,
    misses: usize,
    evictions: usize,
}

impl LruCache {
    fn new(max_size: usize) -> Self {
        LruCache {
            items: HashMap::new(),
            next_timestamp: 0,
            max_size,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let timestamp = self.next_timestamp;
        self.next_timestamp += 1;
        timestamp
    }

    fn contains(&self, key: &Ref) -> bool {
        self.items.contains_key(key)
    }

    fn get(&mut self, key: &Ref) -> Option<Chunk> {
        let timestamp = self.tick();
        let (chunk, last_used) = self.items.get_mut(key)?;
        *last_used = timestamp;
        self.hits += 1;
        Some(chunk.clone())
    }

    fn put(&mut self, chunk: Chunk) {
        if self.max_size == 0 {
            return;
        }
        let timestamp = self.tick();
        if !self.items.contains_key(&chunk.hash()) && self.items.len() >= self.max_size {
            let oldest = self
                .items
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                self.items.remove(&oldest);
                self.evictions += 1;
            }
        }
        self.items.insert(chunk.hash(), (chunk, timestamp));
    }

    fn remove(&mut self, key: &Ref) {
        self.items.remove(key);
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub cache_size: usize,
    pub max_cache_size: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_evictions: usize,
    pub hit_rate: f64,
}

/// Create a chunk store from a specification string.
///
/// * `:memory:` - in-memory storage
/// * `file:///path/to/dir` - filesystem storage
/// * `cached-file:///path/to/dir` - filesystem storage behind an LRU cache
pub fn create_store_from_spec(spec: &str, cache_size: usize) -> Result<Arc<dyn ChunkStore>> {
    debug!(spec, cache_size, "opening chunk store");
    if spec == ":memory:" {
        Ok(Arc::new(MemoryChunkStore::new()))
    } else if let Some(path) = spec.strip_prefix("cached-file://") {
        Ok(Arc::new(CachedChunkStore::new(
            FileSystemChunkStore::new(path)?,
            cache_size,
        )))
    } else if let Some(path) = spec.strip_prefix("file://") {
        Ok(Arc::new(FileSystemChunkStore::new(path)?))
    } else {
        Err(Error::Config(format!("invalid store spec: {}", spec)))
    }
}
