//! Two-tiered cache for attachment content, keyed by MD5 hex digest.
//!
//! Level 1 is an in-memory LRU under a byte budget with a short TTL; level 2
//! is a disk directory sharded by the first two hex characters of the key,
//! with TTL derived from file mtime and oldest-first eviction under its own
//! byte budget. Content below the disk threshold lives in memory and is
//! promoted back there on a disk hit.
//!
//! The cache is content-addressable: identical bytes always map to the same
//! key, deduplicating across storage paths. MD5 collisions are treated as
//! hits per the 128-bit hash assumption.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;
use tracing::debug;

/// Compute the lowercase hex MD5 digest of `content`.
pub fn compute_md5(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

// ----------------------------------------------------------------- memory tier

struct MemoryEntry {
    content: Vec<u8>,
    stored_at: Instant,
    /// LRU tick; larger is more recent.
    last_used: u64,
}

/// LRU in-memory cache with TTL and a total byte budget.
pub struct MemoryCache {
    max_bytes: usize,
    ttl: Duration,
    entries: HashMap<String, MemoryEntry>,
    current_bytes: usize,
    clock: u64,
}

impl MemoryCache {
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_bytes,
            ttl,
            entries: HashMap::new(),
            current_bytes: 0,
            clock: 0,
        }
    }

    /// Look up a key; an expired entry is removed and counts as a miss.
    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.stored_at.elapsed() > self.ttl);
        if expired {
            self.remove(key);
            return None;
        }
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        entry.last_used = clock;
        Some(entry.content.clone())
    }

    /// Store a value, evicting least-recently-used entries until it fits.
    /// A value larger than the whole budget is ignored.
    pub fn set(&mut self, key: &str, content: Vec<u8>) {
        if content.len() > self.max_bytes {
            return;
        }
        self.remove(key);
        while self.current_bytes + content.len() > self.max_bytes && !self.entries.is_empty() {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                self.remove(&oldest);
            }
        }
        self.clock += 1;
        self.current_bytes += content.len();
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                content,
                stored_at: Instant::now(),
                last_used: self.clock,
            },
        );
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_bytes -= entry.content.len();
        }
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.current_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }
}

// ------------------------------------------------------------------- disk tier

/// Persistent disk cache: files named by hash under a two-hex-char shard
/// directory, TTL from mtime, oldest-first eviction under a byte budget.
pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            ttl,
        }
    }

    pub async fn init(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let shard = if key.len() >= 2 { &key[..2] } else { "00" };
        self.dir.join(shard).join(key)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.file_path(key);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if file_age(&meta) > self.ttl {
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        tokio::fs::read(&path).await.ok()
    }

    /// Store a value, evicting oldest files first when over budget. A value
    /// larger than the whole budget is ignored.
    pub async fn set(&self, key: &str, content: &[u8]) -> std::io::Result<()> {
        if content.len() as u64 > self.max_bytes {
            return Ok(());
        }
        self.ensure_space(content.len() as u64).await?;
        let path = self.file_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await
    }

    async fn ensure_space(&self, needed: u64) -> std::io::Result<()> {
        let files = self.files_by_age().await?;
        let mut current: u64 = files.iter().map(|(_, size, _)| size).sum();
        for (path, size, _) in files {
            if current + needed <= self.max_bytes {
                break;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                current -= size;
            }
        }
        Ok(())
    }

    async fn files_by_age(&self) -> std::io::Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut files = Vec::new();
        let mut shards = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(files),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((entry.path(), meta.len(), mtime));
                }
            }
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);
        Ok(files)
    }

    /// Remove every file older than the TTL; returns how many were removed.
    pub async fn cleanup_expired(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for (path, _, mtime) in self.files_by_age().await? {
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            if age > self.ttl && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> std::io::Result<()> {
        for (path, _, _) in self.files_by_age().await? {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }
}

fn file_age(meta: &std::fs::Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .unwrap_or(Duration::ZERO)
}

// ----------------------------------------------------------------- tiered view

/// Configuration for [`TieredCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_max_bytes: usize,
    pub memory_ttl: Duration,
    /// Disk tier directory; `None` disables the disk tier.
    pub disk_dir: Option<PathBuf>,
    pub disk_max_bytes: u64,
    pub disk_ttl: Duration,
    /// Content at or above this size goes to disk instead of memory.
    pub disk_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_bytes: 50 * 1024 * 1024,
            memory_ttl: Duration::from_secs(300),
            disk_dir: None,
            disk_max_bytes: 500 * 1024 * 1024,
            disk_ttl: Duration::from_secs(3600),
            disk_threshold_bytes: 100 * 1024,
        }
    }
}

/// Two-tiered cache combining the memory and disk tiers.
pub struct TieredCache {
    memory: Mutex<MemoryCache>,
    disk: Option<DiskCache>,
    threshold: usize,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            memory: Mutex::new(MemoryCache::new(config.memory_max_bytes, config.memory_ttl)),
            disk: config
                .disk_dir
                .map(|dir| DiskCache::new(dir, config.disk_max_bytes, config.disk_ttl)),
            threshold: config.disk_threshold_bytes,
        }
    }

    /// Create the disk directory when the disk tier is enabled.
    pub async fn init(&self) -> std::io::Result<()> {
        if let Some(disk) = &self.disk {
            disk.init().await?;
        }
        Ok(())
    }

    /// Memory first, then disk; disk hits small enough for the memory tier
    /// are promoted.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(content) = self.memory.lock().await.get(key) {
            return Some(content);
        }
        let disk = self.disk.as_ref()?;
        let content = disk.get(key).await?;
        if content.len() < self.threshold {
            self.memory.lock().await.set(key, content.clone());
        }
        Some(content)
    }

    /// Small content goes to memory, larger content to disk.
    pub async fn set(&self, key: &str, content: &[u8]) {
        if content.len() < self.threshold {
            self.memory.lock().await.set(key, content.to_vec());
        } else if let Some(disk) = &self.disk {
            if let Err(e) = disk.set(key, content).await {
                debug!("disk cache write failed for {key}: {e}");
            }
        }
    }

    /// Remove expired entries from both tiers; returns (memory, disk) counts.
    pub async fn cleanup_expired(&self) -> (usize, usize) {
        let memory_removed = self.memory.lock().await.cleanup_expired();
        let disk_removed = match &self.disk {
            Some(disk) => disk.cleanup_expired().await.unwrap_or(0),
            None => 0,
        };
        (memory_removed, disk_removed)
    }

    pub async fn clear(&self) {
        self.memory.lock().await.clear();
        if let Some(disk) = &self.disk {
            let _ = disk.clear().await;
        }
    }
}
