//! A persistent, size-capped `key -> CacheEntry` store, one file per entry in
//! a flat directory, fronted by an in-memory access-ordered header index.
//!
//! The index is authoritative for existence checks and eviction order; every
//! index mutation is paired with the corresponding file operation. Any read
//! fault (truncation, bad magic, filename collision, I/O error) demotes the
//! entry to "absent": the file is deleted and the index entry dropped, so the
//! two views never drift apart.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use lru::LruCache;
use tracing::{debug, warn};

pub use crate::entry::{epoch_millis, CacheEntry, CacheHeader};
use crate::filename::filename_for_key;

mod codec;
mod entry;
mod filename;

/// Faults raised while reading or writing an on-disk entry. All of them are
/// handled internally by treating the entry as absent; they surface only
/// through logs and the [`DiskCache::put`] result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The file ended in the middle of a field.
    #[error("cache entry is truncated")]
    UnexpectedEof,

    /// The file does not start with the entry sentinel.
    #[error("unrecognized cache entry magic: {0:#010x}")]
    BadMagic(u32),

    /// The entry on disk was stored under a different key: a filename
    /// collision between distinct keys.
    #[error("cache entry key does not match the requested key")]
    KeyMismatch,

    /// A length prefix larger than any legitimate field.
    #[error("cache entry field length {0} is implausible")]
    FieldTooLarge(u64),

    #[error("cache entry contains invalid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),
}

/// When pruning, evict down to this fraction of the capacity rather than to
/// the capacity itself, so that the very next insert does not prune again.
const HYSTERESIS_FACTOR: f64 = 0.9;

/// A disk-backed LRU cache.
///
/// All methods take `&mut self`; concurrent users are expected to wrap the
/// cache in a mutex, making every public operation exclusive. [`DiskCache::initialize`]
/// must complete before the first read or write.
#[derive(Debug)]
pub struct DiskCache {
    /// Directory holding one file per entry. Flat; filenames are opaque.
    root: PathBuf,
    /// Capacity in bytes. Entries are evicted oldest-access-first once the
    /// total would exceed this.
    max_size: u64,
    /// Access-ordered mirror of the on-disk headers.
    index: LruCache<String, CacheHeader>,
    /// Sum of file sizes tracked by the index.
    total_size: u64,
}

impl DiskCache {
    /// A cache rooted at `root`, holding at most `max_size` bytes. The
    /// directory is created lazily by [`DiskCache::initialize`].
    pub fn new(root: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            root: root.into(),
            max_size,
            index: LruCache::unbounded(),
            total_size: 0,
        }
    }

    /// A cache without a size bound; nothing is ever evicted.
    pub fn unbounded(root: impl Into<PathBuf>) -> Self {
        Self::new(root, u64::MAX)
    }

    /// Scan the cache directory and rebuild the index from file headers
    /// (bodies are not read). Files that cannot be parsed are deleted.
    /// Creates the directory if it does not exist.
    pub fn initialize(&mut self) -> io::Result<()> {
        self.index.clear();
        self.total_size = 0;

        if !self.root.is_dir() {
            fs::create_dir_all(&self.root)?;
            return Ok(());
        }

        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            if !dirent.file_type().map(|ty| ty.is_file()).unwrap_or(false) {
                continue;
            }
            let path = dirent.path();
            match Self::scan_file(&path) {
                Ok(header) => {
                    self.total_size += header.size;
                    self.index.put(header.key.clone(), header);
                }
                Err(err) => {
                    warn!("Dropping unreadable cache file {}: {err}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }

        debug!(
            entries = self.index.len(),
            total_size = self.total_size,
            "Cache index initialized from {}",
            self.root.display()
        );
        Ok(())
    }

    /// Look up an entry. A hit refreshes the key's recency. Any fault while
    /// reading the file removes the entry and reports a miss.
    pub fn get(&mut self, key: &str) -> Option<CacheEntry> {
        self.index.get(key)?;

        let path = self.path_for(key);
        match Self::read_entry(&path, key) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Removing broken cache entry for {key}: {err}");
                self.remove(key);
                None
            }
        }
    }

    /// Store an entry, evicting older entries first if the new file would
    /// push the cache over capacity. A failed write leaves neither a file
    /// nor an index entry behind.
    pub fn put(&mut self, key: &str, entry: &CacheEntry) -> Result<(), Error> {
        self.prune(codec::encoded_len(key, entry));

        let path = self.path_for(key);
        let size = match Self::write_entry(&path, key, entry) {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&path);
                return Err(err);
            }
        };
        let header = CacheHeader::new(key.to_owned(), size, entry);
        if let Some(previous) = self.index.put(key.to_owned(), header) {
            self.total_size -= previous.size;
        }
        self.total_size += size;
        debug!(key, size, total_size = self.total_size, "Stored cache entry");
        Ok(())
    }

    /// Expire an entry in place: drop its soft TTL, and with `full_expire`
    /// its hard TTL as well, so the next hit triggers a refresh or a
    /// revalidation.
    pub fn invalidate(&mut self, key: &str, full_expire: bool) {
        let Some(mut entry) = self.get(key) else {
            return;
        };
        entry.soft_ttl = 0;
        if full_expire {
            entry.ttl = 0;
        }
        if let Err(err) = self.put(key, &entry) {
            warn!("Failed to rewrite invalidated cache entry for {key}: {err}");
        }
    }

    /// Remove an entry's file and index record.
    pub fn remove(&mut self, key: &str) {
        if let Err(err) = fs::remove_file(self.path_for(key)) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to delete cache file for {key}: {err}");
            }
        }
        if let Some(header) = self.index.pop(key) {
            self.total_size -= header.size;
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        if let Ok(read_dir) = fs::read_dir(&self.root) {
            for dirent in read_dir.flatten() {
                let _ = fs::remove_file(dirent.path());
            }
        }
        self.index.clear();
        self.total_size = 0;
        debug!("Cache cleared");
    }

    /// Bytes currently tracked by the index.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether the key is indexed, without refreshing its recency.
    pub fn contains(&self, key: &str) -> bool {
        self.index.peek(key).is_some()
    }

    /// Evict oldest-access-first until `needed` more bytes fit. To avoid
    /// pruning on every subsequent insert, eviction overshoots down to
    /// `max_size * 0.9`.
    fn prune(&mut self, needed: u64) {
        if self.total_size.saturating_add(needed) < self.max_size {
            return;
        }

        let before = self.total_size;
        let mut pruned = 0usize;
        while let Some((key, header)) = self.index.pop_lru() {
            if let Err(err) = fs::remove_file(self.root.join(filename_for_key(&key))) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to delete cache file for {key} while pruning: {err}");
                }
            }
            self.total_size -= header.size;
            pruned += 1;

            if ((self.total_size + needed) as f64) < self.max_size as f64 * HYSTERESIS_FACTOR {
                break;
            }
        }
        debug!(
            pruned,
            freed = before - self.total_size,
            total_size = self.total_size,
            "Pruned cache"
        );
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(filename_for_key(key))
    }

    /// Read only the header of a file, for the initialization scan.
    fn scan_file(path: &Path) -> Result<CacheHeader, Error> {
        let size = fs::metadata(path)?.len();
        let file = fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut header = codec::read_header(&mut reader)?;
        header.size = size;
        Ok(header)
    }

    fn read_entry(path: &Path, key: &str) -> Result<CacheEntry, Error> {
        let file = fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        let header = codec::read_header(&mut reader)?;
        if header.key != key {
            return Err(Error::KeyMismatch);
        }
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(header.into_entry(data))
    }

    fn write_entry(path: &Path, key: &str, entry: &CacheEntry) -> Result<u64, Error> {
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer, key, entry)?;
        writer.write_all(&entry.data)?;
        writer.flush()?;
        Ok(fs::metadata(path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;
    use tempfile::tempdir;

    use super::*;

    fn entry_with_body(body: &[u8]) -> CacheEntry {
        let mut response_headers = FxHashMap::default();
        response_headers.insert("Content-Type".to_string(), "text/plain".to_string());
        CacheEntry {
            data: body.to_vec(),
            etag: Some("\"abc\"".to_string()),
            server_date: 1_700_000_000_000,
            last_modified: 1_690_000_000_000,
            ttl: 1_700_000_060_000,
            soft_ttl: 1_700_000_030_000,
            response_headers,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();

        let entry = entry_with_body(b"hello world");
        cache.put("GET:http://example.com/a", &entry).unwrap();

        let read = cache.get("GET:http://example.com/a").unwrap();
        assert_eq!(read, entry);
    }

    #[test]
    fn miss_on_unknown_key() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        assert_eq!(cache.get("GET:http://example.com/missing"), None);
    }

    #[test]
    fn index_survives_reinitialization() {
        let dir = tempdir().unwrap();
        let entry = entry_with_body(b"persisted");
        {
            let mut cache = DiskCache::unbounded(dir.path());
            cache.initialize().unwrap();
            cache.put("k", &entry).unwrap();
        }

        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").unwrap(), entry);
    }

    #[test]
    fn corrupt_file_is_deleted_on_get() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        cache.put("k", &entry_with_body(b"data")).unwrap();

        // Scribble over the file behind the cache's back.
        let path = dir.path().join(filename_for_key("k"));
        fs::write(&path, b"not a cache entry").unwrap();

        assert_eq!(cache.get("k"), None);
        assert!(!path.exists());
        assert!(!cache.contains("k"));
    }

    #[test]
    fn unreadable_file_is_deleted_on_initialize() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("0123456789abcdef0123456789abcdef"), b"junk").unwrap();

        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        assert!(cache.is_empty());
        assert!(!dir.path().join("0123456789abcdef0123456789abcdef").exists());
    }

    #[test]
    fn eviction_respects_cap_and_hysteresis() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path(), 1_000);
        cache.initialize().unwrap();

        // Bodies of 200 bytes; with header overhead each entry is somewhat
        // larger, so ten inserts force several evictions.
        for i in 0..10 {
            cache
                .put(&format!("key-{i}"), &entry_with_body(&[b'x'; 200]))
                .unwrap();
            assert!(
                cache.total_size() <= 1_000,
                "total {} exceeds cap after insert {i}",
                cache.total_size()
            );
        }

        // The hysteresis target held at the last prune: inserting one more
        // entry must not need another eviction pass.
        let len_before = cache.len();
        cache.put("key-extra", &entry_with_body(&[b'y'; 10])).unwrap();
        assert_eq!(cache.len(), len_before + 1);

        // Oldest keys are the evicted ones.
        assert!(!cache.contains("key-0"));
        assert!(cache.contains("key-9"));
    }

    #[test]
    fn get_protects_entry_from_eviction() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::new(dir.path(), 1_000);
        cache.initialize().unwrap();

        cache.put("old", &entry_with_body(&[b'a'; 200])).unwrap();
        cache.put("newer", &entry_with_body(&[b'b'; 200])).unwrap();

        // Touch "old" so "newer" becomes the eviction candidate.
        assert!(cache.get("old").is_some());

        // Large enough to force a prune of exactly one entry.
        cache.put("big", &entry_with_body(&[b'c'; 450])).unwrap();

        assert!(cache.contains("old"));
        assert!(!cache.contains("newer"));
        assert!(cache.contains("big"));
    }

    #[test]
    fn invalidate_flips_ttls() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        cache.put("k", &entry_with_body(b"body")).unwrap();

        cache.invalidate("k", false);
        let soft = cache.get("k").unwrap();
        assert_eq!(soft.soft_ttl, 0);
        assert_ne!(soft.ttl, 0);
        assert_eq!(soft.data, b"body");

        cache.invalidate("k", true);
        let full = cache.get("k").unwrap();
        assert_eq!(full.soft_ttl, 0);
        assert_eq!(full.ttl, 0);
    }

    #[test]
    fn remove_and_clear() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        cache.put("a", &entry_with_body(b"1")).unwrap();
        cache.put("b", &entry_with_body(b"2")).unwrap();

        cache.remove("a");
        assert_eq!(cache.get("a"), None);
        assert!(cache.get("b").is_some());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_size(), 0);
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn colliding_filename_reads_as_corrupt() {
        let dir = tempdir().unwrap();
        let mut cache = DiskCache::unbounded(dir.path());
        cache.initialize().unwrap();
        cache.put("real-key", &entry_with_body(b"data")).unwrap();

        // Simulate a filename collision: the index knows a key whose file
        // holds a different key's entry.
        cache.put("victim-key", &entry_with_body(b"temp")).unwrap();
        let victim = dir.path().join(filename_for_key("victim-key"));
        fs::copy(dir.path().join(filename_for_key("real-key")), &victim).unwrap();

        assert_eq!(cache.get("victim-key"), None);
        assert!(!victim.exists());
    }
}
