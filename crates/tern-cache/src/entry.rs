use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

/// Milliseconds since the Unix epoch, as used by all cache timestamps.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A cached HTTP response body together with the metadata needed to decide
/// whether it can be served as-is, must be refreshed in the background, or
/// must be revalidated before use.
///
/// All timestamps are absolute epoch milliseconds. `soft_ttl <= ttl` holds
/// for every entry produced by header parsing; an entry past its `soft_ttl`
/// but not its `ttl` is served immediately while a refresh is scheduled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// The response body.
    pub data: Vec<u8>,
    /// The `ETag` returned by the server, if any.
    pub etag: Option<String>,
    /// The server's `Date`, or zero if absent.
    pub server_date: i64,
    /// The server's `Last-Modified`, or zero if absent.
    pub last_modified: i64,
    /// Instant past which the entry must be revalidated before use.
    pub ttl: i64,
    /// Instant past which the entry is served but a refresh is triggered.
    pub soft_ttl: i64,
    /// The response headers the entry was stored with. Never absent, but
    /// possibly empty.
    pub response_headers: FxHashMap<String, String>,
}

impl CacheEntry {
    /// Whether the entry is past its hard TTL.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(epoch_millis())
    }

    /// Whether the entry is past its hard TTL at the given instant.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.ttl < now
    }

    /// Whether the entry is past its soft TTL.
    pub fn refresh_needed(&self) -> bool {
        self.refresh_needed_at(epoch_millis())
    }

    /// Whether the entry is past its soft TTL at the given instant.
    pub fn refresh_needed_at(&self, now: i64) -> bool {
        self.soft_ttl < now
    }
}

/// The on-disk metadata of a cache entry, mirrored into the in-memory index.
///
/// Everything in [`CacheEntry`] except the body, plus the entry's key and the
/// total length of its file on disk.
#[derive(Debug, Clone)]
pub struct CacheHeader {
    /// The cache key the entry was stored under.
    pub key: String,
    /// Total length of the entry's file, header and body included.
    pub size: u64,
    pub etag: Option<String>,
    pub server_date: i64,
    pub last_modified: i64,
    pub ttl: i64,
    pub soft_ttl: i64,
    pub response_headers: FxHashMap<String, String>,
}

impl CacheHeader {
    pub(crate) fn new(key: String, size: u64, entry: &CacheEntry) -> Self {
        Self {
            key,
            size,
            etag: entry.etag.clone(),
            server_date: entry.server_date,
            last_modified: entry.last_modified,
            ttl: entry.ttl,
            soft_ttl: entry.soft_ttl,
            response_headers: entry.response_headers.clone(),
        }
    }

    /// Reattach a body to the metadata, yielding the full entry.
    pub(crate) fn into_entry(self, data: Vec<u8>) -> CacheEntry {
        CacheEntry {
            data,
            etag: self.etag,
            server_date: self.server_date,
            last_modified: self.last_modified,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            response_headers: self.response_headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_predicates() {
        let entry = CacheEntry {
            soft_ttl: 1_000,
            ttl: 2_000,
            ..CacheEntry::default()
        };

        assert!(!entry.is_expired_at(500));
        assert!(!entry.refresh_needed_at(500));

        // Past the soft TTL but not the hard TTL: serve and refresh.
        assert!(!entry.is_expired_at(1_500));
        assert!(entry.refresh_needed_at(1_500));

        // Past both: revalidate before use.
        assert!(entry.is_expired_at(2_500));
        assert!(entry.refresh_needed_at(2_500));
    }
}
