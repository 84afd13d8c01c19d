use std::any::Any;
use std::time::Duration;

use rustc_hash::FxHashMap;

use tern_cache::CacheEntry;

use crate::error::Error;

/// A raw HTTP response as handed to a request's parser — either straight off
/// the wire, or synthesized from a cache entry.
#[derive(Debug, Clone, Default)]
pub struct NetworkResponse {
    pub status: u16,
    pub data: Vec<u8>,
    pub headers: FxHashMap<String, String>,
    /// True when the server answered 304 and `data` came from the cache.
    pub not_modified: bool,
    /// Wall-clock duration of the exchange, retries included. Zero for
    /// cache-synthesized responses.
    pub network_time: Duration,
}

impl NetworkResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// A response that pretends a cached entry just arrived over the wire.
    pub(crate) fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: 200,
            data: entry.data.clone(),
            headers: entry.response_headers.clone(),
            not_modified: false,
            network_time: Duration::ZERO,
        }
    }
}

/// Case-insensitive lookup in a header map.
pub(crate) fn header_value<'a>(headers: &'a FxHashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// What a request's parser produced: the typed value, plus the cache entry
/// derived from the response if the response was cacheable.
pub struct Parsed<T> {
    pub value: T,
    pub cache_entry: Option<CacheEntry>,
}

impl<T> Parsed<T> {
    /// A parsed value with no cache metadata; the response will not be stored.
    pub fn new(value: T) -> Self {
        Self {
            value,
            cache_entry: None,
        }
    }

    pub fn with_cache_entry(value: T, cache_entry: Option<CacheEntry>) -> Self {
        Self { value, cache_entry }
    }
}

/// [`Parsed`] with the value's type erased, as it travels to the delivery
/// stage.
pub(crate) struct ErasedParsed {
    pub(crate) value: Box<dyn Any + Send>,
    pub(crate) cache_entry: Option<CacheEntry>,
}

/// What gets posted to the delivery executor for one request.
pub(crate) enum Outcome {
    Success {
        value: Box<dyn Any + Send>,
        /// A further response will follow; do not finish the request yet.
        intermediate: bool,
    },
    Failure(Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut response = NetworkResponse::default();
        response
            .headers
            .insert("Content-Type".to_string(), "text/plain".to_string());
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(response.header("content-length"), None);
    }
}
