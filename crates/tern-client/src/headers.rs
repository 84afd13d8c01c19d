//! Derives cache metadata from response headers.

use std::time::{Duration, UNIX_EPOCH};

use tern_cache::{epoch_millis, CacheEntry};

use crate::response::NetworkResponse;

/// Build the cache entry a response should be stored as, honoring `Date`,
/// `Cache-Control`, `Expires`, `Last-Modified`, and `ETag`.
///
/// Returns `None` for uncacheable responses (`no-cache` / `no-store`). The
/// soft TTL comes from `max-age`; the hard TTL additionally extends over
/// `stale-while-revalidate`, unless the server demanded `must-revalidate`.
/// Without any `Cache-Control`, the `Expires`/`Date` pair is used and the
/// two TTLs coincide.
pub fn entry_from_response(response: &NetworkResponse) -> Option<CacheEntry> {
    let now = epoch_millis();

    let server_date = response.header("Date").map_or(0, parse_date_millis);

    let mut has_cache_control = false;
    let mut max_age: i64 = 0;
    let mut stale_while_revalidate: i64 = 0;
    let mut must_revalidate = false;
    if let Some(value) = response.header("Cache-Control") {
        has_cache_control = true;
        for token in value.split(',').map(str::trim) {
            if token == "no-cache" || token == "no-store" {
                return None;
            } else if let Some(seconds) = token.strip_prefix("max-age=") {
                max_age = seconds.parse().unwrap_or(0);
            } else if let Some(seconds) = token.strip_prefix("stale-while-revalidate=") {
                stale_while_revalidate = seconds.parse().unwrap_or(0);
            } else if token == "must-revalidate" || token == "proxy-revalidate" {
                must_revalidate = true;
            }
        }
    }

    let server_expires = response.header("Expires").map_or(0, parse_date_millis);
    let last_modified = response.header("Last-Modified").map_or(0, parse_date_millis);
    let etag = response.header("ETag").map(str::to_owned);

    let (soft_ttl, ttl) = if has_cache_control {
        let soft = now + max_age.saturating_mul(1_000);
        let hard = if must_revalidate {
            soft
        } else {
            soft + stale_while_revalidate.saturating_mul(1_000)
        };
        (soft, hard)
    } else if server_date > 0 && server_expires >= server_date {
        // No cache directives: fall back to the freshness window the server
        // implied, with no soft slack.
        let soft = now + (server_expires - server_date);
        (soft, soft)
    } else {
        (0, 0)
    };

    Some(CacheEntry {
        data: response.data.clone(),
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers: response.headers.clone(),
    })
}

/// RFC 1123 date to epoch milliseconds; zero on anything unparseable.
fn parse_date_millis(value: &str) -> i64 {
    httpdate::parse_http_date(value)
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(0))
}

/// Epoch milliseconds to an RFC 1123 date, as `If-Modified-Since` wants it.
pub(crate) fn format_date_millis(millis: i64) -> String {
    let millis = u64::try_from(millis).unwrap_or(0);
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_millis(millis))
}
