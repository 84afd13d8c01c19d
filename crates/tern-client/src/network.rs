//! The network dispatchers: a pool of workers driving requests through the
//! transport, with conditional revalidation, retry/backoff, redirect
//! handling, and cache write-back.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use url::Url;

use tern_cache::CacheEntry;

use crate::error::{Error, ErrorKind};
use crate::headers::format_date_millis;
use crate::panic_message;
use crate::queue::QueueCore;
use crate::request::TrackedRequest;
use crate::response::{header_value, NetworkResponse, Outcome};
use crate::transport::{HttpExchange, TransportError, TransportRequest};

/// Drain the network queue until it is closed.
pub(crate) fn run(core: &Arc<QueueCore>) {
    debug!("Network dispatcher starting");
    while let Some(ranked) = core.network_queue.take() {
        process(core, ranked.0);
    }
    debug!("Network dispatcher exiting");
}

fn process(core: &Arc<QueueCore>, request: Arc<TrackedRequest>) {
    if request.is_canceled() {
        request.finish("network-discard-cancelled");
        return;
    }

    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| execute(core, &request, start)))
        .unwrap_or_else(|payload| {
            // A panicking parser (or transport) becomes an ordinary error.
            let message = panic_message(&payload);
            warn!("Network dispatcher survived a panic: {message}");
            Err(ErrorKind::Internal { message }.into())
        });

    if let Err(error) = result {
        let error = request.map_error(error.with_network_time(start.elapsed()));
        core.delivery.post_error(request, error);
    }
}

/// Drive one request to a delivered response, a quiet not-modified finish,
/// or an error.
fn execute(core: &Arc<QueueCore>, request: &Arc<TrackedRequest>, start: Instant) -> Result<(), Error> {
    let response = perform(core, request, start)?;

    // A 304 for a request that already saw its cached body delivered has
    // nothing new to say; finish quietly.
    if response.not_modified && request.was_delivered() {
        request.clone().finish("not-modified");
        return Ok(());
    }

    let parsed = request.parse(&response)?;

    if request.should_cache() {
        if let Some(entry) = &parsed.cache_entry {
            if let Err(err) = core.cache.lock().put(request.cache_key(), entry) {
                warn!(
                    "Failed to write cache entry for {}: {err}",
                    request.cache_key()
                );
            }
        }
    }

    request.mark_delivered();
    core.delivery.post_response(
        request.clone(),
        Outcome::Success {
            value: parsed.value,
            intermediate: false,
        },
        None,
    );
    Ok(())
}

/// The attempt loop: perform exchanges until one is terminal, routing
/// retriable failures through the request's retry policy.
fn perform(
    core: &Arc<QueueCore>,
    request: &Arc<TrackedRequest>,
    start: Instant,
) -> Result<NetworkResponse, Error> {
    loop {
        let url = request.current_url();
        if let Err(source) = Url::parse(&url) {
            return Err(ErrorKind::BadUrl { url, source }.into());
        }

        let mut headers = request.headers();
        let cached = request.cache_entry();
        if let Some(entry) = &cached {
            if let Some(etag) = &entry.etag {
                headers.insert("If-None-Match".to_string(), etag.clone());
            }
            if entry.last_modified > 0 {
                headers.insert(
                    "If-Modified-Since".to_string(),
                    format_date_millis(entry.last_modified),
                );
            }
        }

        let body = request.transport_body();
        let content_type = request.body_content_type();
        let attempt = TransportRequest {
            method: request.resolved_method(),
            url: &url,
            headers: &headers,
            body: body.as_deref(),
            content_type: content_type.as_deref(),
            timeout: request.current_timeout(),
        };
        debug!(
            method = attempt.method,
            url = %url,
            attempt = request.retry_count() + 1,
            "Performing request"
        );

        match core.transport.perform(&attempt) {
            Ok(exchange) => match exchange.status {
                304 => return Ok(not_modified_response(cached, exchange, start)),
                200..=299 => {
                    return Ok(NetworkResponse {
                        status: exchange.status,
                        data: exchange.body,
                        headers: exchange.headers,
                        not_modified: false,
                        network_time: start.elapsed(),
                    });
                }
                301 | 302 => {
                    if let Some(location) = header_value(&exchange.headers, "Location") {
                        let target = resolve_location(&url, location);
                        debug!(from = %url, to = %target, "Redirected");
                        request.set_redirect_url(target);
                    } else {
                        warn!(
                            "Redirect (HTTP {}) without a Location header for {url}",
                            exchange.status
                        );
                    }
                    let response = response_from(exchange, start);
                    request.attempt_retry(ErrorKind::Redirect { response }.into())?;
                }
                401 | 403 => {
                    let response = response_from(exchange, start);
                    request.attempt_retry(ErrorKind::AuthFailure { response }.into())?;
                }
                _ => {
                    let response = response_from(exchange, start);
                    return Err(ErrorKind::Server { response }.into());
                }
            },
            Err(TransportError::Timeout) => {
                request.attempt_retry(ErrorKind::Timeout.into())?;
                debug!(url = %url, retries = request.retry_count(), "Retrying after timeout");
            }
            Err(TransportError::Connection(source)) => {
                return Err(ErrorKind::NoConnection(source).into());
            }
            Err(TransportError::Io(source)) => {
                return Err(ErrorKind::Network(source).into());
            }
        }
    }
}

/// Shape a 304 into a usable response: the stored body under the stored
/// headers, with the revalidation response's headers layered on top (new
/// values win). Without a stored entry the 304 passes through empty.
fn not_modified_response(
    cached: Option<CacheEntry>,
    exchange: HttpExchange,
    start: Instant,
) -> NetworkResponse {
    match cached {
        None => NetworkResponse {
            status: exchange.status,
            data: Vec::new(),
            headers: exchange.headers,
            not_modified: true,
            network_time: start.elapsed(),
        },
        Some(entry) => {
            let mut headers = entry.response_headers;
            headers.extend(exchange.headers);
            NetworkResponse {
                status: exchange.status,
                data: entry.data,
                headers,
                not_modified: true,
                network_time: start.elapsed(),
            }
        }
    }
}

fn response_from(exchange: HttpExchange, start: Instant) -> NetworkResponse {
    NetworkResponse {
        status: exchange.status,
        data: exchange.body,
        headers: exchange.headers,
        not_modified: false,
        network_time: start.elapsed(),
    }
}

/// Resolve a `Location` header against the URL that produced it; absolute
/// locations pass through, relative ones are joined. An unresolvable
/// location is kept verbatim and will surface as `BadUrl` on the next
/// attempt.
fn resolve_location(current: &str, location: &str) -> String {
    Url::parse(current)
        .ok()
        .and_then(|base| base.join(location).ok())
        .map_or_else(|| location.to_string(), |url| url.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rustc_hash::FxHashMap;

    use super::*;

    #[test]
    fn location_resolution() {
        assert_eq!(
            resolve_location("http://example.com/a", "/b"),
            "http://example.com/b"
        );
        assert_eq!(
            resolve_location("http://example.com/a", "http://other.example/x"),
            "http://other.example/x"
        );
    }

    #[test]
    fn not_modified_merge_prefers_new_headers() {
        let mut stored = FxHashMap::default();
        stored.insert("X-Kept".to_string(), "old".to_string());
        stored.insert("X-Replaced".to_string(), "old".to_string());
        let entry = CacheEntry {
            data: b"cached body".to_vec(),
            response_headers: stored,
            ..CacheEntry::default()
        };

        let mut fresh = FxHashMap::default();
        fresh.insert("X-Replaced".to_string(), "new".to_string());
        let exchange = HttpExchange {
            status: 304,
            headers: fresh,
            body: Vec::new(),
        };

        let response = not_modified_response(Some(entry), exchange, Instant::now());
        assert!(response.not_modified);
        assert_eq!(response.data, b"cached body");
        assert_eq!(response.header("X-Kept"), Some("old"));
        assert_eq!(response.header("X-Replaced"), Some("new"));
    }

    #[test]
    fn not_modified_without_a_stored_entry_is_empty() {
        let exchange = HttpExchange {
            status: 304,
            headers: FxHashMap::default(),
            body: Vec::new(),
        };
        let response = not_modified_response(None, exchange, Instant::now());
        assert!(response.not_modified);
        assert!(response.data.is_empty());
    }
}
