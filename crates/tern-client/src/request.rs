use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use sha1::{Digest, Sha1};

use tern_cache::{epoch_millis, CacheEntry};

use crate::error::{Error, ErrorKind};
use crate::headers::entry_from_response;
use crate::queue::QueueCore;
use crate::response::{ErasedParsed, NetworkResponse, Parsed};
use crate::retry::{RetryPolicy, RetryState};

/// HTTP methods understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Trace,
    Patch,
    /// Legacy wildcard: resolves to POST iff a legacy post body is supplied,
    /// GET otherwise.
    GetOrPost,
}

impl Method {
    /// The name used in cache keys and request identifiers. The transport
    /// verb is resolved separately, since `GetOrPost` depends on the body.
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::GetOrPost => "GET_OR_POST",
        }
    }
}

/// Scheduling priority. Dispatch order is priority-major (descending), then
/// admission order within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Immediate,
}

/// A typed request: what to fetch, how to schedule it, how to parse the
/// response, and where to deliver the outcome.
///
/// Implementations describe an immutable request; all mutable lifecycle
/// state (sequence number, cancellation, redirects, backoff) is owned by the
/// queue the request is handed to. `on_response` may be invoked twice for a
/// single request: once with a cached body served while a refresh is in
/// flight, and once with the refreshed result.
pub trait Request: Send + Sync + 'static {
    type Output: Send + 'static;

    fn method(&self) -> Method {
        Method::Get
    }

    fn url(&self) -> &str;

    /// Extra request headers.
    fn headers(&self) -> FxHashMap<String, String> {
        FxHashMap::default()
    }

    /// The request body, for methods that carry one.
    fn body(&self) -> Option<Vec<u8>> {
        None
    }

    fn body_content_type(&self) -> String {
        "application/x-www-form-urlencoded; charset=UTF-8".to_string()
    }

    /// The body consulted by [`Method::GetOrPost`] resolution.
    fn legacy_post_body(&self) -> Option<Vec<u8>> {
        None
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Key identifying the cacheable resource this request addresses.
    fn cache_key(&self) -> String {
        format!("{}:{}", self.method().name(), self.url())
    }

    /// Whether responses may be served from and written to the cache.
    fn should_cache(&self) -> bool {
        true
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Tag for batch cancellation.
    fn tag(&self) -> Option<&str> {
        None
    }

    /// Turn a raw response into the typed output, and optionally the cache
    /// entry to store it under.
    fn parse_network_response(&self, response: &NetworkResponse) -> Result<Parsed<Self::Output>, Error>;

    /// Hook to rewrite a network failure before it reaches the error
    /// listener.
    fn map_network_error(&self, error: Error) -> Error {
        error
    }

    fn on_response(&self, value: Self::Output);

    fn on_error(&self, error: Error);
}

/// Object-safe facade over [`Request`], so the queue can hold heterogeneous
/// requests. Parsed values cross the boundary as `Box<dyn Any>` and are
/// downcast back at delivery.
pub(crate) trait ErasedRequest: Send + Sync {
    fn method(&self) -> Method;
    fn url(&self) -> &str;
    fn headers(&self) -> FxHashMap<String, String>;
    fn body(&self) -> Option<Vec<u8>>;
    fn body_content_type(&self) -> String;
    fn legacy_post_body(&self) -> Option<Vec<u8>>;
    fn priority(&self) -> Priority;
    fn cache_key(&self) -> String;
    fn should_cache(&self) -> bool;
    fn retry_policy(&self) -> RetryPolicy;
    fn tag(&self) -> Option<&str>;
    fn parse(&self, response: &NetworkResponse) -> Result<ErasedParsed, Error>;
    fn map_error(&self, error: Error) -> Error;
    fn deliver(&self, value: Box<dyn Any + Send>);
    fn deliver_error(&self, error: Error);
}

/// Adapter implementing [`ErasedRequest`] for any [`Request`].
pub(crate) struct TypedRequest<R>(pub(crate) R);

impl<R: Request> ErasedRequest for TypedRequest<R> {
    fn method(&self) -> Method {
        self.0.method()
    }

    fn url(&self) -> &str {
        self.0.url()
    }

    fn headers(&self) -> FxHashMap<String, String> {
        self.0.headers()
    }

    fn body(&self) -> Option<Vec<u8>> {
        self.0.body()
    }

    fn body_content_type(&self) -> String {
        self.0.body_content_type()
    }

    fn legacy_post_body(&self) -> Option<Vec<u8>> {
        self.0.legacy_post_body()
    }

    fn priority(&self) -> Priority {
        self.0.priority()
    }

    fn cache_key(&self) -> String {
        self.0.cache_key()
    }

    fn should_cache(&self) -> bool {
        self.0.should_cache()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.0.retry_policy()
    }

    fn tag(&self) -> Option<&str> {
        self.0.tag()
    }

    fn parse(&self, response: &NetworkResponse) -> Result<ErasedParsed, Error> {
        let parsed = self.0.parse_network_response(response)?;
        Ok(ErasedParsed {
            value: Box::new(parsed.value),
            cache_entry: parsed.cache_entry,
        })
    }

    fn map_error(&self, error: Error) -> Error {
        self.0.map_network_error(error)
    }

    fn deliver(&self, value: Box<dyn Any + Send>) {
        if let Ok(value) = value.downcast::<R::Output>() {
            self.0.on_response(*value);
        }
    }

    fn deliver_error(&self, error: Error) {
        self.0.on_error(error);
    }
}

/// Feeds the per-process counter mixed into request identifiers.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A request admitted to a queue: the user's immutable request plus the
/// mutable lifecycle state the pipeline threads through the stages.
///
/// The flags are plain atomics written without locks; readers tolerate stale
/// values. The worst case is one extra delivery task, which re-checks
/// cancellation before invoking any listener.
pub(crate) struct TrackedRequest {
    /// Dropped at finish, releasing the listeners it closes over.
    handler: Mutex<Option<Box<dyn ErasedRequest>>>,
    identifier: String,
    method: Method,
    origin_url: String,
    cache_key: String,
    priority: Priority,
    should_cache: bool,
    tag: Option<String>,
    sequence: OnceLock<u64>,
    queue: OnceLock<Weak<QueueCore>>,
    canceled: AtomicBool,
    delivered: AtomicBool,
    finished: AtomicBool,
    /// Supersedes `origin_url` once a 3xx names a new location.
    redirect_url: Mutex<Option<String>>,
    /// Stale-but-usable entry attached by the cache stage for revalidation.
    cache_entry: Mutex<Option<CacheEntry>>,
    retry: Mutex<RetryState>,
}

impl TrackedRequest {
    pub(crate) fn new(handler: Box<dyn ErasedRequest>) -> Self {
        let method = handler.method();
        let origin_url = handler.url().to_owned();
        let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let identifier = identifier_for(method, &origin_url, counter);
        let retry = RetryState::new(handler.retry_policy());
        Self {
            identifier,
            method,
            cache_key: handler.cache_key(),
            priority: handler.priority(),
            should_cache: handler.should_cache(),
            tag: handler.tag().map(str::to_owned),
            origin_url,
            handler: Mutex::new(Some(handler)),
            sequence: OnceLock::new(),
            queue: OnceLock::new(),
            canceled: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            redirect_url: Mutex::new(None),
            cache_entry: Mutex::new(None),
            retry: Mutex::new(retry),
        }
    }

    pub(crate) fn bind(&self, queue: Weak<QueueCore>) {
        let _ = self.queue.set(queue);
    }

    pub(crate) fn assign_sequence(&self, sequence: u64) {
        let _ = self.sequence.set(sequence);
    }

    /// The admission sequence number. Read-once by contract: dispatch before
    /// admission is a bug, so an unassigned read panics.
    pub(crate) fn sequence(&self) -> u64 {
        *self
            .sequence
            .get()
            .expect("request sequence read before the queue assigned it")
    }

    pub(crate) fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn method(&self) -> Method {
        self.method
    }

    pub(crate) fn origin_url(&self) -> &str {
        &self.origin_url
    }

    pub(crate) fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub(crate) fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The URL the next attempt must hit: the redirect target if one was
    /// observed, the original URL otherwise.
    pub(crate) fn current_url(&self) -> String {
        self.redirect_url
            .lock()
            .clone()
            .unwrap_or_else(|| self.origin_url.clone())
    }

    pub(crate) fn set_redirect_url(&self, url: String) {
        *self.redirect_url.lock() = Some(url);
    }

    pub(crate) fn cache_entry(&self) -> Option<CacheEntry> {
        self.cache_entry.lock().clone()
    }

    pub(crate) fn set_cache_entry(&self, entry: CacheEntry) {
        *self.cache_entry.lock() = Some(entry);
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_delivered(&self) {
        self.delivered.store(true, Ordering::Relaxed);
    }

    pub(crate) fn was_delivered(&self) -> bool {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn current_timeout(&self) -> Duration {
        self.retry.lock().current_timeout()
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.retry.lock().retry_count()
    }

    /// Route a retriable error through the retry policy; the error comes
    /// back out once the policy gives up.
    pub(crate) fn attempt_retry(&self, error: Error) -> Result<(), Error> {
        self.retry.lock().retry(error)
    }

    /// The verb the transport should use.
    pub(crate) fn resolved_method(&self) -> &'static str {
        match self.method {
            Method::GetOrPost => {
                if self.legacy_post_body().is_some() {
                    "POST"
                } else {
                    "GET"
                }
            }
            method => method.name(),
        }
    }

    pub(crate) fn transport_body(&self) -> Option<Vec<u8>> {
        match self.method {
            Method::GetOrPost => self.legacy_post_body(),
            _ => self.body(),
        }
    }

    pub(crate) fn headers(&self) -> FxHashMap<String, String> {
        self.handler
            .lock()
            .as_ref()
            .map(|handler| handler.headers())
            .unwrap_or_default()
    }

    pub(crate) fn body(&self) -> Option<Vec<u8>> {
        self.handler.lock().as_ref().and_then(|handler| handler.body())
    }

    pub(crate) fn body_content_type(&self) -> Option<String> {
        self.handler
            .lock()
            .as_ref()
            .map(|handler| handler.body_content_type())
    }

    pub(crate) fn legacy_post_body(&self) -> Option<Vec<u8>> {
        self.handler
            .lock()
            .as_ref()
            .and_then(|handler| handler.legacy_post_body())
    }

    pub(crate) fn parse(&self, response: &NetworkResponse) -> Result<ErasedParsed, Error> {
        match self.handler.lock().as_ref() {
            Some(handler) => handler.parse(response),
            None => Err(ErrorKind::Internal {
                message: "request parsed after it finished".to_string(),
            }
            .into()),
        }
    }

    pub(crate) fn map_error(&self, error: Error) -> Error {
        match self.handler.lock().as_ref() {
            Some(handler) => handler.map_error(error),
            None => error,
        }
    }

    pub(crate) fn deliver_value(&self, value: Box<dyn Any + Send>) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler.deliver(value);
        }
    }

    pub(crate) fn deliver_error(&self, error: Error) {
        if let Some(handler) = self.handler.lock().as_ref() {
            handler.deliver_error(error);
        }
    }

    /// The terminal lifecycle event. Exactly one call does work: it drops
    /// the user's request (and the listeners it closes over) and tells the
    /// owning queue, which releases any coalesced waiters.
    pub(crate) fn finish(self: Arc<Self>, marker: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(request = %self.identifier, marker, "Request finished");
        *self.handler.lock() = None;
        if let Some(core) = self.queue.get().and_then(Weak::upgrade) {
            core.finish(&self);
        }
    }
}

impl fmt::Debug for TrackedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("identifier", &self.identifier)
            .field("method", &self.method)
            .field("url", &self.origin_url)
            .field("priority", &self.priority)
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// SHA-1 over the request descriptor, the wall clock, and a process-wide
/// counter; unique per admission even for identical requests.
fn identifier_for(method: Method, url: &str, counter: u64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!(
        "Request:{}:{url}:{}:{counter}",
        method.name(),
        epoch_millis()
    ));
    hex::encode(hasher.finalize())
}

/// A caller-facing handle to an admitted request.
#[derive(Clone)]
pub struct RequestHandle {
    pub(crate) inner: Arc<TrackedRequest>,
}

impl RequestHandle {
    /// Flag the request as canceled. Non-blocking and idempotent; the
    /// dispatchers observe the flag at the next take or delivery. No
    /// response or error listener fires once cancellation is observed.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    pub fn tag(&self) -> Option<&str> {
        self.inner.tag()
    }

    /// The URL the request currently addresses; reflects redirects.
    pub fn url(&self) -> String {
        self.inner.current_url()
    }

    /// The URL the request was created with.
    pub fn origin_url(&self) -> &str {
        self.inner.origin_url()
    }

    pub fn method(&self) -> Method {
        self.inner.method()
    }

    pub fn cache_key(&self) -> &str {
        self.inner.cache_key()
    }

    /// Unique identifier of this admission.
    pub fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority()
    }

    /// The current per-attempt timeout, as grown by the retry policy.
    pub fn timeout(&self) -> Duration {
        self.inner.current_timeout()
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// A request whose response body is delivered as UTF-8 text.
pub struct StringRequest {
    method: Method,
    url: String,
    priority: Priority,
    retry_policy: RetryPolicy,
    should_cache: bool,
    tag: Option<String>,
    body: Option<Vec<u8>>,
    listener: Box<dyn Fn(String) + Send + Sync>,
    error_listener: Box<dyn Fn(Error) + Send + Sync>,
}

impl StringRequest {
    pub fn new(
        method: Method,
        url: impl Into<String>,
        listener: impl Fn(String) + Send + Sync + 'static,
        error_listener: impl Fn(Error) + Send + Sync + 'static,
    ) -> Self {
        Self {
            method,
            url: url.into(),
            priority: Priority::Normal,
            retry_policy: RetryPolicy::default(),
            should_cache: true,
            tag: None,
            body: None,
            listener: Box::new(listener),
            error_listener: Box::new(error_listener),
        }
    }

    pub fn get(
        url: impl Into<String>,
        listener: impl Fn(String) + Send + Sync + 'static,
        error_listener: impl Fn(Error) + Send + Sync + 'static,
    ) -> Self {
        Self::new(Method::Get, url, listener, error_listener)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[must_use]
    pub fn with_should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

impl Request for StringRequest {
    type Output = String;

    fn method(&self) -> Method {
        self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn body(&self) -> Option<Vec<u8>> {
        self.body.clone()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn should_cache(&self) -> bool {
        self.should_cache
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn parse_network_response(&self, response: &NetworkResponse) -> Result<Parsed<String>, Error> {
        let value = match String::from_utf8(response.data.clone()) {
            Ok(value) => value,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        };
        Ok(Parsed::with_cache_entry(value, entry_from_response(response)))
    }

    fn on_response(&self, value: String) {
        (self.listener)(value);
    }

    fn on_error(&self, error: Error) {
        (self.error_listener)(error);
    }
}

/// A request whose response body is decoded from JSON into `T`.
pub struct JsonRequest<T> {
    method: Method,
    url: String,
    priority: Priority,
    retry_policy: RetryPolicy,
    should_cache: bool,
    tag: Option<String>,
    body: Option<Vec<u8>>,
    listener: Box<dyn Fn(T) + Send + Sync>,
    error_listener: Box<dyn Fn(Error) + Send + Sync>,
}

impl<T> JsonRequest<T> {
    pub fn new(
        method: Method,
        url: impl Into<String>,
        listener: impl Fn(T) + Send + Sync + 'static,
        error_listener: impl Fn(Error) + Send + Sync + 'static,
    ) -> Self {
        Self {
            method,
            url: url.into(),
            priority: Priority::Normal,
            retry_policy: RetryPolicy::default(),
            should_cache: true,
            tag: None,
            body: None,
            listener: Box::new(listener),
            error_listener: Box::new(error_listener),
        }
    }

    pub fn get(
        url: impl Into<String>,
        listener: impl Fn(T) + Send + Sync + 'static,
        error_listener: impl Fn(Error) + Send + Sync + 'static,
    ) -> Self {
        Self::new(Method::Get, url, listener, error_listener)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[must_use]
    pub fn with_should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Attach a JSON request body; the content type becomes
    /// `application/json`.
    #[must_use]
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

impl<T: DeserializeOwned + Send + 'static> Request for JsonRequest<T> {
    type Output = T;

    fn method(&self) -> Method {
        self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn body(&self) -> Option<Vec<u8>> {
        self.body.clone()
    }

    fn body_content_type(&self) -> String {
        "application/json; charset=utf-8".to_string()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn should_cache(&self) -> bool {
        self.should_cache
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn parse_network_response(&self, response: &NetworkResponse) -> Result<Parsed<T>, Error> {
        let value = serde_json::from_slice(&response.data).map_err(Error::parse)?;
        Ok(Parsed::with_cache_entry(value, entry_from_response(response)))
    }

    fn on_response(&self, value: T) {
        (self.listener)(value);
    }

    fn on_error(&self, error: Error) {
        (self.error_listener)(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_low_to_immediate() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Immediate);
    }

    #[test]
    fn identifiers_are_unique_for_identical_requests() {
        let a = TrackedRequest::new(Box::new(TypedRequest(StringRequest::get(
            "http://example.com/a",
            |_| {},
            |_| {},
        ))));
        let b = TrackedRequest::new(Box::new(TypedRequest(StringRequest::get(
            "http://example.com/a",
            |_| {},
            |_| {},
        ))));
        assert_ne!(a.identifier(), b.identifier());
        // 40 hex digits of SHA-1.
        assert_eq!(a.identifier().len(), 40);
    }

    #[test]
    fn default_cache_key_joins_method_and_url() {
        let request = StringRequest::get("http://example.com/a", |_| {}, |_| {});
        assert_eq!(request.cache_key(), "GET:http://example.com/a");
    }

    #[test]
    fn get_or_post_resolution_depends_on_legacy_body() {
        struct Legacy(Option<Vec<u8>>);
        impl Request for Legacy {
            type Output = ();
            fn method(&self) -> Method {
                Method::GetOrPost
            }
            fn url(&self) -> &str {
                "http://example.com/legacy"
            }
            fn legacy_post_body(&self) -> Option<Vec<u8>> {
                self.0.clone()
            }
            fn parse_network_response(&self, _: &NetworkResponse) -> Result<Parsed<()>, Error> {
                Ok(Parsed::new(()))
            }
            fn on_response(&self, _: ()) {}
            fn on_error(&self, _: Error) {}
        }

        let get = TrackedRequest::new(Box::new(TypedRequest(Legacy(None))));
        assert_eq!(get.resolved_method(), "GET");

        let post = TrackedRequest::new(Box::new(TypedRequest(Legacy(Some(b"a=1".to_vec())))));
        assert_eq!(post.resolved_method(), "POST");
        assert_eq!(post.transport_body(), Some(b"a=1".to_vec()));
    }

    #[test]
    fn finish_is_idempotent_and_drops_the_handler() {
        let request = Arc::new(TrackedRequest::new(Box::new(TypedRequest(
            StringRequest::get("http://example.com/a", |_| {}, |_| {}),
        ))));
        request.clone().finish("done");
        assert!(request.handler.lock().is_none());
        // A second finish is a no-op rather than a double notification.
        request.finish("done");
    }
}
