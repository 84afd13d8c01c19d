use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::pool::BufferPool;

/// One finished HTTP exchange. Statuses are data here, not errors — the
/// network stage classifies 3xx/4xx/5xx itself.
#[derive(Debug)]
pub struct HttpExchange {
    pub status: u16,
    pub headers: FxHashMap<String, String>,
    pub body: Vec<u8>,
}

/// Failures below the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket or connect timeout; the retry policy decides what happens.
    #[error("the request timed out")]
    Timeout,

    /// No HTTP response was obtained at all.
    #[error("could not reach the server")]
    Connection(#[source] io::Error),

    /// Response headers arrived, but reading the body failed.
    #[error("the connection failed while reading the response body")]
    Io(#[source] io::Error),
}

/// Everything one attempt needs.
#[derive(Debug)]
pub struct TransportRequest<'a> {
    /// Resolved HTTP verb.
    pub method: &'a str,
    /// Current URL; already points at the redirect target once a 3xx was
    /// observed.
    pub url: &'a str,
    /// User headers merged with the conditional cache headers.
    pub headers: &'a FxHashMap<String, String>,
    pub body: Option<&'a [u8]>,
    pub content_type: Option<&'a str>,
    /// Per-attempt timeout from the retry policy.
    pub timeout: Duration,
}

/// Executes one HTTP exchange. The trait is the seam for tests and for
/// embedders with their own HTTP stack; implementations must honor the
/// per-attempt timeout and must not follow redirects.
pub trait Transport: Send + Sync + 'static {
    fn perform(&self, request: &TransportRequest<'_>) -> Result<HttpExchange, TransportError>;
}

/// Chunk size for pool-backed body reads.
const BODY_SCRATCH_LEN: usize = 4_096;

/// Cap on the `Content-Length` preallocation hint.
const MAX_PREALLOC: usize = 1 << 20;

/// The default transport: a blocking `ureq` agent with redirects disabled so
/// the pipeline observes 3xx responses itself.
pub struct UreqTransport {
    agent: ureq::Agent,
    pool: Arc<BufferPool>,
}

impl UreqTransport {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let agent = ureq::AgentBuilder::new().redirects(0).build();
        Self { agent, pool }
    }

    fn exchange_from(&self, response: ureq::Response) -> Result<HttpExchange, TransportError> {
        let status = response.status();
        let mut headers = FxHashMap::default();
        for name in response.headers_names() {
            if let Some(value) = response.header(&name) {
                headers.insert(name.clone(), value.to_string());
            }
        }
        let hint = response
            .header("Content-Length")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        let mut reader = response.into_reader();
        let body = self
            .read_body(&mut reader, hint)
            .map_err(TransportError::Io)?;
        Ok(HttpExchange {
            status,
            headers,
            body,
        })
    }

    fn read_body(&self, reader: &mut impl Read, hint: usize) -> io::Result<Vec<u8>> {
        let mut body = Vec::with_capacity(hint.min(MAX_PREALLOC));
        let mut scratch = self.pool.acquire(BODY_SCRATCH_LEN);
        let result = copy_into(reader, &mut scratch, &mut body);
        self.pool.release(scratch);
        result?;
        Ok(body)
    }
}

fn copy_into(reader: &mut impl Read, scratch: &mut [u8], out: &mut Vec<u8>) -> io::Result<()> {
    loop {
        let read = reader.read(scratch)?;
        if read == 0 {
            return Ok(());
        }
        out.extend_from_slice(&scratch[..read]);
    }
}

impl Transport for UreqTransport {
    fn perform(&self, request: &TransportRequest<'_>) -> Result<HttpExchange, TransportError> {
        trace!(method = request.method, url = request.url, timeout = ?request.timeout, "Transport attempt");

        let mut req = self
            .agent
            .request(request.method, request.url)
            .timeout(request.timeout);
        for (name, value) in request.headers {
            req = req.set(name, value);
        }

        let result = match request.body {
            Some(body) => {
                if let Some(content_type) = request.content_type {
                    req = req.set("Content-Type", content_type);
                }
                req.send_bytes(body)
            }
            None => req.call(),
        };

        match result {
            Ok(response) => self.exchange_from(response),
            // 4xx/5xx still carry a response worth reading.
            Err(ureq::Error::Status(_, response)) => self.exchange_from(response),
            Err(ureq::Error::Transport(transport)) => {
                if error_chain_has_timeout(&transport) {
                    Err(TransportError::Timeout)
                } else {
                    Err(TransportError::Connection(io::Error::other(transport)))
                }
            }
        }
    }
}

/// Walk an error's source chain looking for a timed-out I/O error; `ureq`
/// surfaces socket timeouts as nested `io::Error`s.
fn error_chain_has_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}
