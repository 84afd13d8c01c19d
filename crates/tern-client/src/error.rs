use std::io;
use std::time::Duration;

use crate::response::NetworkResponse;

/// An error delivered to a request's error listener.
///
/// The kind carries the failure itself; the wrapper attaches the wall-clock
/// time the request spent in the network stage before failing, when a network
/// exchange was involved.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    kind: Box<ErrorKind>,
    network_time: Option<Duration>,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.kind
    }

    /// Time spent in the network stage, including retries, if the error
    /// surfaced there.
    pub fn network_time(&self) -> Option<Duration> {
        self.network_time
    }

    /// Wrap an arbitrary parser failure.
    pub fn parse(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ErrorKind::Parse(source.into()).into()
    }

    /// Attach the elapsed network time, unless one is already recorded.
    pub(crate) fn with_network_time(mut self, elapsed: Duration) -> Self {
        self.network_time.get_or_insert(elapsed);
        self
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            network_time: None,
        }
    }
}

/// The failure taxonomy of the pipeline.
///
/// `Timeout`, `AuthFailure`, and `Redirect` are routed through the request's
/// retry policy before they surface; the rest are terminal on first sight.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// A socket or connect timeout.
    #[error("the request timed out")]
    Timeout,

    /// The exchange failed before any HTTP response was obtained.
    #[error("no connection could be established")]
    NoConnection(#[source] io::Error),

    /// Response headers arrived but the body could not be read.
    #[error("the connection failed while reading the response body")]
    Network(#[source] io::Error),

    /// The server answered 401 or 403.
    #[error("authentication failure (HTTP {})", .response.status)]
    AuthFailure { response: NetworkResponse },

    /// A 301/302 chain that outlasted the retry policy. The request's URL
    /// already points at the last redirect target.
    #[error("redirected too many times (HTTP {})", .response.status)]
    Redirect { response: NetworkResponse },

    /// Any other non-2xx status.
    #[error("server error (HTTP {})", .response.status)]
    Server { response: NetworkResponse },

    /// The request's parser rejected the response body.
    #[error("failed to parse the response")]
    Parse(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The request URL is not a URL. A programmer error, surfaced instead of
    /// retried.
    #[error("invalid request URL `{url}`")]
    BadUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A dispatcher fault outside the request/response contract, e.g. a
    /// panicking parser.
    #[error("unexpected failure while executing the request: {message}")]
    Internal { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_time_is_set_once() {
        let error = Error::from(ErrorKind::Timeout)
            .with_network_time(Duration::from_millis(120))
            .with_network_time(Duration::from_millis(999));
        assert_eq!(error.network_time(), Some(Duration::from_millis(120)));
    }

    #[test]
    fn display_includes_status() {
        let response = NetworkResponse {
            status: 503,
            ..NetworkResponse::default()
        };
        let error = Error::from(ErrorKind::Server { response });
        assert_eq!(error.to_string(), "server error (HTTP 503)");
    }
}
