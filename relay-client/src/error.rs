use http::StatusCode;
use thiserror::Error;

/// Errors from a single poll of the relay server's request queue.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay had no queued request within its long-poll window (HTTP
    /// 408). Normal; the worker polls again immediately.
    #[error("no request received within the relay timeout")]
    Timeout,

    /// The relay denied access (HTTP 403). Fatal for the whole process.
    #[error("relay server denied access")]
    Forbidden,

    /// The relay could not be reached at all. Fatal for the whole process.
    #[error("connection to relay server refused")]
    ConnectionRefused,

    /// Any other non-2xx relay status.
    #[error("relay server status {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The relay answered 200 but the payload did not decode.
    #[error("failed to decode relay request: {0}")]
    Malformed(#[from] prost::DecodeError),

    /// Transport-level failure (connect, TLS, read, request timeout).
    #[error("relay transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from posting a response chunk to the relay server.
#[derive(Debug, Error)]
pub enum PostError {
    /// HTTP 400: the relay lost this request's context (likely a restart).
    /// Retrying the chunk is pointless; the request is aborted.
    #[error("relay rejected the response chunk: {0}")]
    Permanent(String),

    /// Anything else; retried with backoff.
    #[error("failed to post response chunk: {0}")]
    Transient(String),
}

/// Errors building a backend request from a pulled relay request.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid request url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to read authentication token from {path}: {source}")]
    TokenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build backend request: {0}")]
    Http(#[from] http::Error),
}

/// Conditions that terminate the whole client rather than a single request.
/// A misconfigured client in a production fleet should restart rather than
/// silently spin.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to authenticate to relay server, restarting: {0}")]
    Forbidden(#[source] RelayError),

    #[error("failed to connect to relay server, restarting: {0}")]
    ConnectionRefused(#[source] RelayError),

    #[error("all relay workers exited")]
    WorkersExited,
}

/// Walks an error's source chain looking for a refused TCP connection.
pub(crate) fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = err.source();
    }
    false
}
