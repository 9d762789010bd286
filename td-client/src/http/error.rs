use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;

use crate::{codec, parser};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A non-successful response returned by the service.
    #[error(transparent)]
    Response(#[from] ErrorResponse),

    /// Every attempt failed with a retryable error and the backoff budget is spent.
    #[error("retrying stopped after {attempts} attempts and {} seconds: {source}", cumulative_delay.as_secs())]
    RetryExhausted {
        attempts: usize,
        cumulative_delay: Duration,
        source: Box<Error>,
    },

    /// An error from the HTTP client: connection, timeout, or body transfer.
    #[error(transparent)]
    HttpClient(#[from] reqwest::Error),

    /// The client stopped waiting. The remote operation is not affected.
    #[error("timed out waiting for {operation} after {} seconds", elapsed.as_secs())]
    WaitTimeout { operation: String, elapsed: Duration },

    /// Rejected before any network call.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Rejected before any network call.
    #[error("unknown format: {0}")]
    UnknownFormat(String),

    #[error("the client has been closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] codec::Error),

    #[error(transparent)]
    Parser(#[from] parser::Error),

    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the transport may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::HttpClient(e) => !e.is_builder(),
            Error::Response(e) => e.status >= 500,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Response(e) => Some(e.status),
            Error::RetryExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401
    Authentication,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 409
    AlreadyExists,
    Api,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::AlreadyExists,
            _ => ErrorKind::Api,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    /// HTTP status code.
    pub status: u16,
    /// What the client was doing, e.g. `Show job failed`.
    pub message: String,
    /// Raw response body.
    pub body: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status.as_u16()),
            status: status.as_u16(),
            message: message.into(),
            body: body.into(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}: {}", self.message, self.status, self.body)
    }
}

impl std::error::Error for ErrorResponse {}

#[cfg(test)]
mod test {
    use reqwest::StatusCode;

    use crate::http::error::{Error, ErrorKind, ErrorResponse};

    #[test]
    fn classify_status() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Authentication);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Forbidden);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(409), ErrorKind::AlreadyExists);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::Api);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Api);
    }

    #[test]
    fn display_contains_status_and_body() {
        let e = ErrorResponse::new(StatusCode::NOT_FOUND, "Show job failed", "{\"error\":\"missing\"}");
        assert_eq!(e.to_string(), "Show job failed: 404: {\"error\":\"missing\"}");
        let e = Error::from(e);
        assert_eq!(e.status(), Some(404));
        assert!(!e.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let e = Error::from(ErrorResponse::new(StatusCode::BAD_GATEWAY, "Get failed", ""));
        assert!(e.is_retryable());
        assert!(!Error::Validation("x".into()).is_retryable());
    }
}
