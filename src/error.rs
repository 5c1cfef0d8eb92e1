use thiserror::Error;

use crate::request::Method;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} transport failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn dns(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Dns, message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Tls, message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("credential refresh failed: {message}")]
pub struct RefreshError {
    pub message: String,
}

impl RefreshError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    InvalidUrl,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    Deserialize,
    Transport,
    Timeout,
    HttpStatus,
    AuthExpired,
    Interceptor,
    Cancelled,
    ChunkUpload,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::Deserialize => "deserialize",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::AuthExpired => "auth_expired",
            Self::Interceptor => "interceptor",
            Self::Cancelled => "cancelled",
            Self::ChunkUpload => "chunk_upload",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("failed to serialize request json: {message}")]
    SerializeJson { message: String },
    #[error("failed to decode response json: {message}; body={body}")]
    Deserialize { message: String, body: String },
    #[error("http transport error ({kind}) for {method} {url}: {message}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        url: String,
        message: String,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {url}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        url: String,
    },
    #[error("http status error {status} for {method} {url}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        url: String,
        body: String,
    },
    #[error("authentication expired for {method} {url}: {detail}")]
    AuthExpired {
        method: Method,
        url: String,
        detail: String,
    },
    #[error("interceptor {interceptor} rejected {method} {url}: {message}")]
    Interceptor {
        interceptor: String,
        method: Method,
        url: String,
        message: String,
    },
    #[error("request cancelled: {method} {url}")]
    Cancelled { method: Method, url: String },
    #[error("chunk {chunk_index} failed after {attempts} attempts: {source}")]
    ChunkUpload {
        chunk_index: usize,
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::InvalidHeaderName { .. } => ErrorKind::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorKind::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorKind::SerializeJson,
            Self::Deserialize { .. } => ErrorKind::Deserialize,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::AuthExpired { .. } => ErrorKind::AuthExpired,
            Self::Interceptor { .. } => ErrorKind::Interceptor,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ChunkUpload { .. } => ErrorKind::ChunkUpload,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::AuthExpired { .. } => Some(401),
            Self::ChunkUpload { source, .. } => source.status(),
            _ => None,
        }
    }
}
