use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

pub(crate) type SharedError = Arc<dyn StdError + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Io,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Io => "io",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdapterStage {
    Request,
    Response,
}

impl std::fmt::Display for AdapterStage {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Request => "request",
            Self::Response => "response",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    AdapterRejected,
    Transport,
    Timeout,
    ResponseBodyTooLarge,
    HttpStatus,
    Decode,
    Deallocated,
    BarrierTornDown,
    Cancelled,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    SerializeForm,
    RequestBuild,
    CacheMiss,
    CacheIo,
    SchedulerClosed,
    RuntimeUnavailable,
    TlsConfig,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdapterRejected => "adapter_rejected",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::Decode => "decode",
            Self::Deallocated => "deallocated",
            Self::BarrierTornDown => "barrier_torn_down",
            Self::Cancelled => "cancelled",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::SerializeForm => "serialize_form",
            Self::RequestBuild => "request_build",
            Self::CacheMiss => "cache_miss",
            Self::CacheIo => "cache_io",
            Self::SchedulerClosed => "scheduler_closed",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::TlsConfig => "tls_config",
        }
    }
}

/// Every failure the pipeline can deliver.
///
/// `Error` is `Clone` so a call barrier can hand the same failure to every
/// waiter it serves.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{stage} adapter rejected the exchange: {message}")]
    AdapterRejected {
        stage: AdapterStage,
        message: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        request_headers: Box<HeaderMap>,
        body: Option<Bytes>,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Decode {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
    #[error("pending continuation was dropped before it was resumed")]
    Deallocated,
    #[error("call barrier was torn down while the call was pending")]
    BarrierTornDown,
    #[error("task was cancelled")]
    Cancelled,
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: Arc<serde_urlencoded::ser::Error>,
    },
    #[error("failed to build http request: {message}")]
    RequestBuild { message: String },
    #[error("no cached payload for the request")]
    CacheMiss,
    #[error("cache storage i/o failed at {path}: {source}")]
    CacheIo {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("task scheduler is closed")]
    SchedulerClosed,
    #[error("no tokio runtime available; build the client inside a runtime or pass one with runtime(..)")]
    RuntimeUnavailable,
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AdapterRejected { .. } => ErrorCode::AdapterRejected,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::Deallocated => ErrorCode::Deallocated,
            Self::BarrierTornDown => ErrorCode::BarrierTornDown,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::CacheMiss => ErrorCode::CacheMiss,
            Self::CacheIo { .. } => ErrorCode::CacheIo,
            Self::SchedulerClosed => ErrorCode::SchedulerClosed,
            Self::RuntimeUnavailable => ErrorCode::RuntimeUnavailable,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
        }
    }

    pub fn rejected(stage: AdapterStage, message: impl Into<String>) -> Self {
        Self::AdapterRejected {
            stage,
            message: message.into(),
            source: None,
        }
    }

    pub fn rejected_by<E>(stage: AdapterStage, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::AdapterRejected {
            stage,
            message: source.to_string(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn is_http_status(&self) -> bool {
        matches!(self, Self::HttpStatus { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match self {
            Self::HttpStatus { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    pub fn response_headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::HttpStatus { headers, .. } => Some(headers),
            _ => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
