use std::sync::Arc;

use http::{Method, StatusCode};
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    ConnectFailed,
    ConnectTimeout,
    ReadTimeout,
    OtherIo,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ConnectFailed => "connect_failed",
            Self::ConnectTimeout => "connect_timeout",
            Self::ReadTimeout => "read_timeout",
            Self::OtherIo => "other_io",
        };
        formatter.write_str(text)
    }
}

/// Failure reported by a [`Transport`](crate::Transport) for a single send.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

/// Failure of the authentication exchange itself. Never retried by the provider.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    #[error("auth endpoint {uri} answered {status}: {body}")]
    Status {
        status: u16,
        uri: String,
        body: String,
    },
    #[error("auth endpoint {uri} unreachable: {source}")]
    Transport {
        uri: String,
        #[source]
        source: TransportError,
    },
    #[error("auth endpoint {uri} returned no token")]
    MissingToken { uri: String },
    #[error("auth endpoint {uri} timed out after {timeout_ms}ms")]
    Timeout { uri: String, timeout_ms: u128 },
    #[error("auth exchange for {uri} ended without a result")]
    Abandoned { uri: String },
}

/// Coarse classification a [`RetryPolicy`](crate::RetryPolicy) decides on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transport(TransportErrorKind),
    Unauthorized,
    ClientError(StatusCode),
    ServerError(StatusCode),
    AuthRefresh,
    Local,
}

impl FailureClass {
    pub fn from_status(status: StatusCode) -> Option<Self> {
        if status == StatusCode::UNAUTHORIZED {
            return Some(Self::Unauthorized);
        }
        if status.is_server_error() {
            return Some(Self::ServerError(status));
        }
        if status.is_client_error() {
            return Some(Self::ClientError(status));
        }
        None
    }

    pub fn status(self) -> Option<StatusCode> {
        match self {
            Self::ClientError(status) | Self::ServerError(status) => Some(status),
            Self::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Serialize,
    Deserialize,
    TransportBuild,
    Transport,
    Unauthorized,
    ClientStatus,
    ServerStatus,
    AuthRefresh,
    RetryBudgetExhausted,
    DeadlineExceeded,
    ConcurrencyLimitClosed,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Serialize => "serialize",
            Self::Deserialize => "deserialize",
            Self::TransportBuild => "transport_build",
            Self::Transport => "transport",
            Self::Unauthorized => "unauthorized",
            Self::ClientStatus => "client_status",
            Self::ServerStatus => "server_status",
            Self::AuthRefresh => "auth_refresh",
            Self::RetryBudgetExhausted => "retry_budget_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ConcurrencyLimitClosed => "concurrency_limit_closed",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to build http transport: {message}")]
    TransportBuild { message: String },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("unauthorized (after_refresh={after_refresh}) for {method} {uri}: {body}")]
    Unauthorized {
        method: Method,
        uri: String,
        body: String,
        after_refresh: bool,
    },
    #[error("http client error {status} for {method} {uri}: {body}")]
    ClientStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("http server error {status} for {method} {uri}: {body}")]
    ServerStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error(
        "credential refresh failed after {unauthorized_status} ({unauthorized_body}) for {method} {uri}: {source}"
    )]
    AuthRefresh {
        unauthorized_status: u16,
        unauthorized_body: String,
        method: Method,
        uri: String,
        #[source]
        source: Arc<AuthError>,
    },
    #[error("retry budget exhausted after {attempts} attempts for {method} {uri}: {last}")]
    RetryBudgetExhausted {
        attempts: usize,
        method: Method,
        uri: String,
        #[source]
        last: Box<Error>,
    },
    #[error("http call deadline exceeded after {timeout_ms}ms for {method} {uri}")]
    DeadlineExceeded {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("call concurrency limiter is closed")]
    ConcurrencyLimitClosed,
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::TransportBuild { .. } => ErrorCode::TransportBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::ClientStatus { .. } => ErrorCode::ClientStatus,
            Self::ServerStatus { .. } => ErrorCode::ServerStatus,
            Self::AuthRefresh { .. } => ErrorCode::AuthRefresh,
            Self::RetryBudgetExhausted { .. } => ErrorCode::RetryBudgetExhausted,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::ConcurrencyLimitClosed => ErrorCode::ConcurrencyLimitClosed,
        }
    }

    /// HTTP status carried by this failure, looking through an exhausted retry budget.
    pub fn status(&self) -> Option<StatusCode> {
        let raw = match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED.as_u16(),
            Self::ClientStatus { status, .. } | Self::ServerStatus { status, .. } => *status,
            Self::AuthRefresh {
                unauthorized_status,
                ..
            } => *unauthorized_status,
            Self::RetryBudgetExhausted { last, .. } => return last.status(),
            _ => return None,
        };
        StatusCode::from_u16(raw).ok()
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Transport { kind, .. } => FailureClass::Transport(*kind),
            Self::Unauthorized { .. } => FailureClass::Unauthorized,
            Self::ClientStatus { status, .. } => StatusCode::from_u16(*status)
                .map(FailureClass::ClientError)
                .unwrap_or(FailureClass::Local),
            Self::ServerStatus { status, .. } => StatusCode::from_u16(*status)
                .map(FailureClass::ServerError)
                .unwrap_or(FailureClass::Local),
            Self::AuthRefresh { .. } => FailureClass::AuthRefresh,
            Self::RetryBudgetExhausted { last, .. } => last.failure_class(),
            _ => FailureClass::Local,
        }
    }
}
