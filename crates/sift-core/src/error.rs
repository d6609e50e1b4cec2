use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes surfaced by the index lifecycle subsystem.
///
/// The set is closed on purpose: callers branch on the code, not on the
/// message, and every failure in this workspace maps onto exactly one of
/// these four.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed input, schema/validation failure, or policy violation.
    /// Never retried.
    InvalidRequest,
    /// Missing build root, manifest entry, or frozen data. Not retried.
    NotFound,
    /// Lock contention surfaced to the caller instead of queuing.
    /// Retryable at a higher level.
    QueueOverloaded,
    /// Invariant violation; should not occur in correct operation.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::QueueOverloaded => "QUEUE_OVERLOADED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Errors produced by index reference resolution, build state persistence,
/// snapshot management, and diff computation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("queue overloaded: {message}")]
    QueueOverloaded { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    pub fn queue_overloaded(message: impl Into<String>) -> Self {
        Error::QueueOverloaded {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::QueueOverloaded { .. } => ErrorCode::QueueOverloaded,
            Error::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::InvalidRequest { message }
            | Error::NotFound { message }
            | Error::QueueOverloaded { message }
            | Error::Internal { message } => message,
        }
    }

    /// Structured form for CLI-style callers: `{ok:false, code, message}`.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "ok": false,
            "code": self.code().as_str(),
            "message": self.message(),
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal {
            message: format!("io error: {err}"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidRequest {
            message: format!("json error: {err}"),
        }
    }
}
