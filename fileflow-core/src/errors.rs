//! # Error classification
//!
//! Domain crates keep their own `thiserror` enums. Each enum maps its
//! variants onto an [`ErrorKind`] so a transport layer can pick a status
//! code without knowing the domain.

/// HTTP-equivalent error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,         // 400
    NotFound,           // 404
    Timeout,            // 408
    Conflict,           // 409
    Gone,               // 410
    PreconditionFailed, // 412
    Unprocessable,      // 422
    TooManyRequests,    // 429
    GeneralError,       // 500
    BadGateway,         // 502
    Unavailable,        // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Conflict => 409,
            ErrorKind::Gone => 410,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::Unprocessable => 422,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::GeneralError => 500,
            ErrorKind::BadGateway => 502,
            ErrorKind::Unavailable => 503,
        }
    }

    /// Error `name` (e.g. "NotFound")
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Gone => "Gone",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::Unprocessable => "Unprocessable",
            ErrorKind::TooManyRequests => "TooManyRequests",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::BadGateway => "BadGateway",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    /// Kebab-cased class name
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Gone => "gone",
            ErrorKind::PreconditionFailed => "precondition-failed",
            ErrorKind::Unprocessable => "unprocessable",
            ErrorKind::TooManyRequests => "too-many-requests",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::BadGateway => "bad-gateway",
            ErrorKind::Unavailable => "unavailable",
        }
    }

    pub fn from_status_code(code: u16) -> Option<ErrorKind> {
        match code {
            400 => Some(ErrorKind::BadRequest),
            404 => Some(ErrorKind::NotFound),
            408 => Some(ErrorKind::Timeout),
            409 => Some(ErrorKind::Conflict),
            410 => Some(ErrorKind::Gone),
            412 => Some(ErrorKind::PreconditionFailed),
            422 => Some(ErrorKind::Unprocessable),
            429 => Some(ErrorKind::TooManyRequests),
            500 => Some(ErrorKind::GeneralError),
            502 => Some(ErrorKind::BadGateway),
            503 => Some(ErrorKind::Unavailable),
            _ => None,
        }
    }

    /// Server-side classes (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.status_code())
    }
}

/// Implemented by every domain error enum.
pub trait Classified {
    fn kind(&self) -> ErrorKind;

    /// Whether the same call may succeed if repeated unchanged.
    fn is_retryable(&self) -> bool {
        false
    }
}
