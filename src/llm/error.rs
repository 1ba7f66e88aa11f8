//! LLM error types with retry classification.
//!
//! Distinguishes transient errors (retry the same model), rate limits (stop
//! retrying, cool down, advance to the next model) and permanent errors.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Error from a single LLM provider call.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Retry-After hint from the provider
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Create a rate limit error.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    /// Create a server error (5xx, overloaded).
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::ServerError,
            status_code: Some(status_code),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            status_code: Some(status_code),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a network error (timeout, connection failure).
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a parse error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Structured output did not match its schema.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::Validation,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify a free-form failure message (e.g. from an SDK or proxy).
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_message(&message) {
            Self::rate_limited(message, None)
        } else if is_transient_message(&message) {
            Self {
                kind: LlmErrorKind::ServerError,
                status_code: None,
                message,
                retry_after: None,
            }
        } else {
            Self {
                kind: LlmErrorKind::ClientError,
                status_code: None,
                message,
                retry_after: None,
            }
        }
    }

    /// Retry the same model after a backoff.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == LlmErrorKind::RateLimited
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of LLM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429) - not retried on the same model; cooldown then fallback
    RateLimited,
    /// Server error (500, 502, 503, 504, 529) or "overloaded" - transient
    ServerError,
    /// Client error (400, 401, 403, 404) - permanent
    ClientError,
    /// Network error (connection failed, timeout) - transient
    NetworkError,
    /// Response could not be parsed - permanent for this model
    ParseError,
    /// Structured output failed validation - permanent for this model
    Validation,
}

impl LlmErrorKind {
    /// Check if this error kind is transient (retry with the same model).
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmErrorKind::ServerError | LlmErrorKind::NetworkError)
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
            LlmErrorKind::Validation => write!(f, "Validation error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500 | 502 | 503 | 504 | 529 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "temporary",
    "unavailable",
    "bad gateway",
    "internal server error",
    "overloaded",
];

/// Status codes only count as whole numbers, so `max_tokens 1500` is not a 500.
fn rate_limit_status() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b429\b").expect("valid status pattern"))
}

fn transient_status() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:500|502|503|504|529)\b").expect("valid status pattern"))
}

/// Whether a message reads like a rate-limit rejection.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) || rate_limit_status().is_match(&lower)
}

/// Whether a message reads like a transient upstream failure.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) || transient_status().is_match(&lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmErrorKind::ServerError.is_transient());
        assert!(LlmErrorKind::NetworkError.is_transient());
        assert!(!LlmErrorKind::RateLimited.is_transient());
        assert!(!LlmErrorKind::ClientError.is_transient());
        assert!(!LlmErrorKind::ParseError.is_transient());
        assert!(!LlmErrorKind::Validation.is_transient());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(500), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(503), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(529), LlmErrorKind::ServerError);
        assert_eq!(classify_http_status(400), LlmErrorKind::ClientError);
        assert_eq!(classify_http_status(401), LlmErrorKind::ClientError);
    }

    #[test]
    fn test_message_classification() {
        assert!(LlmError::from_message("Too Many Requests").is_rate_limit());
        assert!(LlmError::from_message("provider quota exceeded").is_rate_limit());
        assert!(LlmError::from_message("Anthropic is overloaded").is_transient());
        assert!(LlmError::from_message("connection reset by peer").is_transient());

        let permanent = LlmError::from_message("invalid api key");
        assert!(!permanent.is_transient());
        assert!(!permanent.is_rate_limit());
    }

    #[test]
    fn test_status_codes_match_whole_numbers_only() {
        assert!(is_transient_message("upstream returned 502"));
        assert!(is_transient_message("HTTP 503: try later"));
        assert!(is_rate_limit_message("status=429"));

        assert!(!is_transient_message("max_tokens 1500 exceeds model limit of 4096"));
        assert!(!is_transient_message("prompt is 25029 tokens long"));
        assert!(!is_rate_limit_message("field 14290 is invalid"));
        assert!(!LlmError::from_message("max_tokens: 1500 > 1024").is_transient());
    }

    #[test]
    fn test_display_includes_status() {
        let err = LlmError::server_error(503, "down");
        assert_eq!(err.to_string(), "Server error (HTTP 503): down");
        let err = LlmError::validation("sections empty");
        assert_eq!(err.to_string(), "Validation error: sections empty");
    }
}
