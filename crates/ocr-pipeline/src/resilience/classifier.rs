//! Failure classification for retry decisions
//!
//! Maps an [`Error`] onto one of three classes:
//!
//! ```text
//! Error
//! ├── Transient  - timeout, cancellation, rate limit, unavailable, gateway timeout, network
//! ├── Permanent  - invalid argument/operation, bad request, unauthorized, not found
//! └── Unknown    - anything unrecognized (treated as retry-worthy)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Classified failure type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Transient,
    Permanent,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Transient => "transient",
            FailureType::Permanent => "permanent",
            FailureType::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "transient" => FailureType::Transient,
            "permanent" => FailureType::Permanent,
            _ => FailureType::Unknown,
        }
    }
}

const TRANSIENT_STATUS: &[u16] = &[408, 429, 502, 503, 504];
const PERMANENT_STATUS: &[u16] = &[400, 401, 404];

const TRANSIENT_TRANSPORT_KEYWORDS: &[&str] = &[
    "rate limit",
    "too many requests",
    "unavailable",
    "gateway timeout",
    "timed out",
    "network",
    "connection",
];
const PERMANENT_TRANSPORT_KEYWORDS: &[&str] = &["bad request", "unauthorized", "not found"];

const PERMANENT_SERVICE_KEYWORDS: &[&str] = &["invalid", "unsupported", "required"];
const TRANSIENT_SERVICE_KEYWORDS: &[&str] = &["timeout", "unavailable", "busy"];

/// Classify an optional error; a missing error is `Unknown`
pub fn classify_optional(error: Option<&Error>) -> FailureType {
    error.map(classify).unwrap_or(FailureType::Unknown)
}

/// Classify an error into transient, permanent or unknown
pub fn classify(error: &Error) -> FailureType {
    match error {
        Error::Timeout(_) | Error::Cancelled => FailureType::Transient,
        Error::InvalidArgument(_)
        | Error::InvalidOperation(_)
        | Error::Disposed(_)
        | Error::Config(_) => FailureType::Permanent,
        Error::Transport { status, message } => classify_transport(*status, message),
        Error::Service { message, source } => {
            if let Some(inner) = source {
                let inner_type = classify(inner);
                if inner_type != FailureType::Unknown {
                    return inner_type;
                }
            }
            classify_service_message(message)
        }
        // The wrapper only records which processor failed; the cause decides
        Error::ProcessorFailed { source, .. } => classify(source),
        Error::Io(err) => match err.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted => FailureType::Transient,
            _ => FailureType::Unknown,
        },
        Error::RetryExhausted { .. }
        | Error::Storage(_)
        | Error::Serialization(_)
        | Error::Sqlite(_) => FailureType::Unknown,
    }
}

/// Transient and unknown failures are retried; permanent ones are not
pub fn should_retry(error: &Error) -> bool {
    classify(error) != FailureType::Permanent
}

fn classify_transport(status: Option<u16>, message: &str) -> FailureType {
    if let Some(code) = status {
        if TRANSIENT_STATUS.contains(&code) {
            return FailureType::Transient;
        }
        if PERMANENT_STATUS.contains(&code) {
            return FailureType::Permanent;
        }
    }

    let lower = message.to_lowercase();
    if TRANSIENT_TRANSPORT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureType::Transient
    } else if PERMANENT_TRANSPORT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureType::Permanent
    } else {
        FailureType::Unknown
    }
}

fn classify_service_message(message: &str) -> FailureType {
    let lower = message.to_lowercase();
    if PERMANENT_SERVICE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureType::Permanent
    } else if TRANSIENT_SERVICE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureType::Transient
    } else {
        FailureType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_error_is_unknown() {
        assert_eq!(classify_optional(None), FailureType::Unknown);
    }

    #[test]
    fn test_timeout_and_cancellation_are_transient() {
        assert_eq!(classify(&Error::timeout("slow")), FailureType::Transient);
        assert_eq!(classify(&Error::Cancelled), FailureType::Transient);
    }

    #[test]
    fn test_argument_and_state_errors_are_permanent() {
        assert_eq!(classify(&Error::invalid_argument("x")), FailureType::Permanent);
        assert_eq!(classify(&Error::invalid_operation("x")), FailureType::Permanent);
    }

    #[test]
    fn test_transport_by_status() {
        assert_eq!(classify(&Error::transport(Some(429), "")), FailureType::Transient);
        assert_eq!(classify(&Error::transport(Some(503), "")), FailureType::Transient);
        assert_eq!(classify(&Error::transport(Some(504), "")), FailureType::Transient);
        assert_eq!(classify(&Error::transport(Some(400), "")), FailureType::Permanent);
        assert_eq!(classify(&Error::transport(Some(401), "")), FailureType::Permanent);
        assert_eq!(classify(&Error::transport(Some(404), "")), FailureType::Permanent);
    }

    #[test]
    fn test_transport_by_message() {
        assert_eq!(
            classify(&Error::transport(None, "Rate limit exceeded")),
            FailureType::Transient
        );
        assert_eq!(
            classify(&Error::transport(None, "network failure")),
            FailureType::Transient
        );
        assert_eq!(
            classify(&Error::transport(None, "Unauthorized")),
            FailureType::Permanent
        );
        assert_eq!(
            classify(&Error::transport(Some(418), "teapot")),
            FailureType::Unknown
        );
    }

    #[test]
    fn test_service_inspects_inner_first() {
        let err = Error::service_with_source("invalid payload", Error::timeout("upstream"));
        assert_eq!(classify(&err), FailureType::Transient);

        let err = Error::service_with_source("server busy", Error::storage("disk"));
        assert_eq!(classify(&err), FailureType::Transient);
    }

    #[test]
    fn test_service_message_keywords() {
        assert_eq!(classify(&Error::service("Unsupported format")), FailureType::Permanent);
        assert_eq!(classify(&Error::service("field required")), FailureType::Permanent);
        assert_eq!(classify(&Error::service("backend unavailable")), FailureType::Transient);
        assert_eq!(classify(&Error::service("something odd")), FailureType::Unknown);
    }

    #[test]
    fn test_should_retry() {
        assert!(should_retry(&Error::timeout("t")));
        assert!(should_retry(&Error::storage("?")));
        assert!(!should_retry(&Error::invalid_argument("bad")));
    }
}
