//! Broker call error types.
//!
//! Errors are classified by what the maintainer should do next:
//!
//! - **Transient** errors are retried after the maintainer retry interval
//! - **Permanent** errors fail the operation
//! - **Gone** means the broker no longer knows the resource, which is the
//!   outcome a deletion wanted in the first place
//! - **Ambiguous** errors leave the side effect unknown (timeouts, gateway
//!   failures mid-request) and are routed to orphan mitigation

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The kind of broker error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Safe to retry: 429, 5xx other than gateway timeouts, 422 concurrency
    /// errors, connection refused before the request was sent.
    Transient,

    /// Retrying will not help: most 4xx responses.
    Permanent,

    /// The broker reports the resource as already absent (HTTP 410).
    Gone,

    /// The request may or may not have taken effect.
    Ambiguous,
}

impl BrokerErrorKind {
    /// Returns true if the same request may simply be sent again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerErrorKind::Transient)
    }
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerErrorKind::Transient => "transient",
            BrokerErrorKind::Permanent => "permanent",
            BrokerErrorKind::Gone => "gone",
            BrokerErrorKind::Ambiguous => "ambiguous",
        };
        f.write_str(s)
    }
}

/// A classified error from a broker call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,

    /// The HTTP status code, if the broker answered at all.
    pub status_code: Option<u16>,

    pub message: String,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "broker error (HTTP {}): {}", code, self.message),
            None => write!(f, "broker error: {}", self.message),
        }
    }
}

impl BrokerError {
    fn with_kind(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        BrokerError {
            kind,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_kind(BrokerErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_kind(BrokerErrorKind::Permanent, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::with_kind(BrokerErrorKind::Gone, message)
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::with_kind(BrokerErrorKind::Ambiguous, message)
    }

    /// The call did not finish within the action timeout.
    pub fn timed_out(after: Duration) -> Self {
        Self::ambiguous(format!("broker call timed out after {}s", after.as_secs()))
    }

    /// Categorizes an HTTP error response from a broker.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status_code {
            410 => BrokerErrorKind::Gone,
            408 | 504 => BrokerErrorKind::Ambiguous,
            422 if is_concurrency_error(&message) => BrokerErrorKind::Transient,
            429 => BrokerErrorKind::Transient,
            code if (500..600).contains(&code) => BrokerErrorKind::Transient,
            _ => BrokerErrorKind::Permanent,
        };
        BrokerError {
            kind,
            status_code: Some(status_code),
            message,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Brokers answer 422 `ConcurrencyError` while another operation on the
/// same instance is still running.
fn is_concurrency_error(message: &str) -> bool {
    message.contains("ConcurrencyError")
}
