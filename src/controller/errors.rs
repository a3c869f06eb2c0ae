//! Failure classification
//!
//! Every error reaching the sync path is mapped to an [`ErrorCategory`].
//! The category decides whether the retry layer tries again and which
//! failure reason is reported for the target.
//!
//! Typed errors are matched first while walking the `source()` chain:
//! an explicitly tagged [`ClientError`], a Kubernetes API status, an I/O
//! timeout, or an elapsed tokio deadline. Only when nothing in the chain
//! is recognised do the message heuristics apply.

use crate::controller::client::ClientError;
use std::error::Error as StdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    None,
    Rbac,
    Transient,
    Permanent,
}

impl ErrorCategory {
    /// Only transient failures are worth another attempt
    pub fn is_retryable(self) -> bool {
        self == ErrorCategory::Transient
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::None => "none",
            ErrorCategory::Rbac => "rbac",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

/// Classify an optional error; `None` means the call succeeded
pub fn classify(err: Option<&(dyn StdError + 'static)>) -> ErrorCategory {
    let Some(err) = err else {
        return ErrorCategory::None;
    };

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(category) = typed_category(e) {
            return category;
        }
        current = e.source();
    }

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(category) = message_category(&e.to_string()) {
            return category;
        }
        current = e.source();
    }

    ErrorCategory::Permanent
}

/// Classify a Kubernetes API status by HTTP code and status reason
pub fn classify_status(code: u16, reason: &str) -> ErrorCategory {
    match (code, reason) {
        (401 | 403, _) | (_, "Unauthorized" | "Forbidden") => ErrorCategory::Rbac,
        (429 | 504, _) | (_, "TooManyRequests" | "Timeout" | "ServerTimeout") => {
            ErrorCategory::Transient
        }
        _ => ErrorCategory::Permanent,
    }
}

fn typed_category(e: &(dyn StdError + 'static)) -> Option<ErrorCategory> {
    if let Some(client) = e.downcast_ref::<ClientError>() {
        return match client {
            ClientError::Tagged { category, .. } => Some(*category),
            ClientError::Conflict(_) | ClientError::InvalidSelector(_) => {
                Some(ErrorCategory::Permanent)
            }
            // Decided by the wrapped kube error further down the chain
            ClientError::Kube(_) => None,
        };
    }

    if let Some(kube::Error::Api(status)) = e.downcast_ref::<kube::Error>() {
        return Some(classify_status(status.code, &status.reason));
    }

    if let Some(io) = e.downcast_ref::<std::io::Error>() {
        return match io.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted => Some(ErrorCategory::Transient),
            _ => None,
        };
    }

    if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return Some(ErrorCategory::Transient);
    }

    None
}

fn message_category(message: &str) -> Option<ErrorCategory> {
    let message = message.to_ascii_lowercase();

    if message.contains("forbidden") || message.contains("unauthorized") {
        return Some(ErrorCategory::Rbac);
    }

    const TRANSIENT_HINTS: [&str; 6] = [
        "too many requests",
        "timeout",
        "timed out",
        "deadline exceeded",
        "context canceled",
        "cancelled",
    ];
    if TRANSIENT_HINTS.iter().any(|hint| message.contains(hint)) {
        return Some(ErrorCategory::Transient);
    }

    None
}
