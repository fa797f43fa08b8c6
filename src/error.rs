//! Error taxonomy for guest evaluation.
//!
//! Every failed job lands in exactly one of three kinds. The serialized form
//! uses the `kind` tags callers already match on:
//!
//! - `error-eval-get-dependencies`: a specifier had no mapping, or a network
//!   dependency could not be fetched. Nothing was executed.
//! - `error-eval-timeout`: the job overran its budget and the isolation
//!   context was discarded.
//! - `error-eval-runtime`: the guest threw, produced a value that cannot be
//!   transported, or the context could not be reached.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix of the message raised when guest code reads a non-whitelisted name.
pub const SECURITY_EXCEPTION_PREFIX: &str = "Security Exception: cannot access: ";

/// An `Error` object raised inside the guest, reduced to transportable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Detail attached to a dependency or runtime failure.
///
/// Guest `Error` objects keep their structure; any other thrown value (or a
/// host-side failure) is carried in its string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Message(String),
    Error(GuestError),
}

impl ErrorPayload {
    /// The human-readable message, without the error name.
    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Message(msg) => msg,
            ErrorPayload::Error(err) => &err.message,
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPayload::Message(msg) => f.write_str(msg),
            ErrorPayload::Error(err) => write!(f, "{}: {}", err.name, err.message),
        }
    }
}

impl From<String> for ErrorPayload {
    fn from(msg: String) -> Self {
        ErrorPayload::Message(msg)
    }
}

impl From<&str> for ErrorPayload {
    fn from(msg: &str) -> Self {
        ErrorPayload::Message(msg.to_string())
    }
}

impl From<GuestError> for ErrorPayload {
    fn from(err: GuestError) -> Self {
        ErrorPayload::Error(err)
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EvalError {
    #[serde(rename = "error-eval-get-dependencies")]
    #[error("dependency resolution failed: {error}")]
    Dependencies { error: ErrorPayload },

    #[serde(rename = "error-eval-timeout")]
    #[error("execution timed out")]
    Timeout,

    #[serde(rename = "error-eval-runtime")]
    #[error("runtime error: {error}")]
    Runtime { error: ErrorPayload },
}

impl EvalError {
    pub fn dependencies(error: impl Into<ErrorPayload>) -> Self {
        EvalError::Dependencies {
            error: error.into(),
        }
    }

    pub fn runtime(error: impl Into<ErrorPayload>) -> Self {
        EvalError::Runtime {
            error: error.into(),
        }
    }

    /// The `kind` tag this error serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::Dependencies { .. } => "error-eval-get-dependencies",
            EvalError::Timeout => "error-eval-timeout",
            EvalError::Runtime { .. } => "error-eval-runtime",
        }
    }

    /// True when guest code tripped the capability whitelist.
    pub fn is_security_violation(&self) -> bool {
        match self {
            EvalError::Runtime { error } => error.message().starts_with(SECURITY_EXCEPTION_PREFIX),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependency_error_shape() {
        let err = EvalError::dependencies("No URL found for lodash");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"kind": "error-eval-get-dependencies", "error": "No URL found for lodash"})
        );
    }

    #[test]
    fn test_timeout_has_no_payload() {
        assert_eq!(
            serde_json::to_value(EvalError::Timeout).unwrap(),
            json!({"kind": "error-eval-timeout"})
        );
    }

    #[test]
    fn test_runtime_error_object_survives_parse() {
        let raw = json!({
            "kind": "error-eval-runtime",
            "error": {"name": "ReferenceError", "message": "B is not defined"}
        });
        let err: EvalError = serde_json::from_value(raw).unwrap();
        assert_eq!(err.kind(), "error-eval-runtime");
        assert_eq!(err.to_string(), "runtime error: ReferenceError: B is not defined");
    }

    #[test]
    fn test_security_violation_detection() {
        let err = EvalError::runtime(GuestError {
            name: "Error".into(),
            message: format!("{}Deno", SECURITY_EXCEPTION_PREFIX),
            stack: None,
        });
        assert!(err.is_security_violation());
        assert!(!EvalError::runtime("boom").is_security_violation());
        assert!(!EvalError::Timeout.is_security_violation());
    }
}
